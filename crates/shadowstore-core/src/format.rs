//! On-disk binary format for the heap file and identity index
//!
//! All integers are big-endian. Heap layout:
//!
//! ```text
//! At OFFSET 0
//! [clean_shutdown]      1 byte
//! [format_version]      4 bytes
//! [entry_count]         4 bytes
//! [identity_max_length] 4 bytes
//!
//! At OFFSET 256 (start of data area), repeating:
//! [block_size]          4 bytes
//! [usage]               1 byte  (0=unused, 1=prime, 2=mirror, 3=prime-changed, 4=mirror-changed)
//! [instance_version]    8 bytes
//! [schema_version]      4 bytes
//! [identity_size]       1 byte
//! [identity]            identity_max_length bytes (zero padded)
//! [mirror_pointer]      8 bytes (absolute offset of the mirror data area)
//! [prime_data_len]      4 bytes
//! [prime_data]          ...
//! [mirror_data_len]     4 bytes
//! [mirror_data]         ...
//! ```
//!
//! The prime and mirror areas each occupy half of the data area; exactly one
//! of them is active per the usage byte. The identity index file holds a
//! 12-byte header in slot 0 followed by `entries` fixed-size slots.

use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};

/// Heap format version written into the header
pub const HEAP_FORMAT_VERSION: u32 = 1;

/// Heap header size in bytes
pub const HEAP_HEADER_LEN: usize = 13;

/// First byte of the record area; the gap leaves header room for future fields
pub const DATA_AREA_OFFSET: u64 = 256;

/// Record field offsets, relative to the block start
pub const REC_BLOCK_SIZE: u64 = 0;
pub const REC_USAGE: u64 = 4;
pub const REC_INSTANCE_VERSION: u64 = 5;
pub const REC_SCHEMA_VERSION: u64 = 13;
pub const REC_IDENTITY_SIZE: u64 = 17;
pub const REC_IDENTITY: u64 = 18;

/// Index format version written into the index header
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Index header size in bytes (occupies slot 0)
pub const INDEX_HEADER_LEN: usize = 12;

/// Bytes of each index slot reserved for the flag, position and length fields
pub const SLOT_OVERHEAD: u32 = 16;

/// Position sentinel for an empty index slot
pub const EMPTY_POSITION: i64 = -1;

/// Fixed head of a heap record: block_size(4) + usage(1) + instance_version(8)
/// + schema_version(4) + identity_size(1) + identity(max) + mirror_pointer(8)
pub fn record_fixed_len(identity_max_length: u32) -> u64 {
    26 + identity_max_length as u64
}

/// Offset of the mirror pointer field, relative to the block start
pub fn mirror_pointer_offset(identity_max_length: u32) -> u64 {
    REC_IDENTITY + identity_max_length as u64
}

/// Combined prime+mirror capacity allocated for a fresh record. Four times
/// the stored length leaves each half 100% slack for in-place growth.
pub fn data_area_size(payload_len: usize) -> u32 {
    4 * (payload_len as u32 + 4)
}

/// Total block size for a fresh record holding `payload_len` bytes
pub fn block_size_for(payload_len: usize, identity_max_length: u32) -> u32 {
    data_area_size(payload_len) + identity_max_length + 26
}

/// Capacity of one half (prime or mirror) of an existing block's data area
pub fn half_area(block_size: u32, identity_max_length: u32) -> u32 {
    (block_size - identity_max_length - 26) / 2
}

/// Usage tag of a heap record: which half of the data area is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordUsage {
    /// Record is dead; space is never reclaimed without compaction
    Unused = 0,
    /// Prime area holds the active payload
    Prime = 1,
    /// Mirror area holds the active payload
    Mirror = 2,
    /// Prime active, update in progress
    PrimeChanged = 3,
    /// Mirror active, update in progress
    MirrorChanged = 4,
}

impl RecordUsage {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RecordUsage::Unused),
            1 => Some(RecordUsage::Prime),
            2 => Some(RecordUsage::Mirror),
            3 => Some(RecordUsage::PrimeChanged),
            4 => Some(RecordUsage::MirrorChanged),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the record holds live data
    pub fn is_live(self) -> bool {
        !matches!(self, RecordUsage::Unused)
    }

    /// Whether reads must follow the mirror pointer for the active payload
    pub fn mirror_active(self) -> bool {
        matches!(self, RecordUsage::Mirror)
    }
}

/// Heap file header at offset 0
#[derive(Debug, Clone, Copy)]
pub struct HeapHeader {
    pub clean_shutdown: bool,
    pub format_version: u32,
    pub entry_count: u32,
    pub identity_max_length: u32,
}

impl HeapHeader {
    pub fn to_bytes(&self) -> [u8; HEAP_HEADER_LEN] {
        let mut buf = [0u8; HEAP_HEADER_LEN];
        buf[0] = self.clean_shutdown as u8;
        buf[1..5].copy_from_slice(&self.format_version.to_be_bytes());
        buf[5..9].copy_from_slice(&self.entry_count.to_be_bytes());
        buf[9..13].copy_from_slice(&self.identity_max_length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEAP_HEADER_LEN]) -> Self {
        Self {
            clean_shutdown: buf[0] != 0,
            format_version: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            entry_count: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            identity_max_length: u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]),
        }
    }
}

/// Identity index header, stored in slot 0 of the index file
#[derive(Debug, Clone, Copy)]
pub struct IndexHeader {
    pub version: u32,
    pub entries: u32,
    pub slot_size: u32,
}

impl IndexHeader {
    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_LEN] {
        let mut buf = [0u8; INDEX_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..8].copy_from_slice(&self.entries.to_be_bytes());
        buf[8..12].copy_from_slice(&self.slot_size.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; INDEX_HEADER_LEN]) -> Self {
        Self {
            version: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            entries: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            slot_size: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// Encode the heap record identity field: length byte + bytes + zero padding.
/// The result is always `1 + identity_max_length` bytes.
pub fn encode_identity(identity: &str, identity_max_length: u32) -> StoreResult<Vec<u8>> {
    let bytes = identity.as_bytes();
    if bytes.len() > identity_max_length as usize {
        return Err(StoreError::IdentityTooLong {
            length: bytes.len(),
            max: identity_max_length as usize,
        });
    }
    let mut buf = vec![0u8; 1 + identity_max_length as usize];
    buf[0] = bytes.len() as u8;
    buf[1..1 + bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Decode a heap record identity field (length byte + padded bytes)
pub fn decode_identity(buf: &[u8]) -> StoreResult<String> {
    if buf.is_empty() {
        return Err(invalid_data("identity field is empty"));
    }
    let len = buf[0] as usize;
    if buf.len() < 1 + len {
        return Err(invalid_data(&format!(
            "identity length {} exceeds field size {}", len, buf.len() - 1
        )));
    }
    String::from_utf8(buf[1..1 + len].to_vec())
        .map_err(|_| invalid_data("identity is not valid UTF-8"))
}

/// Encode one index/bucket slot. Primary slots interpret the flag as
/// "extended"; bucket entries interpret it as "used".
pub fn encode_slot(flag: bool, position: i64, identity: &str, slot_size: u32) -> StoreResult<Vec<u8>> {
    let bytes = identity.as_bytes();
    let max = (slot_size - SLOT_OVERHEAD) as usize;
    if bytes.len() > max {
        return Err(StoreError::IdentityTooLong { length: bytes.len(), max });
    }
    let mut buf = vec![0u8; slot_size as usize];
    buf[0] = flag as u8;
    buf[1..9].copy_from_slice(&position.to_be_bytes());
    buf[9] = bytes.len() as u8;
    buf[10..10 + bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Decode one index/bucket slot into (flag, position, identity)
pub fn decode_slot(buf: &[u8]) -> StoreResult<(bool, i64, String)> {
    if buf.len() < SLOT_OVERHEAD as usize {
        return Err(StoreError::MalformedIndex {
            path: PathBuf::from("<slot>"),
            reason: format!("slot is {} bytes, need at least {}", buf.len(), SLOT_OVERHEAD),
        });
    }
    let flag = buf[0] != 0;
    let position = i64::from_be_bytes([
        buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
    ]);
    let len = buf[9] as usize;
    if buf.len() < 10 + len {
        return Err(StoreError::MalformedIndex {
            path: PathBuf::from("<slot>"),
            reason: format!("identity length {} exceeds slot size {}", len, buf.len()),
        });
    }
    let identity = String::from_utf8(buf[10..10 + len].to_vec()).map_err(|_| {
        StoreError::MalformedIndex {
            path: PathBuf::from("<slot>"),
            reason: "slot identity is not valid UTF-8".to_string(),
        }
    })?;
    Ok((flag, position, identity))
}

/// Read a big-endian u32 from the start of `buf`
pub(crate) fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Read a big-endian u64 from the start of `buf`
pub(crate) fn be_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

fn invalid_data(message: &str) -> StoreError {
    StoreError::Io {
        path: None,
        kind: std::io::ErrorKind::InvalidData,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        // Fixed head: 4 + 1 + 8 + 4 + 1 + max + 8
        assert_eq!(record_fixed_len(128), 154);
        assert_eq!(mirror_pointer_offset(128), 146);
        assert_eq!(data_area_size(100), 416);
        assert_eq!(block_size_for(100, 128), 416 + 128 + 26);
        assert_eq!(half_area(block_size_for(100, 128), 128), 208);
        // A fresh block always fits its own payload in one half
        assert!(half_area(block_size_for(100, 128), 128) >= 100 + 4);
    }

    #[test]
    fn test_heap_header_roundtrip() {
        let header = HeapHeader {
            clean_shutdown: true,
            format_version: HEAP_FORMAT_VERSION,
            entry_count: 42,
            identity_max_length: 128,
        };
        let decoded = HeapHeader::from_bytes(&header.to_bytes());
        assert!(decoded.clean_shutdown);
        assert_eq!(decoded.format_version, HEAP_FORMAT_VERSION);
        assert_eq!(decoded.entry_count, 42);
        assert_eq!(decoded.identity_max_length, 128);
    }

    #[test]
    fn test_index_header_roundtrip() {
        let header = IndexHeader { version: INDEX_FORMAT_VERSION, entries: 10_000, slot_size: 144 };
        let decoded = IndexHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded.version, INDEX_FORMAT_VERSION);
        assert_eq!(decoded.entries, 10_000);
        assert_eq!(decoded.slot_size, 144);
    }

    #[test]
    fn test_identity_field_roundtrip() {
        let buf = encode_identity("user/alice", 128).unwrap();
        assert_eq!(buf.len(), 129);
        assert_eq!(decode_identity(&buf).unwrap(), "user/alice");
    }

    #[test]
    fn test_identity_too_long_rejected() {
        let long = "x".repeat(129);
        assert!(matches!(
            encode_identity(&long, 128),
            Err(StoreError::IdentityTooLong { length: 129, max: 128 })
        ));
    }

    #[test]
    fn test_slot_roundtrip() {
        let buf = encode_slot(true, 4096, "user/carol", 144).unwrap();
        assert_eq!(buf.len(), 144);
        let (flag, position, identity) = decode_slot(&buf).unwrap();
        assert!(flag);
        assert_eq!(position, 4096);
        assert_eq!(identity, "user/carol");
    }

    #[test]
    fn test_empty_slot_decodes() {
        let buf = encode_slot(false, EMPTY_POSITION, "", 144).unwrap();
        let (flag, position, identity) = decode_slot(&buf).unwrap();
        assert!(!flag);
        assert_eq!(position, EMPTY_POSITION);
        assert!(identity.is_empty());
    }

    #[test]
    fn test_usage_decoding() {
        assert_eq!(RecordUsage::from_u8(0), Some(RecordUsage::Unused));
        assert_eq!(RecordUsage::from_u8(1), Some(RecordUsage::Prime));
        assert_eq!(RecordUsage::from_u8(2), Some(RecordUsage::Mirror));
        assert_eq!(RecordUsage::from_u8(5), None);
        assert!(RecordUsage::Prime.is_live());
        assert!(!RecordUsage::Unused.is_live());
        assert!(RecordUsage::Mirror.mirror_active());
        assert!(!RecordUsage::PrimeChanged.mirror_active());
    }
}
