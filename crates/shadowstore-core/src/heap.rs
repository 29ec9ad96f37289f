//! Append-oriented record heap with shadow-buffered in-place updates
//!
//! Records live in a single heap file behind a 256-byte header. Each record
//! block reserves twice the payload's worth of data area, split into a prime
//! and a mirror half; an update that fits writes the new payload into the
//! inactive half and flips the usage byte as its last step, so a crash at any
//! point leaves one intact copy. Updates that outgrow the block relocate to a
//! fresh block at the end of the heap; the old block is marked unused and its
//! space is never reclaimed.
//!
//! The header's clean-shutdown flag is cleared at open and set again at
//! close. An open that finds it cleared rebuilds the identity index from a
//! full heap scan.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::block::DataBlock;
use crate::config::Config;
use crate::durability::durable_sync;
use crate::error::{StoreError, StoreResult};
use crate::format::{
    self, HeapHeader, RecordUsage, DATA_AREA_OFFSET, HEAP_FORMAT_VERSION, HEAP_HEADER_LEN,
    REC_BLOCK_SIZE, REC_IDENTITY, REC_IDENTITY_SIZE, REC_INSTANCE_VERSION, REC_SCHEMA_VERSION,
    REC_USAGE, SLOT_OVERHEAD,
};
use crate::index::IdentityFile;
use crate::iter::StoreIterator;
use crate::undo::{UndoCommand, UndoLog};

const HEAP_FILENAME: &str = "heap.data";
const INDEX_DIRNAME: &str = "idx";

/// Parsed fixed head of a heap record
struct RecordHead {
    block_size: u32,
    usage: RecordUsage,
    instance_version: u64,
    schema_version: u32,
    identity: String,
    mirror_pointer: u64,
}

/// The data heap and its identity index
pub struct DataStore {
    file: File,
    path: PathBuf,
    dir: PathBuf,
    index: IdentityFile,
    identity_max_length: u32,
    entry_count: u32,
    config: Config,
    open: bool,
}

impl DataStore {
    /// Open the store rooted at `dir`, creating it if absent. An existing
    /// store that was not closed cleanly, or whose index is missing, damaged
    /// or undersized, gets its index rebuilt from a heap scan before any
    /// operation runs.
    pub fn open(dir: &Path, config: &Config) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("Failed to create store directory: {}", e),
        })?;

        let path = dir.join(HEAP_FILENAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to open heap file: {}", e),
            })?;

        let idx_dir = dir.join(INDEX_DIRNAME);
        let len = file.metadata()?.len();

        if len < DATA_AREA_OFFSET {
            // Fresh heap. The header claims not-clean until close.
            let header = HeapHeader {
                clean_shutdown: false,
                format_version: HEAP_FORMAT_VERSION,
                entry_count: 0,
                identity_max_length: config.identity_max_length,
            };
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.to_bytes())?;
            file.set_len(DATA_AREA_OFFSET)?;

            let index = IdentityFile::create(
                &idx_dir,
                config.identity_max_length + SLOT_OVERHEAD,
                config.min_index_entries,
                config,
            )?;

            return Ok(Self {
                file,
                path,
                dir: dir.to_path_buf(),
                index,
                identity_max_length: config.identity_max_length,
                entry_count: 0,
                config: config.clone(),
                open: true,
            });
        }

        let mut buf = [0u8; HEAP_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf).map_err(|e| StoreError::Io {
            path: Some(path.clone()),
            kind: e.kind(),
            message: format!("Failed to read heap header: {}", e),
        })?;
        let header = HeapHeader::from_bytes(&buf);

        if header.format_version != HEAP_FORMAT_VERSION {
            return Err(StoreError::Io {
                path: Some(path),
                kind: std::io::ErrorKind::InvalidData,
                message: format!("Unsupported heap format version {}", header.format_version),
            });
        }

        let was_clean = header.clean_shutdown;

        // Persisted geometry wins over the supplied configuration.
        let identity_max_length = header.identity_max_length;

        // Mark dirty before touching anything else.
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&[0u8])?;

        let slot_size = identity_max_length + SLOT_OVERHEAD;
        let (index, index_usable) = match IdentityFile::open(&idx_dir, config) {
            Ok(index) => (index, true),
            Err(StoreError::MalformedIndex { .. }) => (
                IdentityFile::create(&idx_dir, slot_size, config.min_index_entries, config)?,
                false,
            ),
            Err(e) => return Err(e),
        };

        let stale = (index.entries() as u64) < header.entry_count as u64 * 2;

        let mut store = Self {
            file,
            path,
            dir: dir.to_path_buf(),
            index,
            identity_max_length,
            entry_count: header.entry_count,
            config: config.clone(),
            open: true,
        };

        if !was_clean || !index_usable || stale {
            store.re_index()?;
        }

        Ok(store)
    }

    /// Maximum identity length this store was created with
    pub fn identity_max_length(&self) -> u32 {
        self.identity_max_length
    }

    /// Number of live records, as tracked by the header
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Read the active payload for an identity.
    pub fn read_data(&mut self, identity: &str) -> StoreResult<Option<DataBlock>> {
        self.ensure_open()?;

        let position = match self.index.find(identity)? {
            Some(position) => position,
            None => return Ok(None),
        };

        let head = self.read_head(position)?;
        if head.identity != identity {
            return Err(StoreError::InconsistentHeap {
                offset: position,
                expected: identity.to_string(),
                found: head.identity,
            });
        }
        if !head.usage.is_live() {
            return Ok(None);
        }

        let data_offset = if head.usage.mirror_active() {
            head.mirror_pointer
        } else {
            position + format::record_fixed_len(self.identity_max_length)
        };

        self.file.seek(SeekFrom::Start(data_offset))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; payload_len];
        self.file.read_exact(&mut payload)?;

        Ok(Some(DataBlock {
            identity: identity.to_string(),
            payload,
            instance_version: head.instance_version,
            schema_version: head.schema_version,
        }))
    }

    /// Insert or update a record. New identities append a block; updates that
    /// fit the existing block go through the shadow half; updates that do not
    /// fit relocate to a fresh block. Every mutation journals its inverse
    /// first.
    pub fn put_data(&mut self, block: &DataBlock, journal: &mut UndoLog) -> StoreResult<()> {
        self.ensure_open()?;
        if block.identity.len() > self.identity_max_length as usize {
            return Err(StoreError::IdentityTooLong {
                length: block.identity.len(),
                max: self.identity_max_length as usize,
            });
        }

        let existing = self.index.find(&block.identity)?;

        let position = match existing {
            None => {
                let position = self.add_record(block, journal)?;
                journal.record(UndoCommand::NewIdentity { identity: block.identity.clone() })?;
                self.index.remember(&block.identity, position)?;
                self.entry_count += 1;
                return Ok(());
            }
            Some(position) => position,
        };

        let head = self.read_head(position)?;
        if head.identity != block.identity {
            return Err(StoreError::InconsistentHeap {
                offset: position,
                expected: block.identity.clone(),
                found: head.identity,
            });
        }

        let half = format::half_area(head.block_size, self.identity_max_length);
        if block.payload.len() + 4 > half as usize {
            return self.relocate(block, position, &head, journal);
        }
        self.shadow_update(block, position, &head, journal)
    }

    /// Remove a record. Unknown identities are a silent no-op.
    pub fn delete(&mut self, identity: &str, journal: &mut UndoLog) -> StoreResult<()> {
        self.ensure_open()?;

        let position = match self.index.find(identity)? {
            Some(position) => position,
            None => return Ok(()),
        };

        let head = self.read_head(position)?;
        if head.identity != identity {
            return Err(StoreError::InconsistentHeap {
                offset: position,
                expected: identity.to_string(),
                found: head.identity,
            });
        }
        // A dead record behind a stale index entry: nothing to undo
        if !head.usage.is_live() {
            return Ok(());
        }

        journal.record(UndoCommand::DropIdentity {
            identity: identity.to_string(),
            position,
        })?;
        self.index.forget(identity)?;

        journal.record(UndoCommand::Delete { position, prior_usage: head.usage })?;
        self.write_usage(position, RecordUsage::Unused)?;

        self.entry_count = self.entry_count.saturating_sub(1);
        Ok(())
    }

    /// Iterate the identities of all live records, in heap order.
    pub fn iter(&self) -> StoreResult<StoreIterator> {
        StoreIterator::new(&self.path, self.identity_max_length)
    }

    /// Close the store: stops the index, marks the heap cleanly shut down
    /// and syncs it. Further operations fail with `Closed`.
    pub fn close(&mut self) -> StoreResult<()> {
        if !self.open {
            return Ok(());
        }
        self.index.close();

        let header = HeapHeader {
            clean_shutdown: true,
            format_version: HEAP_FORMAT_VERSION,
            entry_count: self.entry_count,
            identity_max_length: self.identity_max_length,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.to_bytes())?;
        durable_sync(&self.file).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Heap sync failed: {}", e),
        })?;

        self.open = false;
        Ok(())
    }

    /// Rebuild the identity index from a full heap scan. Sized at twice the
    /// tracked record count, with a configured floor.
    pub fn re_index(&mut self) -> StoreResult<()> {
        let entries = self.config.min_index_entries.max(self.entry_count.saturating_mul(2));
        let slot_size = self.identity_max_length + SLOT_OVERHEAD;

        self.index.close();
        self.index = IdentityFile::create(&self.dir.join(INDEX_DIRNAME), slot_size, entries, &self.config)?;

        let heap_len = self.file.metadata()?.len();
        let fixed_len = format::record_fixed_len(self.identity_max_length);
        let mut count = 0u32;
        let mut position = DATA_AREA_OFFSET;

        while position + fixed_len <= heap_len {
            // Peek at the raw size field first: a zeroed or implausible
            // value marks the unwritten tail, not a parse error.
            self.file.seek(SeekFrom::Start(position))?;
            let mut size_buf = [0u8; 4];
            self.file.read_exact(&mut size_buf)?;
            if (u32::from_be_bytes(size_buf) as u64) < fixed_len {
                break;
            }

            let head = self.read_head(position)?;
            if head.usage.is_live() {
                self.index.remember(&head.identity, position)?;
                count += 1;
            }
            position += head.block_size as u64;
        }

        self.entry_count = count;
        Ok(())
    }

    /// Append a fresh block for `block` at the end of the heap, journaling
    /// the prior heap length first. Returns the block's offset.
    fn add_record(&mut self, block: &DataBlock, journal: &mut UndoLog) -> StoreResult<u64> {
        let prior_length = self.file.metadata()?.len();
        journal.record(UndoCommand::Extend { prior_length })?;

        let max = self.identity_max_length;
        let block_size = format::block_size_for(block.payload.len(), max);
        let fixed_len = format::record_fixed_len(max) as usize;
        let half = format::half_area(block_size, max) as u64;

        let mp_off = format::mirror_pointer_offset(max) as usize;

        let mut buf = vec![0u8; block_size as usize];
        buf[REC_BLOCK_SIZE as usize..REC_USAGE as usize].copy_from_slice(&block_size.to_be_bytes());
        buf[REC_USAGE as usize] = RecordUsage::Prime.as_u8();
        buf[REC_INSTANCE_VERSION as usize..REC_SCHEMA_VERSION as usize]
            .copy_from_slice(&block.instance_version.to_be_bytes());
        buf[REC_SCHEMA_VERSION as usize..REC_IDENTITY_SIZE as usize]
            .copy_from_slice(&block.schema_version.to_be_bytes());
        let identity = format::encode_identity(&block.identity, max)?;
        buf[REC_IDENTITY_SIZE as usize..mp_off].copy_from_slice(&identity);
        let mirror_pointer = prior_length + fixed_len as u64 + half;
        buf[mp_off..fixed_len].copy_from_slice(&mirror_pointer.to_be_bytes());
        buf[fixed_len..fixed_len + 4].copy_from_slice(&(block.payload.len() as u32).to_be_bytes());
        buf[fixed_len + 4..fixed_len + 4 + block.payload.len()].copy_from_slice(&block.payload);

        self.file.seek(SeekFrom::Start(prior_length))?;
        self.file.write_all(&buf)?;
        Ok(prior_length)
    }

    /// In-place update through the inactive half of the block's data area.
    /// The usage flip is the last write, so an interrupted update leaves the
    /// prior payload active.
    fn shadow_update(
        &mut self,
        block: &DataBlock,
        position: u64,
        head: &RecordHead,
        journal: &mut UndoLog,
    ) -> StoreResult<()> {
        journal.record(UndoCommand::Modify {
            position,
            prior_usage: head.usage,
            prior_instance_version: head.instance_version,
            prior_schema_version: head.schema_version,
        })?;

        let (in_progress, target, final_usage) = if head.usage.mirror_active() {
            let prime = position + format::record_fixed_len(self.identity_max_length);
            (RecordUsage::MirrorChanged, prime, RecordUsage::Prime)
        } else {
            (RecordUsage::PrimeChanged, head.mirror_pointer, RecordUsage::Mirror)
        };

        self.write_usage(position, in_progress)?;

        let mut versions = [0u8; 12];
        versions[0..8].copy_from_slice(&block.instance_version.to_be_bytes());
        versions[8..12].copy_from_slice(&block.schema_version.to_be_bytes());
        self.file.seek(SeekFrom::Start(position + format::REC_INSTANCE_VERSION))?;
        self.file.write_all(&versions)?;

        let mut data = vec![0u8; 4 + block.payload.len()];
        data[0..4].copy_from_slice(&(block.payload.len() as u32).to_be_bytes());
        data[4..].copy_from_slice(&block.payload);
        self.file.seek(SeekFrom::Start(target))?;
        self.file.write_all(&data)?;

        self.write_usage(position, final_usage)
    }

    /// The payload no longer fits the old block: append a new block, kill the
    /// old one and re-point the index.
    fn relocate(
        &mut self,
        block: &DataBlock,
        position: u64,
        head: &RecordHead,
        journal: &mut UndoLog,
    ) -> StoreResult<()> {
        let new_position = self.add_record(block, journal)?;

        journal.record(UndoCommand::Modify {
            position,
            prior_usage: head.usage,
            prior_instance_version: head.instance_version,
            prior_schema_version: head.schema_version,
        })?;
        self.write_usage(position, RecordUsage::Unused)?;

        journal.record(UndoCommand::DropIdentity {
            identity: block.identity.clone(),
            position,
        })?;
        self.index.remember(&block.identity, new_position)?;
        Ok(())
    }

    fn read_head(&mut self, position: u64) -> StoreResult<RecordHead> {
        let max = self.identity_max_length as usize;
        let fixed_len = format::record_fixed_len(self.identity_max_length) as usize;
        let mut buf = vec![0u8; fixed_len];
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(&mut buf).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Failed to read record head at offset {}: {}", position, e),
        })?;

        let block_size = format::be_u32(&buf[REC_BLOCK_SIZE as usize..]);
        // Downstream arithmetic (half_area, relocation) relies on the block
        // covering at least its own fixed head.
        if (block_size as u64) < fixed_len as u64 {
            return Err(StoreError::Io {
                path: Some(self.path.clone()),
                kind: std::io::ErrorKind::InvalidData,
                message: format!("Implausible block size {} at offset {}", block_size, position),
            });
        }
        let usage = RecordUsage::from_u8(buf[REC_USAGE as usize]).ok_or_else(|| StoreError::Io {
            path: Some(self.path.clone()),
            kind: std::io::ErrorKind::InvalidData,
            message: format!("Invalid usage byte {} at offset {}", buf[REC_USAGE as usize], position),
        })?;
        let instance_version = format::be_u64(&buf[REC_INSTANCE_VERSION as usize..]);
        let schema_version = format::be_u32(&buf[REC_SCHEMA_VERSION as usize..]);
        let identity = format::decode_identity(&buf[REC_IDENTITY_SIZE as usize..REC_IDENTITY as usize + max])?;
        let mirror_pointer =
            format::be_u64(&buf[format::mirror_pointer_offset(self.identity_max_length) as usize..]);

        Ok(RecordHead {
            block_size,
            usage,
            instance_version,
            schema_version,
            identity,
            mirror_pointer,
        })
    }

    fn write_usage(&mut self, position: u64, usage: RecordUsage) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(position + REC_USAGE))?;
        self.file.write_all(&[usage.as_u8()])?;
        Ok(())
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Closed { component: "record store" })
        }
    }

    // Rollback entry points, called by UndoCommand::revert in reverse
    // journal order.

    pub(crate) fn restore_usage(&mut self, position: u64, usage: RecordUsage) -> StoreResult<()> {
        self.write_usage(position, usage)?;
        if usage.is_live() {
            self.entry_count += 1;
        }
        Ok(())
    }

    pub(crate) fn restore_record_head(
        &mut self,
        position: u64,
        usage: RecordUsage,
        instance_version: u64,
        schema_version: u32,
    ) -> StoreResult<()> {
        let mut buf = [0u8; 13];
        buf[0] = usage.as_u8();
        buf[1..9].copy_from_slice(&instance_version.to_be_bytes());
        buf[9..13].copy_from_slice(&schema_version.to_be_bytes());
        self.file.seek(SeekFrom::Start(position + REC_USAGE))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    pub(crate) fn forget_identity(&mut self, identity: &str) -> StoreResult<()> {
        self.index.forget(identity)?;
        self.entry_count = self.entry_count.saturating_sub(1);
        Ok(())
    }

    pub(crate) fn restore_identity(&mut self, identity: &str, position: u64) -> StoreResult<()> {
        self.index.remember(identity, position)
    }

    pub(crate) fn truncate_heap(&mut self, length: u64) -> StoreResult<()> {
        self.file.set_len(length).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Heap truncate failed: {}", e),
        })
    }
}
