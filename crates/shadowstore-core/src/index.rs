//! Fixed-slot hash index mapping identity to heap offset
//!
//! The primary table is a flat array of fixed-size slots in
//! `idx/id-hash.data`, addressed by `crc32c(identity) % entries + 1` (slot 0
//! holds the header). A slot holds at most one identity inline; on collision
//! it is marked extended and all colliding identities live in the slot's
//! overflow bucket file, scanned linearly.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::buckets::BucketManager;
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::{
    self, IndexHeader, EMPTY_POSITION, INDEX_FORMAT_VERSION, INDEX_HEADER_LEN, SLOT_OVERHEAD,
};

const INDEX_FILENAME: &str = "id-hash.data";
const BUCKETS_DIRNAME: &str = "buckets";

/// The identity index: primary slot table plus overflow buckets
pub struct IdentityFile {
    file: File,
    path: PathBuf,
    entries: u32,
    slot_size: u32,
    buckets: BucketManager,
    open: bool,
}

impl IdentityFile {
    /// Create a fresh index with `entries` primary slots. Any existing index
    /// directory is wiped first so stale bucket entries cannot resurface.
    pub fn create(dir: &Path, slot_size: u32, entries: u32, config: &Config) -> StoreResult<Self> {
        if dir.exists() {
            std::fs::remove_dir_all(dir).map_err(|e| StoreError::Io {
                path: Some(dir.to_path_buf()),
                kind: e.kind(),
                message: format!("Failed to clear index directory: {}", e),
            })?;
        }
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("Failed to create index directory: {}", e),
        })?;

        let path = dir.join(INDEX_FILENAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to create index file: {}", e),
            })?;

        // Slot 0 carries the header; slots 1..=entries start out empty.
        {
            let mut writer = BufWriter::new(&file);
            let header = IndexHeader { version: INDEX_FORMAT_VERSION, entries, slot_size };
            let mut slot0 = vec![0u8; slot_size as usize];
            slot0[..INDEX_HEADER_LEN].copy_from_slice(&header.to_bytes());
            writer.write_all(&slot0)?;

            let empty = format::encode_slot(false, EMPTY_POSITION, "", slot_size)?;
            for _ in 0..entries {
                writer.write_all(&empty)?;
            }
            writer.flush()?;
        }

        let buckets = BucketManager::new(&dir.join(BUCKETS_DIRNAME), config)?;

        Ok(Self { file, path, entries, slot_size, buckets, open: true })
    }

    /// Open an existing index. Returns `MalformedIndex` when the directory is
    /// missing or the header does not add up, so the caller can rebuild.
    pub fn open(dir: &Path, config: &Config) -> StoreResult<Self> {
        let path = dir.join(INDEX_FILENAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::MalformedIndex {
                path: path.clone(),
                reason: format!("cannot open index file: {}", e),
            })?;

        let mut buf = [0u8; INDEX_HEADER_LEN];
        file.read_exact(&mut buf).map_err(|e| StoreError::MalformedIndex {
            path: path.clone(),
            reason: format!("cannot read index header: {}", e),
        })?;
        let header = IndexHeader::from_bytes(&buf);

        if header.version != INDEX_FORMAT_VERSION {
            return Err(StoreError::MalformedIndex {
                path,
                reason: format!("unsupported index version {}", header.version),
            });
        }
        if header.entries == 0 || header.slot_size <= SLOT_OVERHEAD {
            return Err(StoreError::MalformedIndex {
                path,
                reason: format!(
                    "implausible geometry: {} entries, slot size {}",
                    header.entries, header.slot_size
                ),
            });
        }
        let expected_len = (header.entries as u64 + 1) * header.slot_size as u64;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(StoreError::MalformedIndex {
                path,
                reason: format!("file is {} bytes, expected {}", actual_len, expected_len),
            });
        }

        let buckets = BucketManager::new(&dir.join(BUCKETS_DIRNAME), config)?;

        Ok(Self {
            file,
            path,
            entries: header.entries,
            slot_size: header.slot_size,
            buckets,
            open: true,
        })
    }

    /// Number of primary slots
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Look up the heap offset recorded for an identity.
    pub fn find(&mut self, identity: &str) -> StoreResult<Option<u64>> {
        self.ensure_open()?;
        self.check_identity(identity)?;

        let slot = self.slot_for(identity);
        let (extended, position, stored) = self.read_slot(slot)?;

        if extended {
            return self.bucket_find(slot, identity);
        }
        if position >= 0 && stored == identity {
            return Ok(Some(position as u64));
        }
        Ok(None)
    }

    /// Record or update the heap offset for an identity.
    pub fn remember(&mut self, identity: &str, position: u64) -> StoreResult<()> {
        self.ensure_open()?;
        self.check_identity(identity)?;

        let slot = self.slot_for(identity);
        let (extended, current, stored) = self.read_slot(slot)?;

        if extended {
            return self.bucket_remember(slot, identity, position);
        }
        if current == EMPTY_POSITION || stored == identity {
            return self.write_slot(slot, false, position as i64, identity);
        }

        // Collision: migrate the resident entry into bucket slot 0, place the
        // newcomer into bucket slot 1, then mark the primary slot extended.
        {
            let resident = format::encode_slot(true, current, &stored, self.slot_size)?;
            let newcomer = format::encode_slot(true, position as i64, identity, self.slot_size)?;
            let mut file = self.buckets.get(slot)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&resident)?;
            file.write_all(&newcomer)?;
        }
        self.write_slot(slot, true, EMPTY_POSITION, "")
    }

    /// Remove the mapping for an identity. Unknown identities are a no-op.
    pub fn forget(&mut self, identity: &str) -> StoreResult<()> {
        self.ensure_open()?;
        self.check_identity(identity)?;

        let slot = self.slot_for(identity);
        let (extended, _, stored) = self.read_slot(slot)?;

        if extended {
            return self.bucket_forget(slot, identity);
        }
        if stored == identity {
            return self.write_slot(slot, false, EMPTY_POSITION, "");
        }
        Ok(())
    }

    /// Close the index: stops the bucket eviction thread and drops all
    /// handles. Further operations fail with `Closed`.
    pub fn close(&mut self) {
        self.buckets.close();
        self.open = false;
    }

    /// The bucket manager, exposed for diagnostics
    pub fn buckets(&self) -> &BucketManager {
        &self.buckets
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Closed { component: "identity index" })
        }
    }

    fn check_identity(&self, identity: &str) -> StoreResult<()> {
        let max = (self.slot_size - SLOT_OVERHEAD) as usize;
        if identity.len() > max {
            return Err(StoreError::IdentityTooLong { length: identity.len(), max });
        }
        Ok(())
    }

    fn slot_for(&self, identity: &str) -> u64 {
        (crc32c::crc32c(identity.as_bytes()) as u64 % self.entries as u64) + 1
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        slot * self.slot_size as u64
    }

    fn read_slot(&mut self, slot: u64) -> StoreResult<(bool, i64, String)> {
        let offset = self.slot_offset(slot);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; self.slot_size as usize];
        self.file.read_exact(&mut buf)?;
        format::decode_slot(&buf).map_err(|e| self.rehome(e))
    }

    fn write_slot(&mut self, slot: u64, flag: bool, position: i64, identity: &str) -> StoreResult<()> {
        let encoded = format::encode_slot(flag, position, identity, self.slot_size)?;
        let offset = self.slot_offset(slot);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encoded)?;
        Ok(())
    }

    fn bucket_find(&self, slot: u64, identity: &str) -> StoreResult<Option<u64>> {
        let slot_size = self.slot_size as u64;
        let mut buf = vec![0u8; self.slot_size as usize];
        let mut file = self.buckets.get(slot)?;
        let len = file.metadata()?.len();

        let mut offset = 0;
        while offset + slot_size <= len {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            let (used, position, stored) = format::decode_slot(&buf).map_err(|e| self.rehome(e))?;
            if used && stored == identity {
                return Ok(Some(position as u64));
            }
            offset += slot_size;
        }
        Ok(None)
    }

    /// Insert into the slot's bucket: overwrite the identity's existing entry
    /// if present, otherwise take the first cleared entry, otherwise append.
    fn bucket_remember(&self, slot: u64, identity: &str, position: u64) -> StoreResult<()> {
        let slot_size = self.slot_size as u64;
        let encoded = format::encode_slot(true, position as i64, identity, self.slot_size)?;
        let mut buf = vec![0u8; self.slot_size as usize];
        let mut file = self.buckets.get(slot)?;
        let len = file.metadata()?.len();

        let mut first_free: Option<u64> = None;
        let mut offset = 0;
        while offset + slot_size <= len {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            let (used, _, stored) = format::decode_slot(&buf).map_err(|e| self.rehome(e))?;
            if used && stored == identity {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&encoded)?;
                return Ok(());
            }
            if !used && first_free.is_none() {
                first_free = Some(offset);
            }
            offset += slot_size;
        }

        let target = first_free.unwrap_or(len);
        file.seek(SeekFrom::Start(target))?;
        file.write_all(&encoded)?;
        Ok(())
    }

    /// Logical delete in the slot's bucket: clear the used flag, keep the rest.
    fn bucket_forget(&self, slot: u64, identity: &str) -> StoreResult<()> {
        let slot_size = self.slot_size as u64;
        let mut buf = vec![0u8; self.slot_size as usize];
        let mut file = self.buckets.get(slot)?;
        let len = file.metadata()?.len();

        let mut offset = 0;
        while offset + slot_size <= len {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            let (used, position, stored) = format::decode_slot(&buf).map_err(|e| self.rehome(e))?;
            if used && stored == identity {
                let cleared = format::encode_slot(false, position, &stored, self.slot_size)?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&cleared)?;
                return Ok(());
            }
            offset += slot_size;
        }
        Ok(())
    }

    /// Attach the real index path to decode errors.
    fn rehome(&self, err: StoreError) -> StoreError {
        match err {
            StoreError::MalformedIndex { reason, .. } => StoreError::MalformedIndex {
                path: self.path.clone(),
                reason,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SLOT_SIZE: u32 = 144; // identity_max_length 128 + overhead

    fn fresh(dir: &Path, entries: u32) -> IdentityFile {
        IdentityFile::create(dir, SLOT_SIZE, entries, &Config::default()).unwrap()
    }

    #[test]
    fn test_remember_find_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut index = fresh(tmp.path(), 64);

        index.remember("user/alice", 256).unwrap();
        index.remember("user/bob", 1024).unwrap();

        assert_eq!(index.find("user/alice").unwrap(), Some(256));
        assert_eq!(index.find("user/bob").unwrap(), Some(1024));
        assert_eq!(index.find("user/carol").unwrap(), None);
    }

    #[test]
    fn test_update_position_in_place() {
        let tmp = TempDir::new().unwrap();
        let mut index = fresh(tmp.path(), 64);

        index.remember("user/alice", 256).unwrap();
        index.remember("user/alice", 4096).unwrap();
        assert_eq!(index.find("user/alice").unwrap(), Some(4096));
    }

    #[test]
    fn test_collision_migrates_to_bucket() {
        let tmp = TempDir::new().unwrap();
        // A single primary slot forces every identity to collide
        let mut index = fresh(tmp.path(), 1);

        index.remember("first", 300).unwrap();
        index.remember("second", 700).unwrap();
        index.remember("third", 1100).unwrap();

        assert_eq!(index.find("first").unwrap(), Some(300));
        assert_eq!(index.find("second").unwrap(), Some(700));
        assert_eq!(index.find("third").unwrap(), Some(1100));

        // The bucket file now holds all three entries
        let bucket = index.buckets().bucket_path(1);
        let len = std::fs::metadata(bucket).unwrap().len();
        assert_eq!(len, 3 * SLOT_SIZE as u64);
    }

    #[test]
    fn test_bucket_update_and_forget() {
        let tmp = TempDir::new().unwrap();
        let mut index = fresh(tmp.path(), 1);

        index.remember("first", 300).unwrap();
        index.remember("second", 700).unwrap();
        index.remember("second", 9000).unwrap();
        assert_eq!(index.find("second").unwrap(), Some(9000));

        index.forget("first").unwrap();
        assert_eq!(index.find("first").unwrap(), None);
        assert_eq!(index.find("second").unwrap(), Some(9000));

        // The cleared bucket entry is reused before appending
        index.remember("fourth", 1500).unwrap();
        let bucket = index.buckets().bucket_path(1);
        let len = std::fs::metadata(bucket).unwrap().len();
        assert_eq!(len, 2 * SLOT_SIZE as u64);
        assert_eq!(index.find("fourth").unwrap(), Some(1500));
    }

    #[test]
    fn test_forget_inline() {
        let tmp = TempDir::new().unwrap();
        let mut index = fresh(tmp.path(), 64);

        index.remember("user/alice", 256).unwrap();
        index.forget("user/alice").unwrap();
        assert_eq!(index.find("user/alice").unwrap(), None);

        // Forgetting twice is harmless
        index.forget("user/alice").unwrap();
    }

    #[test]
    fn test_identity_too_long() {
        let tmp = TempDir::new().unwrap();
        let mut index = fresh(tmp.path(), 64);

        let long = "x".repeat((SLOT_SIZE - SLOT_OVERHEAD) as usize + 1);
        assert!(matches!(
            index.find(&long),
            Err(StoreError::IdentityTooLong { .. })
        ));
        assert!(matches!(
            index.remember(&long, 256),
            Err(StoreError::IdentityTooLong { .. })
        ));
    }

    #[test]
    fn test_closed_index_rejects_operations() {
        let tmp = TempDir::new().unwrap();
        let mut index = fresh(tmp.path(), 64);

        index.remember("user/alice", 256).unwrap();
        index.close();

        assert!(matches!(index.find("user/alice"), Err(StoreError::Closed { .. })));
        assert!(matches!(index.remember("user/bob", 1), Err(StoreError::Closed { .. })));
        assert!(matches!(index.forget("user/alice"), Err(StoreError::Closed { .. })));
    }

    #[test]
    fn test_reopen_preserves_mappings() {
        let tmp = TempDir::new().unwrap();
        {
            let mut index = fresh(tmp.path(), 8);
            index.remember("user/alice", 256).unwrap();
            index.remember("user/bob", 600).unwrap();
            index.close();
        }
        let mut index = IdentityFile::open(tmp.path(), &Config::default()).unwrap();
        assert_eq!(index.entries(), 8);
        assert_eq!(index.find("user/alice").unwrap(), Some(256));
        assert_eq!(index.find("user/bob").unwrap(), Some(600));
    }

    #[test]
    fn test_open_missing_directory_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let result = IdentityFile::open(&tmp.path().join("nope"), &Config::default());
        assert!(matches!(result, Err(StoreError::MalformedIndex { .. })));
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let tmp = TempDir::new().unwrap();
        {
            let mut index = fresh(tmp.path(), 8);
            index.close();
        }
        let path = tmp.path().join(INDEX_FILENAME);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(40).unwrap();
        drop(file);

        let result = IdentityFile::open(tmp.path(), &Config::default());
        assert!(matches!(result, Err(StoreError::MalformedIndex { .. })));
    }

    #[test]
    fn test_create_wipes_previous_index() {
        let tmp = TempDir::new().unwrap();
        {
            let mut index = fresh(tmp.path(), 1);
            index.remember("first", 300).unwrap();
            index.remember("second", 700).unwrap();
            index.close();
        }
        // Rebuild: stale bucket entries must not survive
        let mut index = fresh(tmp.path(), 1);
        assert_eq!(index.find("first").unwrap(), None);
        assert_eq!(index.find("second").unwrap(), None);
    }
}
