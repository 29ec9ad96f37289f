//! Transactional facade over the heap and the undo journal
//!
//! One transaction at a time: mutations accumulate undo commands, `commit`
//! makes them durable, `discard` rolls them back. A mutation that fails
//! midway rolls the whole transaction back immediately, so the store never
//! carries a half-applied write forward. A journal found non-empty at open
//! belongs to a transaction that never committed; it is rolled back before
//! the store is handed out.

use std::path::Path;

use crate::block::DataBlock;
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::heap::DataStore;
use crate::iter::StoreIterator;
use crate::undo::{UndoCommand, UndoLog};

const JOURNAL_FILENAME: &str = "undo.data";

/// Owns a [`DataStore`] and its [`UndoLog`], and sequences every mutation
/// through the journal
pub struct RecordManager {
    store: DataStore,
    journal: UndoLog,
    open: bool,
}

impl RecordManager {
    /// Open the store at `dir`, recovering any unfinished transaction left
    /// behind by a crash.
    pub fn open(dir: &Path, config: &Config) -> StoreResult<Self> {
        config.validate().map_err(|reason| StoreError::Io {
            path: Some(dir.to_path_buf()),
            kind: std::io::ErrorKind::InvalidInput,
            message: format!("Invalid configuration: {}", reason),
        })?;

        let mut store = DataStore::open(dir, config)?;
        let mut journal = UndoLog::open(&dir.join(JOURNAL_FILENAME))?;

        if journal.has_pending() {
            let heap_truncated = journal
                .commands()
                .iter()
                .any(|command| matches!(command, UndoCommand::Extend { .. }));
            journal.rollback(&mut store)?;
            // An unclean open rebuilds the index before the rollback runs,
            // so a rollback that truncated the heap can leave index entries
            // pointing past the new end. Rebuild from the settled heap.
            if heap_truncated {
                store.re_index()?;
            }
        }

        Ok(Self { store, journal, open: true })
    }

    /// Read the active payload for an identity.
    pub fn read_data(&mut self, identity: &str) -> StoreResult<Option<DataBlock>> {
        self.ensure_open()?;
        self.store.read_data(identity)
    }

    /// Insert or update a record within the current transaction. On failure
    /// the whole transaction is rolled back before the error is returned.
    pub fn put_data(&mut self, block: &DataBlock) -> StoreResult<()> {
        self.ensure_open()?;
        match self.store.put_data(block, &mut self.journal) {
            Ok(()) => Ok(()),
            Err(e) => self.abort(e),
        }
    }

    /// Remove a record within the current transaction. Unknown identities
    /// are a no-op. On failure the whole transaction is rolled back.
    pub fn delete_data(&mut self, identity: &str) -> StoreResult<()> {
        self.ensure_open()?;
        match self.store.delete(identity, &mut self.journal) {
            Ok(()) => Ok(()),
            Err(e) => self.abort(e),
        }
    }

    /// Make the current transaction permanent. This is the durability point:
    /// the journal is truncated and synced.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.journal.commit()
    }

    /// Undo every mutation of the current transaction.
    pub fn discard(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.journal.rollback(&mut self.store)
    }

    /// Iterate the identities of all live records.
    pub fn iter(&self) -> StoreResult<StoreIterator> {
        self.store.iter()
    }

    /// Number of undo commands in the current transaction
    pub fn pending(&self) -> usize {
        self.journal.len()
    }

    /// Number of live records, as tracked by the heap header
    pub fn entry_count(&self) -> u32 {
        self.store.entry_count()
    }

    /// Close the store. An uncommitted transaction is left in the journal
    /// and rolled back at the next open.
    pub fn close(mut self) -> StoreResult<()> {
        self.open = false;
        self.store.close()
    }

    fn abort(&mut self, cause: StoreError) -> StoreResult<()> {
        // A failed rollback is worse news than the write that triggered it
        self.journal.rollback(&mut self.store)?;
        Err(cause)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Closed { component: "record manager" })
        }
    }
}
