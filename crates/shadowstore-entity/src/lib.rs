//! shadowstore-entity: unit-of-work facade over shadowstore-core
//!
//! Callers hand a whole change set (new records, updated records, removed
//! identities) to [`EntityStore::prepare`], which applies it as one
//! transaction and returns a [`Committer`]. The committer holds the store
//! lock until the caller either commits or cancels, so exactly one change
//! set is in flight at a time.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};

use shadowstore_core::{Config, DataBlock, RecordManager, StoreResult};

/// Thread-safe entity store with prepare/commit change-set semantics
pub struct EntityStore {
    manager: Mutex<RecordManager>,
}

impl EntityStore {
    /// Open the store at `dir`, recovering any unfinished change set first.
    pub fn open(dir: &Path, config: &Config) -> StoreResult<Self> {
        let manager = RecordManager::open(dir, config)?;
        Ok(Self { manager: Mutex::new(manager) })
    }

    /// Read the record for an identity, if any.
    pub fn get(&self, identity: &str) -> StoreResult<Option<DataBlock>> {
        self.manager.lock().read_data(identity)
    }

    /// Apply a change set as a single transaction and return its committer.
    /// If any mutation fails, everything already applied is rolled back and
    /// the error is returned.
    ///
    /// The returned committer holds the store lock; a committer dropped
    /// without a verdict leaves the change set journaled, and the next open
    /// rolls it back.
    pub fn prepare(
        &self,
        new: Vec<DataBlock>,
        updated: Vec<DataBlock>,
        removed: Vec<String>,
    ) -> StoreResult<Committer<'_>> {
        let mut manager = self.manager.lock();

        for block in new.iter().chain(updated.iter()) {
            manager.put_data(block)?;
        }
        for identity in &removed {
            manager.delete_data(identity)?;
        }

        Ok(Committer { manager })
    }

    /// Identities of all stored records, in heap order.
    pub fn identities(&self) -> StoreResult<Vec<String>> {
        Ok(self.manager.lock().iter()?.collect())
    }

    /// Close the store cleanly.
    pub fn close(self) -> StoreResult<()> {
        self.manager.into_inner().close()
    }
}

/// Pending verdict on a prepared change set. Holds the store lock.
pub struct Committer<'a> {
    manager: MutexGuard<'a, RecordManager>,
}

impl Committer<'_> {
    /// Make the change set permanent.
    pub fn commit(mut self) -> StoreResult<()> {
        self.manager.commit()
    }

    /// Undo the change set.
    pub fn cancel(mut self) -> StoreResult<()> {
        self.manager.discard()
    }
}
