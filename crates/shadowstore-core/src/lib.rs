//! shadowstore-core: a transactional, hash-indexed record store
//!
//! Records are opaque payloads addressed by a string identity. The heap file
//! keeps a prime and a mirror copy of every record's data area and flips a
//! usage byte as the final step of an in-place update, so an interrupted
//! write never clobbers the last intact payload. A hash index with per-slot
//! overflow buckets maps identities to heap offsets, and an undo journal of
//! inverse operations gives single-transaction commit, discard and crash
//! recovery.
//!
//! [`RecordManager`] is the operational entry point; everything below it is
//! exposed for direct use and testing.

pub mod block;
pub mod buckets;
pub mod config;
pub mod durability;
pub mod error;
pub mod format;
pub mod heap;
pub mod index;
pub mod iter;
pub mod manager;
pub mod undo;

pub use block::DataBlock;
pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use heap::DataStore;
pub use iter::StoreIterator;
pub use manager::RecordManager;
