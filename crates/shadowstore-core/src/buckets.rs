//! Overflow bucket files and their bounded handle cache
//!
//! Every primary index slot that overflows gets its own bucket file under
//! `idx/buckets/`, named by the hex value of the slot number. Open handles
//! are cached; a background thread wakes on a fixed interval and, once the
//! cache reaches the high-water mark, drops the oldest-created handles down
//! to the low-water mark. Ordering is by creation time, not last access;
//! this is deliberately not an LRU.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};

/// A cached overflow-file handle
struct BucketHandle {
    file: File,
    created: Instant,
}

/// Handle to the running eviction thread.
/// Dropping this handle signals the thread to stop and joins it.
struct EvictorHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EvictorHandle {
    fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Owns the per-slot overflow files and their bounded handle cache
pub struct BucketManager {
    dir: PathBuf,
    cache: Arc<Mutex<HashMap<u64, BucketHandle>>>,
    evictor: Option<EvictorHandle>,
}

impl BucketManager {
    /// Create a bucket manager rooted at `dir` and start the eviction thread.
    pub fn new(dir: &Path, config: &Config) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("Failed to create bucket directory: {}", e),
        })?;

        let cache: Arc<Mutex<HashMap<u64, BucketHandle>>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let cache_clone = Arc::clone(&cache);
        let shutdown_clone = Arc::clone(&shutdown);
        let interval = config.bucket_evict_interval;
        let high_water = config.bucket_cache_high_water;
        let low_water = config.bucket_cache_low_water;

        let thread = thread::Builder::new()
            .name("shadowstore-bucket-evict".to_string())
            .spawn(move || {
                evict_loop(cache_clone, interval, high_water, low_water, shutdown_clone);
            })
            .map_err(|e| StoreError::Io {
                path: Some(dir.to_path_buf()),
                kind: std::io::ErrorKind::Other,
                message: format!("Failed to spawn eviction thread: {}", e),
            })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            cache,
            evictor: Some(EvictorHandle { shutdown, thread: Some(thread) }),
        })
    }

    /// Get the overflow file for a primary slot, opening and caching it on
    /// first use. The guard holds the cache lock, so eviction sweeps wait
    /// until the caller is done with the handle.
    pub fn get(&self, slot: u64) -> StoreResult<MappedMutexGuard<'_, File>> {
        let mut cache = self.cache.lock();
        if !cache.contains_key(&slot) {
            let path = self.bucket_path(slot);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| StoreError::Io {
                    path: Some(path),
                    kind: e.kind(),
                    message: format!("Failed to open bucket file: {}", e),
                })?;
            cache.insert(slot, BucketHandle { file, created: Instant::now() });
        }
        Ok(MutexGuard::map(cache, |c| match c.get_mut(&slot) {
            Some(handle) => &mut handle.file,
            None => unreachable!("bucket handle inserted above"),
        }))
    }

    /// Path of the overflow file for a primary slot
    pub fn bucket_path(&self, slot: u64) -> PathBuf {
        self.dir.join(format!("{:x}", slot))
    }

    /// Number of handles currently cached
    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether a handle for the slot is currently cached
    pub fn is_cached(&self, slot: u64) -> bool {
        self.cache.lock().contains_key(&slot)
    }

    /// Stop the eviction thread and close all cached handles.
    pub fn close(&mut self) {
        if let Some(evictor) = self.evictor.take() {
            evictor.shutdown();
        }
        self.cache.lock().clear();
    }
}

impl Drop for BucketManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Eviction loop, runs on the background thread.
fn evict_loop(
    cache: Arc<Mutex<HashMap<u64, BucketHandle>>>,
    interval: Duration,
    high_water: usize,
    low_water: usize,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        // Sleep for the configured interval, checking shutdown so close()
        // interrupts the wait promptly.
        let wake_time = Instant::now() + interval;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        if shutdown.load(Ordering::Acquire) {
            return;
        }

        evict_oldest(&cache, high_water, low_water);
    }
}

/// One eviction sweep: if the cache holds at least `high_water` handles,
/// drop the oldest-created ones until `low_water` remain.
fn evict_oldest(cache: &Mutex<HashMap<u64, BucketHandle>>, high_water: usize, low_water: usize) {
    let mut cache = cache.lock();
    if cache.len() < high_water {
        return;
    }

    let mut by_age: Vec<(Instant, u64)> = cache.iter().map(|(k, h)| (h.created, *k)).collect();
    by_age.sort_by_key(|(created, _)| *created);

    let excess = cache.len() - low_water;
    for (_, slot) in by_age.into_iter().take(excess) {
        cache.remove(&slot);
    }
}
