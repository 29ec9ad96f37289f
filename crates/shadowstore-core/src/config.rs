//! Configuration for a shadowstore instance
//!
//! The storage directory itself is supplied at open time; everything here
//! tunes sizing and the bucket-cache eviction policy.

use std::time::Duration;

/// Store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum identity length in bytes. Must fit the one-byte length field
    /// of the on-disk record, so at most 255.
    pub identity_max_length: u32,
    /// Minimum number of primary index slots allocated on a rebuild
    pub min_index_entries: u32,
    /// Bucket-file cache size at which eviction kicks in
    pub bucket_cache_high_water: usize,
    /// Bucket-file cache size eviction shrinks down to
    pub bucket_cache_low_water: usize,
    /// How often the background eviction task wakes
    pub bucket_evict_interval: Duration,
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.identity_max_length == 0 || self.identity_max_length > 255 {
            return Err("identity_max_length must be in [1, 255]".into());
        }
        if self.min_index_entries == 0 {
            return Err("min_index_entries must be > 0".into());
        }
        if self.bucket_cache_low_water == 0 {
            return Err("bucket_cache_low_water must be > 0".into());
        }
        if self.bucket_cache_high_water <= self.bucket_cache_low_water {
            return Err("bucket_cache_high_water must exceed bucket_cache_low_water".into());
        }
        if self.bucket_evict_interval.as_millis() == 0 {
            return Err("bucket_evict_interval must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_max_length: 128,
            min_index_entries: 10_000,
            bucket_cache_high_water: 30,
            bucket_cache_low_water: 20,
            bucket_evict_interval: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_identity_length_bounds() {
        let mut config = Config::default();
        config.identity_max_length = 0;
        assert!(config.validate().is_err());
        config.identity_max_length = 256;
        assert!(config.validate().is_err());
        config.identity_max_length = 255;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watermark_ordering() {
        let mut config = Config::default();
        config.bucket_cache_high_water = 20;
        config.bucket_cache_low_water = 20;
        assert!(config.validate().is_err());
        config.bucket_cache_high_water = 21;
        assert!(config.validate().is_ok());
    }
}
