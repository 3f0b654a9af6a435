//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Backoff schedule for reconnecting after a failed `do_connect`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Growth factor applied after each consecutive failure
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.min(16));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Near-immediate retries for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            multiplier: 2,
        }
    }
}

/// Store configuration shared by every storage of one engine.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the local databases
    pub data_dir: PathBuf,
    /// Version string sent to the server when joining a space
    pub client_version: String,
    /// Reconnect backoff
    pub retry: RetryPolicy,
    /// Soft-deleted blobs younger than this survive `release_blobs`
    pub blob_retention: Duration,
    /// Messages buffered per broadcast channel receiver
    pub channel_capacity: usize,
    /// Pause between two doc sync rounds
    pub doc_sync_interval: Duration,
    /// How long an awareness collect waits for the foreground to answer
    pub collect_timeout: Duration,
    /// RocksDB block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("nbstore_data"),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            retry: RetryPolicy::default(),
            blob_retention: Duration::ZERO,
            channel_capacity: 256,
            doc_sync_interval: Duration::from_secs(5),
            collect_timeout: Duration::from_secs(5),
            block_cache_size: 32 * 1024 * 1024, // 32MB
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, fast retries).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: path.into(),
            retry: RetryPolicy::for_testing(),
            doc_sync_interval: Duration::from_millis(50),
            collect_timeout: Duration::from_millis(500),
            block_cache_size: 4 * 1024 * 1024, // 4MB
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.blob_retention, Duration::ZERO);
        assert!(!config.sync_writes);
    }
}
