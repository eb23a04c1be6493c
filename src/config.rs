//! Engine configuration

use crate::BlockHeight;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Default number of blocks downloaded per batch
pub const DEFAULT_DOWNLOAD_BATCH_SIZE: u64 = 100;

/// Default number of blocks handed to the scanner per step
pub const DEFAULT_SCANNING_BATCH_SIZE: u64 = 100;

/// Default number of prefetched download batches kept in flight
pub const DEFAULT_DOWNLOAD_BUFFER_SIZE: usize = 10;

/// Default automatic retry budget
pub const DEFAULT_RETRIES: u32 = 5;

/// Default upper bound for the backoff/poll interval
pub const DEFAULT_MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(600);

/// Default base poll interval between sync cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Default rewind distance applied per consecutive chain validation error
pub const DEFAULT_REWIND_DISTANCE: u64 = 10;

/// Largest reorg the engine will rewind across
pub const MAX_REORG_SIZE: u64 = 100;

/// Provider of the wallet birthday; consulted at each use so a wallet import
/// finishing mid-session is picked up by the next cycle.
pub type WalletBirthdayProvider = Arc<dyn Fn() -> BlockHeight + Send + Sync>;

/// Sync engine configuration.
///
/// Consumed, not owned: the engine never mutates it.
#[derive(Clone)]
pub struct SyncConfig {
    /// Wallet instance alias, namespaces the persisted progress markers
    pub alias: String,
    /// Blocks per download batch
    pub download_batch_size: u64,
    /// Blocks per scanner step inside a batch
    pub scanning_batch_size: u64,
    /// Download batches buffered ahead of the scanner
    pub download_buffer_size: usize,
    /// Automatic retry budget for transient failures
    pub retries: u32,
    /// Cap on any computed backoff/poll interval
    pub max_backoff_interval: Duration,
    /// Base interval for polling the chain tip between cycles
    pub base_poll_interval: Duration,
    /// Base rewind distance for reorg recovery
    pub rewind_distance: u64,
    /// Largest reorg the engine will attempt to recover from
    pub max_reorg_size: u64,
    /// Chain name the server must report (e.g. "main")
    pub network_name: String,
    /// Sapling activation height the server must report
    pub sapling_activation_height: BlockHeight,
    /// Dynamic wallet birthday
    pub wallet_birthday_provider: WalletBirthdayProvider,
}

impl SyncConfig {
    /// Configuration with library defaults for the given network and a fixed
    /// wallet birthday.
    pub fn new(network_name: impl Into<String>, sapling_activation_height: BlockHeight, wallet_birthday: BlockHeight) -> Self {
        Self {
            alias: "default".to_string(),
            download_batch_size: DEFAULT_DOWNLOAD_BATCH_SIZE,
            scanning_batch_size: DEFAULT_SCANNING_BATCH_SIZE,
            download_buffer_size: DEFAULT_DOWNLOAD_BUFFER_SIZE,
            retries: DEFAULT_RETRIES,
            max_backoff_interval: DEFAULT_MAX_BACKOFF_INTERVAL,
            base_poll_interval: DEFAULT_POLL_INTERVAL,
            rewind_distance: DEFAULT_REWIND_DISTANCE,
            max_reorg_size: MAX_REORG_SIZE,
            network_name: network_name.into(),
            sapling_activation_height,
            wallet_birthday_provider: Arc::new(move || wallet_birthday),
        }
    }

    /// Current wallet birthday.
    pub fn wallet_birthday(&self) -> BlockHeight {
        (self.wallet_birthday_provider)()
    }

    /// Poll interval for the next cycle, jittered uniformly over
    /// `[base/2, base*3/2]` so a fleet of wallets does not hammer the server
    /// in lockstep. Clamped by `max_backoff_interval`.
    pub fn block_poll_interval(&self) -> Duration {
        let base = self.base_poll_interval.as_secs_f64();
        let interval = rand::thread_rng().gen_range(base / 2.0..=base * 1.5);
        Duration::from_secs_f64(interval).min(self.max_backoff_interval)
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("alias", &self.alias)
            .field("download_batch_size", &self.download_batch_size)
            .field("scanning_batch_size", &self.scanning_batch_size)
            .field("download_buffer_size", &self.download_buffer_size)
            .field("retries", &self.retries)
            .field("max_backoff_interval", &self.max_backoff_interval)
            .field("base_poll_interval", &self.base_poll_interval)
            .field("rewind_distance", &self.rewind_distance)
            .field("max_reorg_size", &self.max_reorg_size)
            .field("network_name", &self.network_name)
            .field("sapling_activation_height", &self.sapling_activation_height)
            .field("wallet_birthday", &self.wallet_birthday())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::new("main", 280_000, 663_150);
        assert_eq!(config.download_batch_size, 100);
        assert_eq!(config.retries, 5);
        assert_eq!(config.rewind_distance, 10);
        assert_eq!(config.max_reorg_size, 100);
        assert_eq!(config.wallet_birthday(), 663_150);
    }

    #[test]
    fn test_poll_interval_bounds() {
        let config = SyncConfig::new("main", 0, 0);
        for _ in 0..100 {
            let interval = config.block_poll_interval();
            assert!(interval >= DEFAULT_POLL_INTERVAL / 2);
            assert!(interval <= DEFAULT_POLL_INTERVAL * 3 / 2);
        }
    }

    #[test]
    fn test_dynamic_birthday_provider() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let birthday = Arc::new(AtomicU64::new(1_000));
        let provider = birthday.clone();
        let mut config = SyncConfig::new("main", 0, 0);
        config.wallet_birthday_provider = Arc::new(move || provider.load(Ordering::Relaxed));

        assert_eq!(config.wallet_birthday(), 1_000);
        birthday.store(2_000, Ordering::Relaxed);
        assert_eq!(config.wallet_birthday(), 2_000);
    }
}
