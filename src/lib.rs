//! Compact block synchronization engine for mobile light wallets
//!
//! Maintains a local, crash-recoverable view of a remote block chain from
//! compact blocks served by a trusted-but-unreliable server. Downloading,
//! chain validation, trial-decryption scanning, transaction enhancement and
//! UTXO refresh run as a resumable state machine driven by persisted progress
//! markers; the cryptographic backend, wire client and block cache are
//! pluggable collaborators.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod interface;
pub mod markers;
pub mod pipeline;
pub mod ranges;
pub mod reorg;
pub mod retry;
pub mod sync;

/// Block height on the chain
pub type BlockHeight = u64;

/// Inclusive range of block heights
pub type CompactBlockRange = std::ops::RangeInclusive<BlockHeight>;

pub use cancel::CancelToken;
pub use config::{
    SyncConfig, WalletBirthdayProvider, DEFAULT_DOWNLOAD_BATCH_SIZE, DEFAULT_DOWNLOAD_BUFFER_SIZE,
    DEFAULT_MAX_BACKOFF_INTERVAL, DEFAULT_POLL_INTERVAL, DEFAULT_RETRIES, DEFAULT_REWIND_DISTANCE,
    DEFAULT_SCANNING_BATCH_SIZE, MAX_REORG_SIZE,
};
pub use error::{Error, MismatchKind, Result};
pub use events::{EventSender, ProgressUpdate, SyncEvent, SyncPhase};
pub use interface::{
    CompactBlock, CompactBlockStore, LightWalletService, MemoryBlockStore, RawTransaction,
    ScanSummary, ScanningBackend, ServerInfo, TxId, UnspentOutput, WalletTransaction,
};
pub use markers::{
    Marker, MarkerSnapshot, MarkerStorage, MemoryMarkerStorage, SqliteMarkerStorage, SyncMarkers,
};
pub use pipeline::BlockDownloader;
pub use ranges::{compute_next_state, compute_sync_ranges, NextState, SyncRanges};
pub use reorg::{determine_rewind_height, ReorgHandler};
pub use retry::RetryScheduler;
pub use sync::{SyncEngine, SyncState};
