//! Sync range computation
//!
//! Pure functions deciding, from the chain tip and the persisted progress
//! markers, exactly which height ranges the next cycle must download, scan,
//! enhance and fetch UTXOs for. The sync process can be interrupted at any
//! phase; because each phase is tracked independently, these functions let
//! it resume from whatever the last cycle persisted.

use crate::markers::MarkerSnapshot;
use crate::{BlockHeight, CompactBlockRange};

/// Height ranges one sync cycle has to process.
///
/// Each sub-range is `None` when that phase has nothing to do. All `Some`
/// ranges are non-inverted, floored at the wallet birthday and capped at
/// `latest_block_height`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncRanges {
    /// Chain tip at the time the ranges were computed
    pub latest_block_height: BlockHeight,
    /// Blocks a previous cycle downloaded but never scanned; scanned first so
    /// the cache can be trimmed before new downloads start
    pub downloaded_but_unscanned: Option<CompactBlockRange>,
    /// Blocks not yet downloaded nor scanned
    pub download_and_scan: Option<CompactBlockRange>,
    /// Blocks whose wallet transactions still lack enhancement detail
    pub enhance: Option<CompactBlockRange>,
    /// Blocks for which transparent UTXOs were not fetched yet
    pub fetch_utxo: Option<CompactBlockRange>,
    /// Persisted scanned marker the computation was based on, if ever set
    pub latest_scanned_height: Option<BlockHeight>,
    /// Persisted download marker the computation was based on, if ever set
    pub latest_downloaded_height: Option<BlockHeight>,
}

impl SyncRanges {
    /// Whether no phase has anything to do
    pub fn is_empty(&self) -> bool {
        self.downloaded_but_unscanned.is_none()
            && self.download_and_scan.is_none()
            && self.enhance.is_none()
            && self.fetch_utxo.is_none()
    }
}

/// What the next cycle should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextState {
    /// Local markers are ahead of the reported tip; the server is probably
    /// still catching up. Do nothing destructive.
    Wait {
        /// Tip reported by the server
        latest_height: BlockHeight,
        /// Local download marker
        latest_download_height: BlockHeight,
    },
    /// Everything is processed up to the tip
    FinishProcessing {
        /// The tip the wallet is synced to
        height: BlockHeight,
    },
    /// There is work to do
    ProcessNewBlocks {
        /// Ranges to process
        ranges: SyncRanges,
    },
}

/// Compute what the next cycle should do from the chain tip, the persisted
/// markers and the wallet birthday.
pub fn compute_next_state(
    latest_block_height: BlockHeight,
    markers: MarkerSnapshot,
    wallet_birthday: BlockHeight,
) -> NextState {
    let MarkerSnapshot {
        latest_downloaded_block_height: downloaded,
        latest_scanned_height: scanned,
        latest_enhanced_height: enhanced,
        latest_utxo_fetched_height: utxo_fetched,
    } = markers;

    if downloaded > latest_block_height
        || scanned > latest_block_height
        || enhanced > latest_block_height
        || utxo_fetched > latest_block_height
    {
        NextState::Wait {
            latest_height: latest_block_height,
            latest_download_height: downloaded,
        }
    } else if downloaded < latest_block_height
        || scanned < latest_block_height
        || enhanced < latest_block_height
        || utxo_fetched < latest_block_height
    {
        NextState::ProcessNewBlocks {
            ranges: compute_sync_ranges(latest_block_height, markers, wallet_birthday),
        }
    } else {
        NextState::FinishProcessing {
            height: latest_block_height,
        }
    }
}

/// Build the per-phase ranges for one cycle.
pub fn compute_sync_ranges(
    latest_block_height: BlockHeight,
    markers: MarkerSnapshot,
    wallet_birthday: BlockHeight,
) -> SyncRanges {
    let downloaded = markers.latest_downloaded_block_height;
    let scanned = markers.latest_scanned_height;

    // Blocks left behind by an interrupted cycle: downloaded into the cache,
    // marker persisted, but never scanned.
    let downloaded_but_unscanned = if scanned < downloaded {
        Some(scanned + 1..=downloaded)
    } else {
        None
    };

    if scanned > downloaded {
        tracing::warn!(
            latest_block_height,
            downloaded,
            scanned,
            "inconsistent markers: scanned height is ahead of downloaded height"
        );
    }

    SyncRanges {
        latest_block_height,
        downloaded_but_unscanned,
        download_and_scan: compute_range(
            downloaded.max(scanned),
            wallet_birthday,
            latest_block_height,
        ),
        enhance: compute_range(
            markers.latest_enhanced_height,
            wallet_birthday,
            latest_block_height,
        ),
        fetch_utxo: compute_range(
            markers.latest_utxo_fetched_height,
            wallet_birthday,
            latest_block_height,
        ),
        latest_scanned_height: (scanned > 0).then_some(scanned),
        latest_downloaded_height: (downloaded > 0).then_some(downloaded),
    }
}

/// Range of blocks a phase still has to process, `None` when it is caught up
/// or the birthday lies past the tip.
fn compute_range(
    tracked_height: BlockHeight,
    wallet_birthday: BlockHeight,
    latest_block_height: BlockHeight,
) -> Option<CompactBlockRange> {
    if tracked_height >= latest_block_height {
        return None;
    }
    let lower = if tracked_height <= wallet_birthday {
        wallet_birthday
    } else {
        tracked_height + 1
    };
    if lower > latest_block_height {
        return None;
    }
    Some(lower..=latest_block_height)
}

/// Number of download batches covering `range`
pub fn batch_count(range: &CompactBlockRange, batch_size: u64) -> u64 {
    debug_assert!(batch_size > 0);
    let len = range.end() - range.start() + 1;
    len.div_ceil(batch_size)
}

/// Batch `index` of `range` partitioned into `batch_size` chunks.
///
/// The partition is exhaustive and non-overlapping; the last batch is capped
/// at the range's upper bound.
pub fn batch_range(range: &CompactBlockRange, index: u64, batch_size: u64) -> CompactBlockRange {
    debug_assert!(batch_size > 0);
    let lower = range.start() + index * batch_size;
    let upper = (lower + batch_size - 1).min(*range.end());
    lower..=upper
}
