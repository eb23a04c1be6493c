//! Chain reorg detection bookkeeping and rewind-height computation.

use crate::{BlockHeight, SyncConfig};

/// Tracks consecutive chain-validation failures and computes how far to
/// rewind when one occurs.
///
/// Every consecutive failure widens the rewind window by `rewind_distance`,
/// capped at `max_reorg_size`, so repeated mismatches walk progressively
/// deeper into the chain until a common ancestor is found.
#[derive(Debug, Default)]
pub struct ReorgHandler {
    consecutive_errors: u64,
    last_failure_height: Option<BlockHeight>,
}

impl ReorgHandler {
    /// New handler with no recorded failures
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chain validation failures since the last clean batch
    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors
    }

    /// Height of the most recent continuity break, if any
    pub fn last_failure_height(&self) -> Option<BlockHeight> {
        self.last_failure_height
    }

    /// Record a continuity break at `error_height` and return the height to
    /// rewind everything to.
    pub fn handle_failure(&mut self, error_height: BlockHeight, config: &SyncConfig) -> BlockHeight {
        let rewind_height = determine_rewind_height(
            error_height,
            self.consecutive_errors,
            config.wallet_birthday(),
            config.rewind_distance,
            config.max_reorg_size,
        );
        self.consecutive_errors += 1;
        self.last_failure_height = Some(error_height);
        rewind_height
    }

    /// A batch validated cleanly; forget the failure streak.
    pub fn record_clean_batch(&mut self) {
        self.consecutive_errors = 0;
        self.last_failure_height = None;
    }
}

/// Safe height to rewind to after a continuity break at `error_height`.
///
/// `offset = min(max_reorg_size, rewind_distance * (consecutive_errors + 1))`,
/// floored at `wallet_birthday - max_reorg_size` so recovery never walks
/// meaningfully below the wallet's own history.
pub fn determine_rewind_height(
    error_height: BlockHeight,
    consecutive_errors: u64,
    wallet_birthday: BlockHeight,
    rewind_distance: u64,
    max_reorg_size: u64,
) -> BlockHeight {
    let offset = max_reorg_size.min(rewind_distance * (consecutive_errors + 1));
    error_height
        .saturating_sub(offset)
        .max(wallet_birthday.saturating_sub(max_reorg_size))
}
