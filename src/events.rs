//! Engine event stream.

use crate::interface::WalletTransaction;
use crate::{BlockHeight, CompactBlockRange, Error};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel backing the event stream. Slow
/// subscribers that fall further behind than this lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pipeline phase a progress update refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Downloading compact blocks
    Download,
    /// Validating chain continuity
    Validate,
    /// Trial-decrypting blocks
    Scan,
    /// Fetching full transaction detail
    Enhance,
    /// Fetching transparent UTXOs
    FetchUtxo,
}

impl SyncPhase {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Download => "Downloading",
            Self::Validate => "Validating",
            Self::Scan => "Scanning",
            Self::Enhance => "Enhancing",
            Self::FetchUtxo => "Fetching UTXOs",
        }
    }
}

/// A progress report for the running cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Phase the cycle is in
    pub phase: SyncPhase,
    /// Completed fraction of the cycle, in `[0, 1]`
    pub progress: f32,
    /// Height most recently processed
    pub progress_height: BlockHeight,
    /// Height the cycle is working towards
    pub target_height: BlockHeight,
}

impl ProgressUpdate {
    /// Progress fraction over the cycle's total range, monotone and clamped
    /// to `[0, 1)`; the final report states `1.0` explicitly.
    pub fn fraction(
        cycle_start: BlockHeight,
        processed: BlockHeight,
        cycle_target: BlockHeight,
    ) -> f32 {
        if cycle_target <= cycle_start {
            return 0.0;
        }
        let total = (cycle_target - cycle_start) as f32;
        let done = processed.saturating_sub(cycle_start) as f32;
        (done / total).clamp(0.0, 0.999_9)
    }
}

/// Events emitted by the sync engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A sync cycle started
    SyncStarted,
    /// Progress of the running cycle changed
    ProgressUpdated(ProgressUpdate),
    /// Scanning discovered wallet transactions in a range
    FoundTransactions {
        /// Discovered transactions
        transactions: Vec<WalletTransaction>,
        /// Range they were discovered in
        range: CompactBlockRange,
    },
    /// A chain reorg was detected and recovered from
    HandledReorg {
        /// Height the continuity break was detected at
        reorg_height: BlockHeight,
        /// Height everything was rewound to
        rewind_height: BlockHeight,
    },
    /// Transparent UTXOs were fetched and stored
    StoredUtxos {
        /// Newly inserted outputs
        inserted: u64,
        /// Outputs skipped as duplicates
        skipped: u64,
    },
    /// The cycle failed
    Failed(Arc<Error>),
    /// The cycle was stopped on request
    Stopped,
    /// The cycle finished; the wallet is synced to `height`
    Finished {
        /// Chain tip the wallet is synced to
        height: BlockHeight,
        /// Whether this cycle actually processed any blocks
        found_blocks: bool,
    },
}

/// Broadcast sender for engine events.
///
/// Sending never blocks and never fails: events emitted while nobody is
/// subscribed are simply dropped.
#[derive(Clone)]
pub struct EventSender {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventSender {
    /// New sender with no subscribers
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers
    pub fn send(&self, event: SyncEvent) {
        tracing::debug!(?event, "sync event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_monotone_and_clamped() {
        let start = 1_000;
        let target = 2_000;
        let mut previous = 0.0f32;
        for processed in (1_000..=2_000).step_by(100) {
            let fraction = ProgressUpdate::fraction(start, processed, target);
            assert!(fraction >= previous);
            assert!((0.0..1.0).contains(&fraction));
            previous = fraction;
        }
        // Even at the target the fraction stays below 1; the engine reports
        // 1.0 explicitly in its final update.
        assert!(ProgressUpdate::fraction(start, target, target) < 1.0);
        assert_eq!(ProgressUpdate::fraction(1_000, 1_500, 1_000), 0.0);
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_fine() {
        let sender = EventSender::new();
        sender.send(SyncEvent::SyncStarted);

        let mut rx = sender.subscribe();
        sender.send(SyncEvent::Stopped);
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::Stopped));
    }
}
