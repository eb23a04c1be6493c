//! Block synchronization engine.
//!
//! One cycle walks a fixed state machine:
//!
//! ```text
//! ValidateServer -> ComputeSyncRanges -> ChecksBeforeSync -> ScanDownloaded
//!   -> Download -> Validate -> Scan -> ClearAlreadyScannedBlocks
//!   -> (Download while batches remain | Enhance) -> FetchUtxo
//!   -> HandleSaplingParams -> ClearCache -> Finished
//! ```
//!
//! `ComputeSyncRanges` short-circuits straight to `Finished` when there is
//! nothing to do. A chain continuity break rewinds and re-enters at
//! `ComputeSyncRanges`. Progress markers only advance after a stage completes,
//! so a cycle interrupted anywhere resumes from the last persisted marker.

use crate::cancel::CancelToken;
use crate::events::{EventSender, ProgressUpdate, SyncEvent, SyncPhase};
use crate::interface::{CompactBlockStore, LightWalletService, ScanningBackend};
use crate::markers::{Marker, MarkerStorage, SyncMarkers};
use crate::pipeline::BlockDownloader;
use crate::ranges::{compute_next_state, compute_sync_ranges, NextState, SyncRanges};
use crate::reorg::ReorgHandler;
use crate::retry::RetryScheduler;
use crate::{BlockHeight, Error, MismatchKind, Result, SyncConfig};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// States of the sync state machine.
///
/// `Finished`, `Failed` and `Stopped` are terminal for a cycle; a new
/// `start()` re-enters at `ValidateServer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Checking that the server serves the configured chain
    ValidateServer,
    /// Computing which ranges this cycle must process
    ComputeSyncRanges,
    /// Crash-recovery consistency checks between cache and markers
    ChecksBeforeSync,
    /// Scanning blocks a previous cycle downloaded but never scanned
    ScanDownloaded,
    /// Downloading a batch of compact blocks
    Download,
    /// Validating chain continuity of the downloaded batch
    Validate,
    /// Trial-decrypting the downloaded batch
    Scan,
    /// Trimming fully scanned blocks from the cache
    ClearAlreadyScannedBlocks,
    /// Fetching full detail for discovered transactions
    Enhance,
    /// Refreshing transparent UTXOs
    FetchUtxo,
    /// Ensuring proving parameters are present
    HandleSaplingParams,
    /// Dropping the block cache after a completed cycle
    ClearCache,
    /// Cycle completed
    Finished,
    /// Cycle failed
    Failed,
    /// Cycle stopped on request
    Stopped,
}

impl SyncState {
    /// Whether this state ends a cycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }
}

/// Operation deferred until the active cycle ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Wipe,
    Rewind(Option<BlockHeight>),
    AnotherSync,
}

/// At most one pending hook of each kind; only the highest-priority one runs
/// once the cycle has stopped.
#[derive(Debug, Default)]
struct DeferredHooks {
    wipe: bool,
    rewind: Option<Option<BlockHeight>>,
    another_sync: bool,
}

impl DeferredHooks {
    fn take_highest(&mut self) -> Option<Hook> {
        let hook = if self.wipe {
            Some(Hook::Wipe)
        } else if let Some(height) = self.rewind {
            Some(Hook::Rewind(height))
        } else if self.another_sync {
            Some(Hook::AnotherSync)
        } else {
            None
        };
        self.wipe = false;
        self.rewind = None;
        self.another_sync = false;
        hook
    }
}

/// Engine state guarded by the monitor mutex.
#[derive(Default)]
struct EngineState {
    cycle: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    cancel: CancelToken,
    retry: RetryScheduler,
    hooks: DeferredHooks,
}

impl EngineState {
    fn cycle_active(&self) -> bool {
        self.cycle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    config: SyncConfig,
    service: Arc<dyn LightWalletService>,
    backend: Arc<dyn ScanningBackend>,
    cache: Arc<dyn CompactBlockStore>,
    markers: SyncMarkers,
    events: EventSender,
    observable: parking_lot::RwLock<SyncState>,
    reorg: parking_lot::Mutex<ReorgHandler>,
    monitor: Mutex<EngineState>,
}

impl Inner {
    fn set_state(&self, state: SyncState) {
        tracing::debug!(?state, "sync state");
        *self.observable.write() = state;
    }
}

/// Cloneable handle to the sync engine.
///
/// All clones share one engine; at most one cycle runs at a time. Commands
/// issued while a cycle is active are deferred until it stops.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Build an engine over the given collaborators.
    pub fn new(
        config: SyncConfig,
        service: Arc<dyn LightWalletService>,
        backend: Arc<dyn ScanningBackend>,
        cache: Arc<dyn CompactBlockStore>,
        marker_storage: Arc<dyn MarkerStorage>,
    ) -> Self {
        let markers = SyncMarkers::new(config.alias.clone(), marker_storage);
        Self {
            inner: Arc::new(Inner {
                config,
                service,
                backend,
                cache,
                markers,
                events: EventSender::new(),
                observable: parking_lot::RwLock::new(SyncState::Stopped),
                reorg: parking_lot::Mutex::new(ReorgHandler::new()),
                monitor: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Current state of the engine
    pub fn state(&self) -> SyncState {
        *self.inner.observable.read()
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Start a sync cycle.
    ///
    /// While a cycle is active this queues a follow-up sync that runs once
    /// the current cycle ends; the running cycle is never interrupted.
    /// `retry: true` resets the transient attempt budget first; without it,
    /// a start against an exhausted budget fails with
    /// [`Error::MaxAttemptsReached`].
    pub async fn start(&self, retry: bool) -> Result<()> {
        let mut guard = self.inner.monitor.lock().await;
        if retry {
            guard.retry.reset();
            guard.abort_timer();
        }
        if guard.cycle_active() {
            tracing::info!("sync already in progress, queueing another sync");
            guard.hooks.another_sync = true;
            return Ok(());
        }
        if !guard.retry.has_attempt_left(&self.inner.config) {
            let attempts = guard.retry.attempts();
            let error = Error::MaxAttemptsReached(attempts);
            self.inner
                .events
                .send(SyncEvent::Failed(Arc::new(Error::MaxAttemptsReached(attempts))));
            return Err(error);
        }
        guard.abort_timer();
        spawn_cycle(&self.inner, &mut guard);
        Ok(())
    }

    /// Stop the active cycle cooperatively. Retry counters are left as they
    /// are. No-op when idle.
    pub async fn stop(&self) {
        let mut guard = self.inner.monitor.lock().await;
        guard.abort_timer();
        if guard.cycle_active() {
            guard.cancel.cancel();
        }
    }

    /// Rewind derived data, block cache and markers to the nearest usable
    /// height at or below `height` (the scanned frontier when `None`).
    ///
    /// When a cycle is active the rewind is queued and executed once the
    /// cycle has stopped.
    pub async fn rewind(&self, height: Option<BlockHeight>) -> Result<()> {
        let mut guard = self.inner.monitor.lock().await;
        if guard.cycle_active() {
            tracing::info!(?height, "sync in progress, deferring rewind");
            guard.hooks.rewind = Some(height);
            guard.cancel.cancel();
            return Ok(());
        }
        drop(guard);
        perform_rewind(&self.inner, height).await
    }

    /// Drop the block cache, all progress markers and all derived data back
    /// to the wallet birthday.
    ///
    /// When a cycle is active the wipe is queued and executed once the cycle
    /// has stopped.
    pub async fn wipe(&self) -> Result<()> {
        let mut guard = self.inner.monitor.lock().await;
        if guard.cycle_active() {
            tracing::info!("sync in progress, deferring wipe");
            guard.hooks.wipe = true;
            guard.cancel.cancel();
            return Ok(());
        }
        drop(guard);
        perform_wipe(&self.inner).await
    }
}

/// Spawn the cycle task. Caller holds the monitor lock.
fn spawn_cycle(inner: &Arc<Inner>, guard: &mut EngineState) {
    let cancel = CancelToken::new();
    guard.cancel = cancel.clone();
    let inner = Arc::clone(inner);
    guard.cycle = Some(tokio::spawn(async move {
        inner.events.send(SyncEvent::SyncStarted);
        let outcome = Cycle::new(Arc::clone(&inner), cancel).run().await;
        finish_cycle(inner, outcome).await;
    }));
}

/// Arm a one-shot timer that starts the next cycle, unless one is already
/// running or the budget ran out in the meantime.
fn arm_timer(inner: &Arc<Inner>, guard: &mut EngineState, interval: std::time::Duration) {
    guard.abort_timer();
    let inner = Arc::clone(inner);
    guard.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        let mut guard = inner.monitor.lock().await;
        guard.timer = None;
        if guard.cycle_active() || !guard.retry.has_attempt_left(&inner.config) {
            return;
        }
        spawn_cycle(&inner, &mut guard);
    }));
}

async fn perform_rewind(inner: &Arc<Inner>, height: Option<BlockHeight>) -> Result<()> {
    let scanned = inner.markers.get(Marker::LatestScannedHeight)?;
    let requested = height.unwrap_or(scanned);
    let nearest = inner.backend.nearest_rewind_height(requested).await?;
    if nearest == 0 {
        return Err(Error::Rewind(format!(
            "no usable rewind height at or below {requested}"
        )));
    }
    let target = nearest.saturating_sub(1).max(inner.config.wallet_birthday());
    tracing::info!(requested, target, "rewinding wallet state");
    inner.backend.rewind_to(target).await?;
    inner.cache.rewind(target).await?;
    inner.markers.rewind(target)?;
    Ok(())
}

async fn perform_wipe(inner: &Arc<Inner>) -> Result<()> {
    let birthday = inner.config.wallet_birthday();
    tracing::info!(birthday, "wiping wallet sync state");
    inner.cache.clear_all().await?;
    inner.markers.wipe()?;
    inner.backend.rewind_to(birthday).await?;
    Ok(())
}

/// What a completed cycle reports
struct CycleOutcome {
    height: BlockHeight,
    found_blocks: bool,
}

/// Cycle epilogue: route the outcome, replay deferred hooks, arm timers.
async fn finish_cycle(inner: Arc<Inner>, outcome: Result<CycleOutcome>) {
    let mut guard = inner.monitor.lock().await;
    guard.cycle = None;

    match outcome {
        Ok(outcome) => {
            guard.retry.reset();
            inner.reorg.lock().record_clean_batch();
            inner.set_state(SyncState::Finished);
            inner.events.send(SyncEvent::Finished {
                height: outcome.height,
                found_blocks: outcome.found_blocks,
            });
            arm_timer(&inner, &mut guard, inner.config.block_poll_interval());
            replay_hooks(inner.clone(), guard).await;
        }
        Err(Error::Cancelled) => {
            inner.set_state(SyncState::Stopped);
            inner.events.send(SyncEvent::Stopped);
            replay_hooks(inner.clone(), guard).await;
        }
        Err(error) => {
            let retryable = error.is_retryable();
            tracing::error!(%error, retryable, "sync cycle failed");
            inner.set_state(SyncState::Failed);
            inner.events.send(SyncEvent::Failed(Arc::new(error)));
            if retryable {
                guard.retry.record_failure();
                if guard.retry.has_attempt_left(&inner.config) {
                    let interval = guard.retry.backoff_interval(&inner.config);
                    tracing::info!(
                        attempt = guard.retry.attempts(),
                        ?interval,
                        "scheduling sync retry"
                    );
                    arm_timer(&inner, &mut guard, interval);
                } else {
                    inner.events.send(SyncEvent::Failed(Arc::new(
                        Error::MaxAttemptsReached(guard.retry.attempts()),
                    )));
                }
            }
            // A wipe or rewind queued mid-cycle must not sit out a retry
            // running against the stale state. A queued follow-up sync is
            // dropped here: the retry timer covers the retryable case, and
            // after a fatal error restarting takes an explicit `start`.
            if let Some(hook @ (Hook::Wipe | Hook::Rewind(_))) = guard.hooks.take_highest() {
                run_hook(inner.clone(), guard, hook).await;
            }
        }
    }
}

/// Run the highest-priority deferred hook, if any.
async fn replay_hooks(inner: Arc<Inner>, mut guard: tokio::sync::MutexGuard<'_, EngineState>) {
    let Some(hook) = guard.hooks.take_highest() else {
        return;
    };
    run_hook(inner, guard, hook).await;
}

/// Consumes the guard so the monitor is released while the hook's own async
/// work runs.
async fn run_hook(
    inner: Arc<Inner>,
    mut guard: tokio::sync::MutexGuard<'_, EngineState>,
    hook: Hook,
) {
    tracing::info!(?hook, "replaying deferred operation");
    match hook {
        Hook::AnotherSync => {
            guard.abort_timer();
            spawn_cycle(&inner, &mut guard);
        }
        Hook::Wipe => {
            guard.abort_timer();
            drop(guard);
            if let Err(error) = perform_wipe(&inner).await {
                inner.set_state(SyncState::Failed);
                inner.events.send(SyncEvent::Failed(Arc::new(error)));
            }
        }
        Hook::Rewind(height) => {
            guard.abort_timer();
            drop(guard);
            if let Err(error) = perform_rewind(&inner, height).await {
                inner.set_state(SyncState::Failed);
                inner.events.send(SyncEvent::Failed(Arc::new(error)));
            }
        }
    }
}

/// One run of the state machine.
struct Cycle {
    inner: Arc<Inner>,
    cancel: CancelToken,
    ranges: SyncRanges,
    downloader: Option<BlockDownloader>,
    current_batch: Option<crate::CompactBlockRange>,
    progress_start: BlockHeight,
    scan_frontier: BlockHeight,
    finish_height: BlockHeight,
    found_blocks: bool,
}

impl Cycle {
    fn new(inner: Arc<Inner>, cancel: CancelToken) -> Self {
        Self {
            inner,
            cancel,
            ranges: SyncRanges::default(),
            downloader: None,
            current_batch: None,
            progress_start: 0,
            scan_frontier: 0,
            finish_height: 0,
            found_blocks: false,
        }
    }

    async fn run(mut self) -> Result<CycleOutcome> {
        let mut state = SyncState::ValidateServer;
        loop {
            if let Err(error) = self.cancel.checkpoint() {
                self.teardown().await;
                return Err(error);
            }
            self.inner.set_state(state);

            let next = match state {
                SyncState::ValidateServer => self.validate_server().await,
                SyncState::ComputeSyncRanges => self.compute_sync_ranges().await,
                SyncState::ChecksBeforeSync => self.checks_before_sync().await,
                SyncState::ScanDownloaded => self.scan_downloaded().await,
                SyncState::Download => self.download_next_batch().await,
                SyncState::Validate => self.validate().await,
                SyncState::Scan => self.scan_batch().await,
                SyncState::ClearAlreadyScannedBlocks => self.clear_already_scanned().await,
                SyncState::Enhance => self.enhance().await,
                SyncState::FetchUtxo => self.fetch_utxo().await,
                SyncState::HandleSaplingParams => self.handle_sapling_params().await,
                SyncState::ClearCache => self.clear_cache().await,
                SyncState::Finished | SyncState::Failed | SyncState::Stopped => break,
            };

            state = match next {
                Ok(next) => next,
                Err(Error::ChainValidation { height }) => match self.handle_reorg(height).await {
                    Ok(next) => next,
                    Err(error) => {
                        self.teardown().await;
                        return Err(error);
                    }
                },
                Err(error) => {
                    self.teardown().await;
                    return Err(error);
                }
            };
        }
        self.teardown().await;
        Ok(CycleOutcome {
            height: self.finish_height,
            found_blocks: self.found_blocks,
        })
    }

    async fn teardown(&mut self) {
        if let Some(downloader) = self.downloader.take() {
            downloader.shutdown().await;
        }
    }

    /// Publish a progress update for `phase`. The fraction follows the scan
    /// frontier rather than the phase's own height, keeping the reported
    /// sequence monotone while downloading runs ahead of scanning.
    fn emit_progress(&self, phase: SyncPhase, height: BlockHeight) {
        let target = self.ranges.latest_block_height;
        self.inner.events.send(SyncEvent::ProgressUpdated(ProgressUpdate {
            phase,
            progress: ProgressUpdate::fraction(self.progress_start, self.scan_frontier, target),
            progress_height: height,
            target_height: target,
        }));
    }

    /// Compare the server's chain metadata against the local expectations.
    async fn validate_server(&mut self) -> Result<SyncState> {
        let info = self.inner.service.get_info().await?;
        let config = &self.inner.config;

        if info.chain_name != config.network_name {
            return Err(Error::ServerMismatch {
                kind: MismatchKind::ChainName,
                expected: config.network_name.clone(),
                found: info.chain_name,
            });
        }
        if info.sapling_activation_height != config.sapling_activation_height {
            return Err(Error::ServerMismatch {
                kind: MismatchKind::SaplingActivation,
                expected: config.sapling_activation_height.to_string(),
                found: info.sapling_activation_height.to_string(),
            });
        }
        let local_branch = self.inner.backend.consensus_branch_id(info.block_height).await?;
        if info.consensus_branch_id != local_branch {
            return Err(Error::ServerMismatch {
                kind: MismatchKind::BranchId,
                expected: local_branch,
                found: info.consensus_branch_id,
            });
        }
        Ok(SyncState::ComputeSyncRanges)
    }

    async fn compute_sync_ranges(&mut self) -> Result<SyncState> {
        self.inner.cache.create().await?;
        self.inner
            .markers
            .migrate_if_needed(self.inner.cache.latest_height().await?)?;

        let tip = self.inner.service.latest_block_height().await?;
        let snapshot = self.inner.markers.snapshot()?;
        let birthday = self.inner.config.wallet_birthday();

        match compute_next_state(tip, snapshot, birthday) {
            NextState::Wait {
                latest_height,
                latest_download_height,
            } => {
                tracing::warn!(
                    latest_height,
                    latest_download_height,
                    "server is behind the local view, waiting"
                );
                self.finish_height = latest_height;
                Ok(SyncState::Finished)
            }
            NextState::FinishProcessing { height } => {
                self.finish_height = height;
                Ok(SyncState::Finished)
            }
            NextState::ProcessNewBlocks { ranges } => {
                tracing::info!(
                    latest_block_height = ranges.latest_block_height,
                    downloaded_but_unscanned = ?ranges.downloaded_but_unscanned,
                    download_and_scan = ?ranges.download_and_scan,
                    enhance = ?ranges.enhance,
                    fetch_utxo = ?ranges.fetch_utxo,
                    "sync ranges computed"
                );
                self.finish_height = ranges.latest_block_height;
                self.progress_start = ranges
                    .downloaded_but_unscanned
                    .as_ref()
                    .or(ranges.download_and_scan.as_ref())
                    .map(|range| *range.start())
                    .unwrap_or(ranges.latest_block_height);
                self.scan_frontier = self.progress_start.saturating_sub(1);
                self.ranges = ranges;
                Ok(SyncState::ChecksBeforeSync)
            }
        }
    }

    /// Realign state an abruptly interrupted earlier sync may have left
    /// behind: a scanned marker ahead of the downloaded marker means the
    /// download bookkeeping was lost, so the cache content is untrustworthy.
    async fn checks_before_sync(&mut self) -> Result<SyncState> {
        let snapshot = self.inner.markers.snapshot()?;
        if snapshot.latest_scanned_height > snapshot.latest_downloaded_block_height {
            tracing::warn!(
                scanned = snapshot.latest_scanned_height,
                downloaded = snapshot.latest_downloaded_block_height,
                "scanned marker ahead of downloaded marker, clearing block cache"
            );
            self.inner.cache.clear_all().await?;
            self.inner
                .markers
                .set(Marker::LatestDownloadedBlockHeight, snapshot.latest_scanned_height)?;
            self.ranges = compute_sync_ranges(
                self.ranges.latest_block_height,
                self.inner.markers.snapshot()?,
                self.inner.config.wallet_birthday(),
            );
        }
        Ok(SyncState::ScanDownloaded)
    }

    /// Scan blocks a previous cycle downloaded but never got to scan.
    async fn scan_downloaded(&mut self) -> Result<SyncState> {
        if let Some(range) = self.ranges.downloaded_but_unscanned.clone() {
            tracing::debug!(
                start = *range.start(),
                end = *range.end(),
                "scanning blocks left over from an interrupted sync"
            );
            self.scan_range(range).await?;
        }
        Ok(SyncState::Download)
    }

    async fn download_next_batch(&mut self) -> Result<SyncState> {
        let Some(range) = self.ranges.download_and_scan.clone() else {
            return Ok(SyncState::Enhance);
        };
        if self.downloader.is_none() {
            self.downloader = Some(BlockDownloader::spawn(
                Arc::clone(&self.inner.service),
                range,
                self.inner.config.download_batch_size,
                self.inner.config.download_buffer_size,
                self.cancel.clone(),
            ));
        }
        let batch = match self.downloader.as_mut() {
            Some(downloader) => downloader.next_batch().await,
            None => None,
        };
        match batch {
            Some(Ok(blocks)) => {
                let batch_range = match (blocks.first(), blocks.last()) {
                    (Some(first), Some(last)) => first.height..=last.height,
                    _ => return Ok(SyncState::Enhance),
                };
                self.inner.cache.write(blocks).await?;
                self.inner
                    .markers
                    .set(Marker::LatestDownloadedBlockHeight, *batch_range.end())?;
                self.emit_progress(SyncPhase::Download, *batch_range.end());
                self.current_batch = Some(batch_range);
                Ok(SyncState::Validate)
            }
            Some(Err(error)) => Err(error),
            None => Ok(SyncState::Enhance),
        }
    }

    async fn validate(&mut self) -> Result<SyncState> {
        self.inner
            .backend
            .validate_chain_continuity(self.inner.config.download_batch_size)
            .await?;
        self.inner.reorg.lock().record_clean_batch();
        Ok(SyncState::Scan)
    }

    async fn scan_batch(&mut self) -> Result<SyncState> {
        if let Some(range) = self.current_batch.take() {
            self.scan_range(range).await?;
        }
        Ok(SyncState::ClearAlreadyScannedBlocks)
    }

    async fn clear_already_scanned(&mut self) -> Result<SyncState> {
        let scanned = self.inner.markers.get(Marker::LatestScannedHeight)?;
        if scanned > 0 {
            self.inner.cache.clear_up_to(scanned).await?;
        }
        Ok(SyncState::Download)
    }

    /// Drive the scanning backend over `range` in bounded steps, persisting
    /// the scanned marker and publishing discoveries after each step.
    async fn scan_range(&mut self, range: crate::CompactBlockRange) -> Result<()> {
        let mut last_scanned = range.start().saturating_sub(1);
        while last_scanned < *range.end() {
            self.cancel.checkpoint()?;
            let summary = self
                .inner
                .backend
                .scan_blocks(self.inner.config.scanning_batch_size)
                .await?;
            if summary.last_scanned_height <= last_scanned {
                return Err(Error::Service(format!(
                    "scanner made no progress past height {last_scanned}"
                )));
            }
            let step_start = last_scanned + 1;
            last_scanned = summary.last_scanned_height;
            self.inner.markers.set(Marker::LatestScannedHeight, last_scanned)?;
            self.scan_frontier = last_scanned;
            self.found_blocks = true;

            if !summary.found_transactions.is_empty() {
                self.inner.events.send(SyncEvent::FoundTransactions {
                    transactions: summary.found_transactions,
                    range: step_start..=last_scanned,
                });
            }
            self.emit_progress(SyncPhase::Scan, last_scanned);
        }
        Ok(())
    }

    /// Fetch full detail for every discovered transaction in the enhance
    /// range.
    async fn enhance(&mut self) -> Result<SyncState> {
        self.teardown().await;
        let Some(range) = self.ranges.enhance.clone() else {
            return Ok(SyncState::FetchUtxo);
        };

        let txids = self.inner.backend.found_transaction_ids(range.clone()).await?;
        tracing::debug!(
            start = *range.start(),
            end = *range.end(),
            count = txids.len(),
            "enhancing transactions"
        );
        let mut enhanced = Vec::with_capacity(txids.len());
        for txid in txids {
            self.cancel.checkpoint()?;
            let raw = self.inner.service.fetch_transaction(txid).await?;
            let transaction = self.inner.backend.enhance_transaction(raw).await?;
            self.emit_progress(SyncPhase::Enhance, transaction.mined_height);
            enhanced.push(transaction);
        }
        self.inner.markers.set(Marker::LatestEnhancedHeight, *range.end())?;

        if !enhanced.is_empty() {
            self.inner.events.send(SyncEvent::FoundTransactions {
                transactions: enhanced,
                range,
            });
        }
        Ok(SyncState::FetchUtxo)
    }

    async fn fetch_utxo(&mut self) -> Result<SyncState> {
        let Some(range) = self.ranges.fetch_utxo.clone() else {
            return Ok(SyncState::HandleSaplingParams);
        };

        let addresses = self.inner.backend.transparent_addresses().await?;
        let mut inserted = 0u64;
        let mut skipped = 0u64;
        if !addresses.is_empty() {
            let utxos = self
                .inner
                .service
                .fetch_utxos(addresses, *range.start())
                .await?;
            for utxo in utxos {
                self.cancel.checkpoint()?;
                if self.inner.backend.store_utxo(utxo).await? {
                    inserted += 1;
                } else {
                    skipped += 1;
                }
            }
        }
        self.inner.markers.set(Marker::LatestUtxoFetchedHeight, *range.end())?;
        self.inner.events.send(SyncEvent::StoredUtxos { inserted, skipped });
        Ok(SyncState::HandleSaplingParams)
    }

    async fn handle_sapling_params(&mut self) -> Result<SyncState> {
        self.inner.backend.ensure_proving_parameters().await?;
        Ok(SyncState::ClearCache)
    }

    async fn clear_cache(&mut self) -> Result<SyncState> {
        self.inner.cache.clear_all().await?;
        if self.found_blocks {
            let target = self.ranges.latest_block_height;
            self.inner.events.send(SyncEvent::ProgressUpdated(ProgressUpdate {
                phase: SyncPhase::Scan,
                progress: 1.0,
                progress_height: target,
                target_height: target,
            }));
        }
        Ok(SyncState::Finished)
    }

    /// Recover from a chain continuity break: rewind everything to a height
    /// below the break and recompute the ranges.
    async fn handle_reorg(&mut self, reorg_height: BlockHeight) -> Result<SyncState> {
        let rewind_height = self
            .inner
            .reorg
            .lock()
            .handle_failure(reorg_height, &self.inner.config);
        tracing::warn!(reorg_height, rewind_height, "chain reorg detected, rewinding");

        self.teardown().await;
        self.inner.backend.rewind_to(rewind_height).await?;
        self.inner.cache.rewind(rewind_height).await?;
        self.inner.markers.rewind(rewind_height)?;
        self.current_batch = None;

        self.inner.events.send(SyncEvent::HandledReorg {
            reorg_height,
            rewind_height,
        });
        Ok(SyncState::ComputeSyncRanges)
    }
}
