//! Mock collaborators and a test harness driving the sync engine.
#![allow(dead_code)]

use async_trait::async_trait;
use lightwallet_sync::{
    BlockHeight, CompactBlock, CompactBlockRange, CompactBlockStore, Error, LightWalletService,
    MemoryBlockStore, MemoryMarkerStorage, RawTransaction, Result, ScanSummary, ScanningBackend,
    ServerInfo, SyncConfig, SyncEngine, SyncEvent, SyncMarkers, TxId, UnspentOutput,
    WalletTransaction,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const BIRTHDAY: BlockHeight = 1_000;
pub const SAPLING_ACTIVATION: BlockHeight = 280_000;
pub const BRANCH_ID: &str = "c2d6d0b4";

pub fn test_config(birthday: BlockHeight) -> SyncConfig {
    SyncConfig::new("main", SAPLING_ACTIVATION, birthday)
}

/// Route engine tracing through the per-test capture buffer. Idempotent
/// across tests in the same process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

pub fn txid(seed: u8) -> TxId {
    TxId([seed; 32])
}

fn block(height: BlockHeight) -> CompactBlock {
    CompactBlock {
        height,
        hash: height.to_be_bytes().repeat(4),
        data: Vec::new(),
    }
}

/// Scripted remote light node.
pub struct MockService {
    pub chain_name: Mutex<String>,
    pub sapling_activation_height: AtomicU64,
    pub tip: AtomicU64,
    /// Forced `get_info` connection failures remaining
    pub get_info_failures: AtomicU64,
    /// Forced `block_range` connection failures remaining
    pub fetch_failures: AtomicU64,
    pub utxos: Mutex<Vec<UnspentOutput>>,
    pub block_requests: Mutex<Vec<CompactBlockRange>>,
}

impl MockService {
    pub fn new(tip: BlockHeight) -> Self {
        Self {
            chain_name: Mutex::new("main".to_string()),
            sapling_activation_height: AtomicU64::new(SAPLING_ACTIVATION),
            tip: AtomicU64::new(tip),
            get_info_failures: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            utxos: Mutex::new(Vec::new()),
            block_requests: Mutex::new(Vec::new()),
        }
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LightWalletService for MockService {
    async fn get_info(&self) -> Result<ServerInfo> {
        if Self::take_failure(&self.get_info_failures) {
            return Err(Error::Connection("connection refused".into()));
        }
        Ok(ServerInfo {
            chain_name: self.chain_name.lock().clone(),
            consensus_branch_id: BRANCH_ID.to_string(),
            sapling_activation_height: self.sapling_activation_height.load(Ordering::SeqCst),
            block_height: self.tip.load(Ordering::SeqCst),
        })
    }

    async fn latest_block_height(&self) -> Result<BlockHeight> {
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_range(&self, range: CompactBlockRange) -> Result<Vec<CompactBlock>> {
        if Self::take_failure(&self.fetch_failures) {
            return Err(Error::Connection("stream reset".into()));
        }
        self.block_requests.lock().push(range.clone());
        Ok(range.map(block).collect())
    }

    async fn fetch_transaction(&self, txid: TxId) -> Result<RawTransaction> {
        Ok(RawTransaction {
            txid,
            mined_height: Some(self.tip.load(Ordering::SeqCst)),
            data: vec![0xaa; 16],
        })
    }

    async fn fetch_utxos(
        &self,
        _addresses: Vec<String>,
        start_height: BlockHeight,
    ) -> Result<Vec<UnspentOutput>> {
        Ok(self
            .utxos
            .lock()
            .iter()
            .filter(|utxo| utxo.height >= start_height)
            .cloned()
            .collect())
    }
}

/// Scripted scanning backend sharing a block cache with the engine.
pub struct MockBackend {
    scanned: AtomicU64,
    cache: Arc<MemoryBlockStore>,
    scan_delay: Mutex<Duration>,
    /// Forced `scan_blocks` failures remaining, consumed after the delay
    pub scan_failures: AtomicU64,
    /// One queued entry per chain validation failure to inject
    pub validation_failures: Mutex<VecDeque<BlockHeight>>,
    /// Wallet transactions found when scanning past their height
    pub discoveries: Mutex<BTreeMap<BlockHeight, WalletTransaction>>,
    pub rewind_calls: Mutex<Vec<BlockHeight>>,
    pub addresses: Mutex<Vec<String>>,
    stored_utxos: Mutex<HashSet<(TxId, u32)>>,
    pub nearest_rewind_override: Mutex<Option<BlockHeight>>,
    pub proving_param_calls: AtomicU64,
}

impl MockBackend {
    pub fn new(scanned: BlockHeight, cache: Arc<MemoryBlockStore>) -> Self {
        Self {
            scanned: AtomicU64::new(scanned),
            cache,
            scan_delay: Mutex::new(Duration::ZERO),
            scan_failures: AtomicU64::new(0),
            validation_failures: Mutex::new(VecDeque::new()),
            discoveries: Mutex::new(BTreeMap::new()),
            rewind_calls: Mutex::new(Vec::new()),
            addresses: Mutex::new(Vec::new()),
            stored_utxos: Mutex::new(HashSet::new()),
            nearest_rewind_override: Mutex::new(None),
            proving_param_calls: AtomicU64::new(0),
        }
    }

    pub fn scanned_height(&self) -> BlockHeight {
        self.scanned.load(Ordering::SeqCst)
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        *self.scan_delay.lock() = delay;
    }

    pub fn discover(&self, height: BlockHeight, seed: u8) {
        self.discoveries.lock().insert(
            height,
            WalletTransaction {
                txid: txid(seed),
                mined_height: height,
                value: 5_000,
                memo: None,
            },
        );
    }
}

#[async_trait]
impl ScanningBackend for MockBackend {
    async fn validate_chain_continuity(&self, _limit: u64) -> Result<()> {
        if let Some(height) = self.validation_failures.lock().pop_front() {
            return Err(Error::ChainValidation { height });
        }
        Ok(())
    }

    async fn scan_blocks(&self, limit: u64) -> Result<ScanSummary> {
        let delay = *self.scan_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if MockService::take_failure(&self.scan_failures) {
            return Err(Error::Service("scanner unavailable".into()));
        }
        let current = self.scanned.load(Ordering::SeqCst);
        let cache_tip = self.cache.latest_height().await?.unwrap_or(current);
        let next = (current + limit).min(cache_tip.max(current));
        self.scanned.store(next, Ordering::SeqCst);

        let found_transactions = if next > current {
            self.discoveries
                .lock()
                .range(current + 1..=next)
                .map(|(_, tx)| tx.clone())
                .collect()
        } else {
            Vec::new()
        };
        Ok(ScanSummary {
            last_scanned_height: next,
            found_transactions,
        })
    }

    async fn found_transaction_ids(&self, range: CompactBlockRange) -> Result<Vec<TxId>> {
        Ok(self
            .discoveries
            .lock()
            .range(range)
            .map(|(_, tx)| tx.txid)
            .collect())
    }

    async fn enhance_transaction(&self, raw: RawTransaction) -> Result<WalletTransaction> {
        Ok(WalletTransaction {
            txid: raw.txid,
            mined_height: raw.mined_height.unwrap_or(0),
            value: 5_000,
            memo: Some("enhanced".to_string()),
        })
    }

    async fn store_utxo(&self, utxo: UnspentOutput) -> Result<bool> {
        Ok(self.stored_utxos.lock().insert((utxo.txid, utxo.index)))
    }

    async fn transparent_addresses(&self) -> Result<Vec<String>> {
        Ok(self.addresses.lock().clone())
    }

    async fn consensus_branch_id(&self, _height: BlockHeight) -> Result<String> {
        Ok(BRANCH_ID.to_string())
    }

    async fn nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight> {
        let override_height: Option<BlockHeight> = *self.nearest_rewind_override.lock();
        Ok(override_height.unwrap_or(height))
    }

    async fn rewind_to(&self, height: BlockHeight) -> Result<()> {
        self.rewind_calls.lock().push(height);
        let _ = self
            .scanned
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.min(height))
            });
        Ok(())
    }

    async fn ensure_proving_parameters(&self) -> Result<()> {
        self.proving_param_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fully wired engine over mocks, plus an event subscription.
pub struct Harness {
    pub engine: SyncEngine,
    pub service: Arc<MockService>,
    pub backend: Arc<MockBackend>,
    pub cache: Arc<MemoryBlockStore>,
    pub markers: SyncMarkers,
    pub events: broadcast::Receiver<SyncEvent>,
}

impl Harness {
    pub fn new(config: SyncConfig, tip: BlockHeight) -> Self {
        let storage = Arc::new(MemoryMarkerStorage::new());
        Self::with_storage(config, tip, storage)
    }

    pub fn with_storage(
        config: SyncConfig,
        tip: BlockHeight,
        storage: Arc<MemoryMarkerStorage>,
    ) -> Self {
        init_tracing();
        let markers = SyncMarkers::new(config.alias.clone(), storage.clone());
        let scanned = markers
            .get(lightwallet_sync::Marker::LatestScannedHeight)
            .unwrap();
        let start_scanned = if scanned == 0 {
            config.wallet_birthday().saturating_sub(1)
        } else {
            scanned
        };

        let service = Arc::new(MockService::new(tip));
        let cache = Arc::new(MemoryBlockStore::new());
        let backend = Arc::new(MockBackend::new(start_scanned, cache.clone()));
        let engine = SyncEngine::new(
            config,
            service.clone(),
            backend.clone(),
            cache.clone(),
            storage,
        );
        let events = engine.subscribe();
        Self {
            engine,
            service,
            backend,
            cache,
            markers,
            events,
        }
    }

    /// Next event, panicking after five seconds.
    pub async fn next_event(&mut self) -> SyncEvent {
        timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a sync event")
            .expect("event channel closed")
    }

    /// Skip events until one matches `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Wait for the next `Finished` event.
    pub async fn wait_finished(&mut self) -> (BlockHeight, bool) {
        match self
            .wait_for(|event| matches!(event, SyncEvent::Finished { .. }))
            .await
        {
            SyncEvent::Finished {
                height,
                found_blocks,
            } => (height, found_blocks),
            _ => unreachable!(),
        }
    }

    /// Wait for the next `Failed` event and return its error.
    pub async fn wait_failed(&mut self) -> Arc<Error> {
        match self
            .wait_for(|event| matches!(event, SyncEvent::Failed(_)))
            .await
        {
            SyncEvent::Failed(error) => error,
            _ => unreachable!(),
        }
    }
}
