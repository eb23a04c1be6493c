//! Collaborator interfaces for the sync engine
//!
//! The engine orchestrates three fallible async collaborators: the remote
//! light node, the note-scanning backend, and the compact block cache. Real
//! wallets provide concrete implementations; tests drive the engine with
//! mocks.

use crate::{BlockHeight, CompactBlockRange, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub [u8; 32]);

impl std::fmt::Debug for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Condensed block representation holding only what wallet scanning needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    /// Block height
    pub height: BlockHeight,
    /// Block hash
    pub hash: Vec<u8>,
    /// Serialized compact block payload
    pub data: Vec<u8>,
}

/// Server metadata returned by `get_info`
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Chain name, e.g. "main" or "test"
    pub chain_name: String,
    /// Consensus branch id the server is following
    pub consensus_branch_id: String,
    /// Sapling activation height on the server's chain
    pub sapling_activation_height: BlockHeight,
    /// Current chain tip height
    pub block_height: BlockHeight,
}

/// Raw transaction bytes as served by the remote node
#[derive(Debug, Clone)]
pub struct RawTransaction {
    /// Transaction id
    pub txid: TxId,
    /// Height the transaction was mined at, if mined
    pub mined_height: Option<BlockHeight>,
    /// Serialized transaction
    pub data: Vec<u8>,
}

/// Wallet-relevant transaction discovered by scanning or enhancement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    /// Transaction id
    pub txid: TxId,
    /// Height the transaction was mined at
    pub mined_height: BlockHeight,
    /// Net value change for the wallet, in the chain's smallest unit
    pub value: i64,
    /// Decrypted memo, populated by enhancement
    pub memo: Option<String>,
}

/// Transparent unspent output fetched from the remote node
#[derive(Debug, Clone)]
pub struct UnspentOutput {
    /// Owning transparent address
    pub address: String,
    /// Funding transaction id
    pub txid: TxId,
    /// Output index within the funding transaction
    pub index: u32,
    /// Locking script
    pub script: Vec<u8>,
    /// Value in the chain's smallest unit
    pub value: u64,
    /// Height the output was mined at
    pub height: BlockHeight,
}

/// Result of one scanner step
#[derive(Debug, Clone)]
pub struct ScanSummary {
    /// Highest height the backend has scanned through
    pub last_scanned_height: BlockHeight,
    /// Wallet transactions discovered in this step
    pub found_transactions: Vec<WalletTransaction>,
}

/// Remote light node service.
///
/// All calls are fallible; implementations map wire failures onto
/// `Error::Connection`, `Error::Timeout` or `Error::Service` so the engine
/// can classify them.
#[async_trait]
pub trait LightWalletService: Send + Sync {
    /// Fetch server metadata
    async fn get_info(&self) -> Result<ServerInfo>;

    /// Current chain tip height
    async fn latest_block_height(&self) -> Result<BlockHeight>;

    /// Fetch the compact blocks of an inclusive height range, ordered by
    /// ascending height
    async fn block_range(&self, range: CompactBlockRange) -> Result<Vec<CompactBlock>>;

    /// Fetch a full transaction by id
    async fn fetch_transaction(&self, txid: TxId) -> Result<RawTransaction>;

    /// Fetch unspent transparent outputs for the given addresses from
    /// `start_height` onwards
    async fn fetch_utxos(
        &self,
        addresses: Vec<String>,
        start_height: BlockHeight,
    ) -> Result<Vec<UnspentOutput>>;
}

/// Cryptographic note-scanning backend.
///
/// Owns the wallet's derived data store. The engine never interprets block
/// contents itself; it only sequences calls into this trait.
#[async_trait]
pub trait ScanningBackend: Send + Sync {
    /// Check hash continuity of cached-but-unvalidated blocks against the
    /// wallet's derived data. Returns `Error::ChainValidation` with the
    /// height of the first mismatch.
    async fn validate_chain_continuity(&self, limit: u64) -> Result<()>;

    /// Trial-decrypt up to `limit` cached blocks past the scanned frontier,
    /// advancing the backend's own scanned height.
    async fn scan_blocks(&self, limit: u64) -> Result<ScanSummary>;

    /// Ids of wallet transactions mined within `range` that still lack
    /// enhancement detail
    async fn found_transaction_ids(&self, range: CompactBlockRange) -> Result<Vec<TxId>>;

    /// Decrypt and store the full detail (memos, values) of a raw transaction
    async fn enhance_transaction(&self, raw: RawTransaction) -> Result<WalletTransaction>;

    /// Store one transparent UTXO; returns `false` when it was skipped as a
    /// duplicate
    async fn store_utxo(&self, utxo: UnspentOutput) -> Result<bool>;

    /// Transparent addresses whose UTXOs should be refreshed
    async fn transparent_addresses(&self) -> Result<Vec<String>>;

    /// Local consensus branch id valid at `height`
    async fn consensus_branch_id(&self, height: BlockHeight) -> Result<String>;

    /// Closest height at or below `height` the derived data can be safely
    /// rewound to
    async fn nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight>;

    /// Drop derived data above `height`
    async fn rewind_to(&self, height: BlockHeight) -> Result<()>;

    /// Make sure proving parameter files are present before spends are
    /// possible
    async fn ensure_proving_parameters(&self) -> Result<()>;
}

/// Compact block cache.
///
/// Writes are idempotent per height so an interrupted download can be
/// replayed safely.
#[async_trait]
pub trait CompactBlockStore: Send + Sync {
    /// Create the underlying storage if missing
    async fn create(&self) -> Result<()>;

    /// Write a batch of blocks, replacing any already present at the same
    /// heights
    async fn write(&self, blocks: Vec<CompactBlock>) -> Result<()>;

    /// Height of the newest cached block, `None` when the cache is empty
    async fn latest_height(&self) -> Result<Option<BlockHeight>>;

    /// Delete every block strictly above `height`
    async fn rewind(&self, height: BlockHeight) -> Result<()>;

    /// Delete every block at or below `height`
    async fn clear_up_to(&self, height: BlockHeight) -> Result<()>;

    /// Delete all cached blocks
    async fn clear_all(&self) -> Result<()>;
}

/// In-memory block cache for tests and embedders that do not persist the
/// cache across launches.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<BTreeMap<BlockHeight, CompactBlock>>,
}

impl MemoryBlockStore {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether the cache holds no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[async_trait]
impl CompactBlockStore for MemoryBlockStore {
    async fn create(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, blocks: Vec<CompactBlock>) -> Result<()> {
        let mut cache = self.blocks.write();
        for block in blocks {
            cache.insert(block.height, block);
        }
        Ok(())
    }

    async fn latest_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.blocks.read().keys().next_back().copied())
    }

    async fn rewind(&self, height: BlockHeight) -> Result<()> {
        self.blocks.write().retain(|&h, _| h <= height);
        Ok(())
    }

    async fn clear_up_to(&self, height: BlockHeight) -> Result<()> {
        self.blocks.write().retain(|&h, _| h > height);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.blocks.write().clear();
        Ok(())
    }
}
