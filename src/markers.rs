//! Persisted sync progress markers
//!
//! Four monotone height markers track how far each pipeline phase has
//! progressed, surviving restarts. They are stored through a small namespaced
//! key-value interface so any embedded store works; a sqlite-backed store is
//! bundled, and an in-memory one is used by tests.

use crate::{BlockHeight, Error, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A progress marker kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Highest block height written to the block cache
    LatestDownloadedBlockHeight,
    /// Highest block height the backend has scanned
    LatestScannedHeight,
    /// Highest block height transaction enhancement has covered
    LatestEnhancedHeight,
    /// Highest block height UTXO fetching has covered
    LatestUtxoFetchedHeight,
}

impl Marker {
    /// All marker kinds
    pub const ALL: [Marker; 4] = [
        Marker::LatestDownloadedBlockHeight,
        Marker::LatestScannedHeight,
        Marker::LatestEnhancedHeight,
        Marker::LatestUtxoFetchedHeight,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::LatestDownloadedBlockHeight => "latestDownloadedBlockHeight",
            Self::LatestScannedHeight => "latestScannedHeight",
            Self::LatestEnhancedHeight => "latestEnhancedHeight",
            Self::LatestUtxoFetchedHeight => "latestUTXOFetchedHeight",
        }
    }

    /// Storage key for this marker under the given wallet alias.
    ///
    /// The default alias keeps the bare key so wallets upgrading from
    /// single-wallet builds find their existing values.
    pub fn key(self, alias: &str) -> String {
        if alias == "default" {
            self.name().to_string()
        } else {
            format!("{}_{}", self.name(), alias)
        }
    }
}

/// Point-in-time copy of all four markers. Zero means "never set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkerSnapshot {
    /// Highest downloaded height
    pub latest_downloaded_block_height: BlockHeight,
    /// Highest scanned height
    pub latest_scanned_height: BlockHeight,
    /// Highest enhanced height
    pub latest_enhanced_height: BlockHeight,
    /// Highest UTXO-fetched height
    pub latest_utxo_fetched_height: BlockHeight,
}

/// Namespaced persistence for marker values.
///
/// Reads of missing keys return zero. Implementations must be safe for
/// concurrent readers with a single writer.
pub trait MarkerStorage: Send + Sync {
    /// Read a value, zero when absent
    fn get(&self, key: &str) -> Result<u64>;
    /// Write a value
    fn put(&self, key: &str, value: u64) -> Result<()>;
    /// Remove a key
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory marker storage for tests
#[derive(Default)]
pub struct MemoryMarkerStorage {
    values: RwLock<HashMap<String, u64>>,
}

impl MemoryMarkerStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarkerStorage for MemoryMarkerStorage {
    fn get(&self, key: &str) -> Result<u64> {
        Ok(self.values.read().get(key).copied().unwrap_or(0))
    }

    fn put(&self, key: &str, value: u64) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// Sqlite-backed marker storage
pub struct SqliteMarkerStorage {
    path: PathBuf,
}

impl SqliteMarkerStorage {
    /// Open (creating if needed) the marker table at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let storage = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = storage.open_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_markers (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(storage)
    }

    fn open_conn(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Configuration(format!("cannot create {parent:?}: {e}")))?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl MarkerStorage for SqliteMarkerStorage {
    fn get(&self, key: &str) -> Result<u64> {
        let conn = self.open_conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM sync_markers WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    fn put(&self, key: &str, value: u64) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "INSERT INTO sync_markers (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value as i64],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute("DELETE FROM sync_markers WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Progress tracker over a marker store, namespaced by wallet alias.
///
/// Cloning shares the underlying store; reads are safe for concurrent
/// observers while the active cycle is the single writer.
#[derive(Clone)]
pub struct SyncMarkers {
    alias: String,
    storage: Arc<dyn MarkerStorage>,
}

impl SyncMarkers {
    /// Create a tracker for `alias` over `storage`
    pub fn new(alias: impl Into<String>, storage: Arc<dyn MarkerStorage>) -> Self {
        Self {
            alias: alias.into(),
            storage,
        }
    }

    /// Read one marker, zero when never set
    pub fn get(&self, marker: Marker) -> Result<BlockHeight> {
        self.storage.get(&marker.key(&self.alias))
    }

    /// Write one marker
    pub fn set(&self, marker: Marker, height: BlockHeight) -> Result<()> {
        self.storage.put(&marker.key(&self.alias), height)
    }

    /// Snapshot all four markers
    pub fn snapshot(&self) -> Result<MarkerSnapshot> {
        Ok(MarkerSnapshot {
            latest_downloaded_block_height: self.get(Marker::LatestDownloadedBlockHeight)?,
            latest_scanned_height: self.get(Marker::LatestScannedHeight)?,
            latest_enhanced_height: self.get(Marker::LatestEnhancedHeight)?,
            latest_utxo_fetched_height: self.get(Marker::LatestUtxoFetchedHeight)?,
        })
    }

    /// Clamp every marker to at most `height`. Markers already below the
    /// requested height are left untouched, which makes this idempotent.
    pub fn rewind(&self, height: BlockHeight) -> Result<()> {
        for marker in Marker::ALL {
            let clamped = self.get(marker)?.min(height);
            self.set(marker, clamped)?;
        }
        Ok(())
    }

    /// Delete every marker of this alias
    pub fn wipe(&self) -> Result<()> {
        for marker in Marker::ALL {
            self.storage.delete(&marker.key(&self.alias))?;
        }
        Ok(())
    }

    /// One-time migration from builds that tracked downloads through the
    /// block cache only: when the download marker was never set, seed it from
    /// the cache's own latest height.
    pub fn migrate_if_needed(&self, cache_latest_height: Option<BlockHeight>) -> Result<()> {
        if self.get(Marker::LatestDownloadedBlockHeight)? == 0 {
            if let Some(height) = cache_latest_height {
                tracing::info!(height, alias = %self.alias, "seeding download marker from block cache");
                self.set(Marker::LatestDownloadedBlockHeight, height)?;
            }
        }
        Ok(())
    }
}
