//! Streaming block download.
//!
//! Downloading runs ahead of scanning: a fetcher task streams compact block
//! batches from the light wallet server into a bounded channel while the
//! sync loop drains it, writes batches to the block store, and advances the
//! download marker. The channel bound caps how far downloading can outrun
//! scanning, which keeps memory flat on long catch-up syncs.

use crate::cancel::CancelToken;
use crate::interface::{CompactBlock, LightWalletService};
use crate::ranges::{batch_count, batch_range};
use crate::{CompactBlockRange, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A prefetching block downloader for one contiguous range.
///
/// Dropping the downloader closes the channel, which stops the fetcher task
/// at its next send.
pub struct BlockDownloader {
    rx: mpsc::Receiver<Result<Vec<CompactBlock>>>,
    fetcher: JoinHandle<()>,
}

impl BlockDownloader {
    /// Spawn a fetcher task streaming `range` in `batch_size` chunks, keeping
    /// at most `buffer_size` undelivered batches in flight.
    pub fn spawn(
        service: Arc<dyn LightWalletService>,
        range: CompactBlockRange,
        batch_size: u64,
        buffer_size: usize,
        cancel: CancelToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Result<Vec<CompactBlock>>>(buffer_size.max(1));

        let fetcher = tokio::spawn(async move {
            for index in 0..batch_count(&range, batch_size) {
                if cancel.is_cancelled() {
                    break;
                }

                let batch = batch_range(&range, index, batch_size);
                let result = service.block_range(batch.clone()).await;
                let failed = result.is_err();
                if let Err(error) = &result {
                    tracing::warn!(start = *batch.start(), %error, "block fetch failed");
                }
                if tx.send(result).await.is_err() {
                    // Receiver dropped
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        Self { rx, fetcher }
    }

    /// Next downloaded batch, or `None` once the range is exhausted.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<CompactBlock>>> {
        self.rx.recv().await
    }

    /// Stop the fetcher task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.rx.close();
        let _ = self.fetcher.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{RawTransaction, ServerInfo, TxId, UnspentOutput};
    use crate::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeService {
        fail_at: Option<u64>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl LightWalletService for FakeService {
        async fn get_info(&self) -> Result<ServerInfo> {
            unimplemented!()
        }

        async fn latest_block_height(&self) -> Result<u64> {
            unimplemented!()
        }

        async fn block_range(&self, range: CompactBlockRange) -> Result<Vec<CompactBlock>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fail_at) = self.fail_at {
                if range.contains(&fail_at) {
                    return Err(Error::Connection("stream reset".into()));
                }
            }
            Ok(range
                .map(|height| CompactBlock {
                    height,
                    hash: vec![0; 32],
                    data: Vec::new(),
                })
                .collect())
        }

        async fn fetch_transaction(&self, _txid: TxId) -> Result<RawTransaction> {
            unimplemented!()
        }

        async fn fetch_utxos(&self, _addresses: Vec<String>, _start: u64) -> Result<Vec<UnspentOutput>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_streams_whole_range_in_batches() {
        let service = Arc::new(FakeService {
            fail_at: None,
            calls: AtomicU64::new(0),
        });
        let mut downloader =
            BlockDownloader::spawn(service.clone(), 100..=349, 100, 4, CancelToken::new());

        let mut heights = Vec::new();
        while let Some(batch) = downloader.next_batch().await {
            heights.extend(batch.unwrap().into_iter().map(|b| b.height));
        }
        assert_eq!(heights, (100..=349).collect::<Vec<_>>());
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_error_is_delivered_then_stream_ends() {
        let service = Arc::new(FakeService {
            fail_at: Some(210),
            calls: AtomicU64::new(0),
        });
        let mut downloader =
            BlockDownloader::spawn(service, 100..=399, 100, 4, CancelToken::new());

        assert!(downloader.next_batch().await.unwrap().is_ok());
        assert!(matches!(
            downloader.next_batch().await.unwrap(),
            Err(Error::Connection(_))
        ));
        assert!(downloader.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_fetcher() {
        let service = Arc::new(FakeService {
            fail_at: None,
            calls: AtomicU64::new(0),
        });
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut downloader = BlockDownloader::spawn(service, 100..=999, 100, 4, cancel);
        assert!(downloader.next_batch().await.is_none());
    }
}
