use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::{Bytes, H256};
use ethers_core::utils::keccak256;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ChainError, Result};
use crate::reader::{ChainReader, TransactionSender};
use crate::receipts::{normalize_receipt, NormalizedReceipt, ReceiptCache};
use crate::retry::RetryPolicy;

/// Error code `eth_sendRawTransactionSync` uses when its own wait expires.
const SYNC_WAIT_EXPIRED: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub sync_timeout_ms: u64,
    pub receipt_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub receipt_ttl_secs: u64,
    pub receipt_cache_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 10_000,
            receipt_timeout_ms: 120_000,
            poll_interval_ms: 1_000,
            receipt_ttl_secs: 300,
            receipt_cache_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn build_cache(&self) -> ReceiptCache {
        ReceiptCache::new(
            self.receipt_cache_capacity,
            Duration::from_secs(self.receipt_ttl_secs),
        )
    }
}

/// Submits signed transactions, preferring a single submit-and-wait call and
/// falling back to submit-then-poll. Broadcasts are never retried; receipt
/// reads are.
pub struct TransactionSync {
    sender: Arc<dyn TransactionSender>,
    reader: Arc<dyn ChainReader>,
    cache: Arc<ReceiptCache>,
    retry: RetryPolicy,
    config: SyncConfig,
    sync_supported: AtomicBool,
}

impl TransactionSync {
    pub fn new(
        sender: Arc<dyn TransactionSender>,
        reader: Arc<dyn ChainReader>,
        cache: Arc<ReceiptCache>,
        config: SyncConfig,
    ) -> Self {
        Self {
            sender,
            reader,
            cache,
            retry: RetryPolicy::default(),
            config,
            sync_supported: AtomicBool::new(true),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> &Arc<ReceiptCache> {
        &self.cache
    }

    /// Whether the node is still believed to support the sync method.
    pub fn sync_supported(&self) -> bool {
        self.sync_supported.load(Ordering::Relaxed)
    }

    /// Broadcast `raw` and wait for its receipt. A reverted transaction is
    /// returned as [`ChainError::Reverted`].
    pub async fn submit(&self, raw: Bytes) -> Result<NormalizedReceipt> {
        let expected_hash = H256(keccak256(&raw));

        if self.sync_supported() {
            let sync_timeout = self.config.sync_timeout();
            let attempt = tokio::time::timeout(
                sync_timeout,
                self.sender.send_raw_transaction_sync(raw.clone(), sync_timeout),
            )
            .await;
            match attempt {
                Ok(Ok(value)) => {
                    let receipt = normalize_receipt(&value)?;
                    self.cache.insert(receipt.clone()).await;
                    info!(tx_hash = ?receipt.transaction_hash, status = ?receipt.status, "transaction settled via sync submit");
                    return receipt.ensure_success();
                }
                Ok(Err(err)) if err.is_method_not_supported() => {
                    warn!("node does not support eth_sendRawTransactionSync, falling back to polling");
                    self.sync_supported.store(false, Ordering::Relaxed);
                }
                Ok(Err(ChainError::Rpc { code, .. })) if code == SYNC_WAIT_EXPIRED => {
                    warn!(tx_hash = ?expected_hash, "sync submit expired on node, polling for receipt");
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    warn!(tx_hash = ?expected_hash, ?sync_timeout, "sync submit timed out, polling for receipt");
                }
            }
        }

        // Identical signed bytes cannot be applied twice, so a resend after
        // a sync attempt is safe; the node may answer "already known".
        let tx_hash = match self.sender.send_raw_transaction(raw).await {
            Ok(hash) => hash,
            Err(err) if err.is_already_known() => {
                debug!(tx_hash = ?expected_hash, "node already holds transaction");
                expected_hash
            }
            Err(err) => return Err(err),
        };
        self.wait_for_receipt(tx_hash, self.config.receipt_timeout()).await
    }

    /// Poll for a receipt, answering from the cache when possible.
    pub async fn wait_for_receipt(&self, tx_hash: H256, timeout: Duration) -> Result<NormalizedReceipt> {
        if let Some(receipt) = self.cache.get(&tx_hash).await {
            debug!(?tx_hash, "receipt served from cache");
            return receipt.ensure_success();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let reader = Arc::clone(&self.reader);
            let raw = self
                .retry
                .run("transaction_receipt", move || {
                    let reader = Arc::clone(&reader);
                    async move { reader.transaction_receipt(tx_hash).await }
                })
                .await?;

            if let Some(raw) = raw {
                let receipt = normalize_receipt(&raw)?;
                self.cache.insert(receipt.clone()).await;
                info!(?tx_hash, status = ?receipt.status, block = receipt.block_number, "receipt observed");
                return receipt.ensure_success();
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ChainError::Timeout {
                    operation: "receipt wait",
                    after: timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ethers_core::types::{Address, U256};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Clone, Copy, PartialEq)]
    enum SyncMode {
        Supported,
        Unsupported,
        Hangs,
    }

    struct FakeNode {
        mode: SyncMode,
        revert: bool,
        mined: Mutex<HashMap<H256, Value>>,
        sync_calls: AtomicU32,
        sends: AtomicU32,
        receipt_reads: AtomicU32,
    }

    impl FakeNode {
        fn new(mode: SyncMode, revert: bool) -> Arc<Self> {
            Arc::new(Self {
                mode,
                revert,
                mined: Mutex::new(HashMap::new()),
                sync_calls: AtomicU32::new(0),
                sends: AtomicU32::new(0),
                receipt_reads: AtomicU32::new(0),
            })
        }

        fn mine(&self, raw: &Bytes) -> Value {
            let hash = H256(keccak256(raw));
            let receipt = json!({
                "transactionHash": hash,
                "status": if self.revert { "0x0" } else { "0x1" },
                "blockNumber": "0x10",
                "gasUsed": "0x5208",
                "logs": []
            });
            self.mined.lock().unwrap().insert(hash, receipt.clone());
            receipt
        }
    }

    #[async_trait]
    impl TransactionSender for FakeNode {
        async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let hash = H256(keccak256(&raw));
            if self.mined.lock().unwrap().contains_key(&hash) {
                return Err(ChainError::from_rpc(-32000, "already known"));
            }
            self.mine(&raw);
            Ok(hash)
        }

        async fn send_raw_transaction_sync(&self, raw: Bytes, _timeout: Duration) -> Result<Value> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                SyncMode::Supported => Ok(self.mine(&raw)),
                SyncMode::Unsupported => Err(ChainError::from_rpc(
                    -32601,
                    "the method eth_sendRawTransactionSync does not exist",
                )),
                SyncMode::Hangs => {
                    self.mine(&raw);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err(ChainError::Transient("unreachable".into()))
                }
            }
        }
    }

    #[async_trait]
    impl ChainReader for FakeNode {
        async fn current_nonce(&self, _delegator: Address) -> Result<U256> {
            Ok(U256::zero())
        }

        async fn balance(&self, _account: Address) -> Result<U256> {
            Ok(U256::zero())
        }

        async fn call(&self, _to: Address, _data: Bytes) -> Result<Bytes> {
            Ok(Bytes::default())
        }

        async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Value>> {
            self.receipt_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.mined.lock().unwrap().get(&tx_hash).cloned())
        }
    }

    fn sync_layer(node: Arc<FakeNode>) -> TransactionSync {
        let config = SyncConfig {
            sync_timeout_ms: 50,
            receipt_timeout_ms: 500,
            poll_interval_ms: 5,
            ..SyncConfig::default()
        };
        let cache = Arc::new(config.build_cache());
        TransactionSync::new(node.clone(), node, cache, config)
    }

    fn raw_tx(tag: u8) -> Bytes {
        Bytes::from(vec![0x02, tag, tag, tag])
    }

    #[tokio::test]
    async fn sync_path_caches_receipt_for_later_waits() {
        let node = FakeNode::new(SyncMode::Supported, false);
        let layer = sync_layer(node.clone());

        let receipt = layer.submit(raw_tx(1)).await.unwrap();
        assert_eq!(receipt.block_number, 16);
        assert_eq!(node.sends.load(Ordering::SeqCst), 0);

        let again = layer
            .wait_for_receipt(receipt.transaction_hash, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(again, receipt);
        assert_eq!(node.receipt_reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_method_falls_back_and_is_remembered() {
        let node = FakeNode::new(SyncMode::Unsupported, false);
        let layer = sync_layer(node.clone());

        layer.submit(raw_tx(1)).await.unwrap();
        assert!(!layer.sync_supported());
        layer.submit(raw_tx(2)).await.unwrap();

        assert_eq!(node.sync_calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.sends.load(Ordering::SeqCst), 2);
        assert!(node.receipt_reads.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn sync_timeout_falls_back_to_polling() {
        let node = FakeNode::new(SyncMode::Hangs, false);
        let layer = sync_layer(node.clone());

        let receipt = layer.submit(raw_tx(3)).await.unwrap();
        assert!(receipt.is_success());
        assert!(layer.sync_supported());
        assert_eq!(node.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reverted_transactions_surface_with_hash() {
        let node = FakeNode::new(SyncMode::Supported, true);
        let layer = sync_layer(node);
        let raw = raw_tx(4);
        let expected = H256(keccak256(&raw));
        match layer.submit(raw).await {
            Err(ChainError::Reverted { tx_hash }) => assert_eq!(tx_hash, expected),
            other => panic!("expected revert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_receipt_times_out() {
        let node = FakeNode::new(SyncMode::Supported, false);
        let layer = sync_layer(node);
        let result = layer
            .wait_for_receipt(H256::repeat_byte(9), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(ChainError::Timeout { .. })));
    }
}
