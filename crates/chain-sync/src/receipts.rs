use std::num::NonZeroUsize;
use std::time::Duration;

use ethers_core::types::{Address, H256, U256};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ChainError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

/// Receipt with numeric fields decoded, independent of whether the node
/// returned hex quantities or plain integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedReceipt {
    pub transaction_hash: H256,
    pub status: ReceiptStatus,
    pub block_number: u64,
    pub gas_used: U256,
    pub effective_gas_price: Option<U256>,
    pub contract_address: Option<Address>,
    pub log_count: usize,
}

impl NormalizedReceipt {
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }

    /// Turn a reverted receipt into [`ChainError::Reverted`].
    pub fn ensure_success(self) -> Result<Self> {
        match self.status {
            ReceiptStatus::Success => Ok(self),
            ReceiptStatus::Reverted => Err(ChainError::Reverted {
                tx_hash: self.transaction_hash,
            }),
        }
    }
}

pub fn normalize_receipt(raw: &Value) -> Result<NormalizedReceipt> {
    let transaction_hash: H256 = serde_json::from_value(field(raw, "transactionHash")?.clone())
        .map_err(|err| ChainError::Decode(format!("transactionHash: {err}")))?;
    let status = match quantity(field(raw, "status")?)? {
        value if value.is_zero() => ReceiptStatus::Reverted,
        _ => ReceiptStatus::Success,
    };
    let block_number = quantity(field(raw, "blockNumber")?)?;
    if block_number > U256::from(u64::MAX) {
        return Err(ChainError::Decode("blockNumber out of range".into()));
    }

    let effective_gas_price = match raw.get("effectiveGasPrice") {
        Some(value) if !value.is_null() => Some(quantity(value)?),
        _ => None,
    };
    let contract_address = match raw.get("contractAddress") {
        Some(value) if !value.is_null() => Some(
            serde_json::from_value(value.clone())
                .map_err(|err| ChainError::Decode(format!("contractAddress: {err}")))?,
        ),
        _ => None,
    };

    Ok(NormalizedReceipt {
        transaction_hash,
        status,
        block_number: block_number.as_u64(),
        gas_used: quantity(field(raw, "gasUsed")?)?,
        effective_gas_price,
        contract_address,
        log_count: raw
            .get("logs")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or_default(),
    })
}

fn field<'a>(raw: &'a Value, name: &str) -> Result<&'a Value> {
    raw.get(name)
        .filter(|value| !value.is_null())
        .ok_or_else(|| ChainError::Decode(format!("receipt is missing {name}")))
}

/// Accepts `"0x1a"`, `"26"`, `26` and booleans.
fn quantity(value: &Value) -> Result<U256> {
    match value {
        Value::String(text) => {
            let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some("") => Some(U256::zero()),
                Some(hex) => U256::from_str_radix(hex, 16).ok(),
                None => U256::from_dec_str(text).ok(),
            };
            parsed.ok_or_else(|| ChainError::Decode(format!("invalid quantity {text:?}")))
        }
        Value::Number(number) => number
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| ChainError::Decode(format!("invalid quantity {number}"))),
        Value::Bool(flag) => Ok(U256::from(u8::from(*flag))),
        other => Err(ChainError::Decode(format!("invalid quantity {other}"))),
    }
}

/// Bounded receipt cache keyed by transaction hash. Entries expire after
/// `ttl`; owned by whoever constructs it.
pub struct ReceiptCache {
    entries: Mutex<LruCache<H256, (Instant, NormalizedReceipt)>>,
    ttl: Duration,
}

impl ReceiptCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub async fn get(&self, tx_hash: &H256) -> Option<NormalizedReceipt> {
        let mut entries = self.entries.lock().await;
        let fresh = entries
            .peek(tx_hash)
            .map(|(stored_at, _)| stored_at.elapsed() < self.ttl);
        match fresh {
            Some(true) => entries.get(tx_hash).map(|(_, receipt)| receipt.clone()),
            Some(false) => {
                entries.pop(tx_hash);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, receipt: NormalizedReceipt) {
        self.entries
            .lock()
            .await
            .put(receipt.transaction_hash, (Instant::now(), receipt));
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
