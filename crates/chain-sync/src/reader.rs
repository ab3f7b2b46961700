use std::time::Duration;

use async_trait::async_trait;
use ethers_core::abi::{self, Token};
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, TransactionRequest, H256, U256};
use ethers_core::utils::keccak256;
use ethers_providers::{Http, Middleware, Provider};
use serde_json::Value;
use tracing::debug;

use crate::error::{ChainError, Result};

pub const CURRENT_NONCE_SIGNATURE: &str = "currentNonce(address,address)";

/// Read-only view of chain state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Replay-protection counter the verifier holds for `delegator`.
    async fn current_nonce(&self, delegator: Address) -> Result<U256>;

    async fn balance(&self, account: Address) -> Result<U256>;

    /// `eth_call` against `to`.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Raw receipt JSON, or `None` while the transaction is pending.
    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Value>>;
}

/// Broadcast side of the node connection. Calls here are never retried.
#[async_trait]
pub trait TransactionSender: Send + Sync {
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;

    /// `eth_sendRawTransactionSync`: broadcast and block until the receipt is
    /// available or `timeout` elapses on the node side.
    async fn send_raw_transaction_sync(&self, raw: Bytes, timeout: Duration) -> Result<Value>;
}

/// JSON-RPC client over HTTP.
#[derive(Debug, Clone)]
pub struct EthersChainClient {
    provider: Provider<Http>,
    delegation_manager: Address,
    nonce_enforcer: Address,
}

impl EthersChainClient {
    pub fn connect(rpc_url: &str, delegation_manager: Address, nonce_enforcer: Address) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|err| ChainError::InvalidEndpoint(format!("{rpc_url}: {err}")))?;
        Ok(Self {
            provider,
            delegation_manager,
            nonce_enforcer,
        })
    }

    pub async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }
}

/// Calldata for `currentNonce(delegationManager, delegator)`.
pub fn current_nonce_calldata(delegation_manager: Address, delegator: Address) -> Bytes {
    let mut data = keccak256(CURRENT_NONCE_SIGNATURE.as_bytes())[..4].to_vec();
    data.extend(abi::encode(&[
        Token::Address(delegation_manager),
        Token::Address(delegator),
    ]));
    Bytes::from(data)
}

pub fn decode_uint_word(output: &[u8]) -> Result<U256> {
    if output.len() < 32 {
        return Err(ChainError::Decode(format!(
            "expected a 32-byte word, got {} bytes",
            output.len()
        )));
    }
    Ok(U256::from_big_endian(&output[..32]))
}

#[async_trait]
impl ChainReader for EthersChainClient {
    async fn current_nonce(&self, delegator: Address) -> Result<U256> {
        let data = current_nonce_calldata(self.delegation_manager, delegator);
        let output = self.call(self.nonce_enforcer, data).await?;
        let nonce = decode_uint_word(&output)?;
        debug!(?delegator, %nonce, "read delegator nonce");
        Ok(nonce)
    }

    async fn balance(&self, account: Address) -> Result<U256> {
        Ok(self.provider.get_balance(account, None).await?)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        Ok(self.provider.call(&tx, None).await?)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Value>> {
        Ok(self
            .provider
            .request::<_, Option<Value>>("eth_getTransactionReceipt", [tx_hash])
            .await?)
    }
}

#[async_trait]
impl TransactionSender for EthersChainClient {
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        Ok(self
            .provider
            .request::<_, H256>("eth_sendRawTransaction", [raw])
            .await?)
    }

    async fn send_raw_transaction_sync(&self, raw: Bytes, timeout: Duration) -> Result<Value> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        Ok(self
            .provider
            .request::<_, Value>("eth_sendRawTransactionSync", (raw, timeout_ms))
            .await?)
    }
}
