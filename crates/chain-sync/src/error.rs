use std::time::Duration;

use ethers_core::types::H256;
use ethers_providers::{ProviderError, RpcError};

/// Convenient result alias for chain operations.
pub type Result<T> = std::result::Result<T, ChainError>;

const METHOD_NOT_FOUND: i64 = -32601;
const LIMIT_EXCEEDED: i64 = -32005;

/// Errors raised while talking to the chain.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    /// Network-level failure on a call that is safe to repeat.
    #[error("transient chain error: {0}")]
    Transient(String),
    /// The node does not implement the requested method.
    #[error("method not supported by node: {0}")]
    MethodNotSupported(String),
    /// The node returned a JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the node.
        message: String,
    },
    /// The sending account cannot cover value plus gas.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    /// A transaction was mined but reverted.
    #[error("transaction {tx_hash:?} reverted")]
    Reverted {
        /// Hash of the reverted transaction.
        tx_hash: H256,
    },
    /// An operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// Time spent waiting.
        after: Duration,
    },
    /// A response could not be interpreted.
    #[error("unexpected chain response: {0}")]
    Decode(String),
    /// The RPC endpoint could not be parsed.
    #[error("invalid rpc endpoint: {0}")]
    InvalidEndpoint(String),
}

impl ChainError {
    /// Classify a JSON-RPC error response.
    pub fn from_rpc(code: i64, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if code == METHOD_NOT_FOUND
            || lower.contains("not supported")
            || lower.contains("method not found")
            || lower.contains("does not exist")
        {
            ChainError::MethodNotSupported(message.to_string())
        } else if lower.contains("insufficient funds") {
            ChainError::InsufficientBalance(message.to_string())
        } else if code == LIMIT_EXCEEDED {
            ChainError::Transient(message.to_string())
        } else {
            ChainError::Rpc {
                code,
                message: message.to_string(),
            }
        }
    }

    /// Whether a read may be repeated after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }

    pub fn is_method_not_supported(&self) -> bool {
        matches!(self, ChainError::MethodNotSupported(_))
    }

    /// The node already holds this exact signed transaction.
    pub fn is_already_known(&self) -> bool {
        match self {
            ChainError::Rpc { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("already known") || lower.contains("already imported")
            }
            _ => false,
        }
    }
}

impl From<ProviderError> for ChainError {
    fn from(err: ProviderError) -> Self {
        if let Some(rpc) = err.as_error_response() {
            return ChainError::from_rpc(rpc.code, &rpc.message);
        }
        match err {
            ProviderError::SerdeJson(err) => ChainError::Decode(err.to_string()),
            other => ChainError::Transient(other.to_string()),
        }
    }
}
