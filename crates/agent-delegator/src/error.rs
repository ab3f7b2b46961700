use std::fmt;

use chain_sync::ChainError;
use delegation_core::DelegationError;
use passkey_adapter::SignatureError;
use wallet_pool::PoolError;

/// Convenient result alias for delegator operations.
pub type Result<T> = std::result::Result<T, DelegatorError>;

/// Errors surfaced by the end-to-end delegation flow.
#[derive(thiserror::Error, Debug)]
pub enum DelegatorError {
    /// Building, signing or persisting a delegation failed.
    #[error(transparent)]
    Delegation(#[from] DelegationError),
    /// The passkey adapter could not produce or verify an assertion.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    /// A chain read or submission failed.
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// The wallet pool rejected the operation.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// No root delegation has been authorized yet.
    #[error("no root delegation has been authorized")]
    NoRootDelegation,
    /// The sub-agent request does not fit inside the root grant.
    #[error("request exceeds root delegation: {0}")]
    OutsideRootScope(String),
    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// Local filesystem failure outside the record store.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Coarse classes callers use to decide whether to retry, re-authorize or
/// give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Staleness,
    Concurrency,
    Chain,
    Transient,
    Storage,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Staleness => "staleness",
            ErrorCategory::Concurrency => "concurrency",
            ErrorCategory::Chain => "chain",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Storage => "storage",
        }
    }

    /// Whether repeating the same call later can succeed without new input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Concurrency | ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DelegatorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DelegatorError::Delegation(err) => delegation_category(err),
            DelegatorError::Signature(SignatureError::Cancelled) => ErrorCategory::Authentication,
            DelegatorError::Signature(SignatureError::Verification(_)) => ErrorCategory::Staleness,
            DelegatorError::Signature(_) => ErrorCategory::Validation,
            DelegatorError::Chain(err) => chain_category(err),
            DelegatorError::Pool(PoolError::LockTimeout { .. }) => ErrorCategory::Concurrency,
            DelegatorError::Pool(PoolError::WalletBusy { .. }) => ErrorCategory::Concurrency,
            DelegatorError::Pool(PoolError::WalletNotFound(_)) => ErrorCategory::Validation,
            DelegatorError::Pool(_) => ErrorCategory::Storage,
            DelegatorError::NoRootDelegation => ErrorCategory::Staleness,
            DelegatorError::OutsideRootScope(_) | DelegatorError::Config(_) => {
                ErrorCategory::Validation
            }
            DelegatorError::Io(_) => ErrorCategory::Storage,
        }
    }
}

fn delegation_category(err: &DelegationError) -> ErrorCategory {
    match err {
        DelegationError::AuthenticationDeclined => ErrorCategory::Authentication,
        DelegationError::Expired { .. } | DelegationError::InvalidChain(_) => {
            ErrorCategory::Staleness
        }
        DelegationError::Io(_) | DelegationError::Encoding(_) => ErrorCategory::Storage,
        _ => ErrorCategory::Validation,
    }
}

fn chain_category(err: &ChainError) -> ErrorCategory {
    match err {
        ChainError::Transient(_) | ChainError::Timeout { .. } => ErrorCategory::Transient,
        _ => ErrorCategory::Chain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use ethers_core::types::U256;

    #[test]
    fn categories_follow_the_taxonomy() {
        let declined: DelegatorError = DelegationError::AuthenticationDeclined.into();
        assert_eq!(declined.category(), ErrorCategory::Authentication);

        let ceiling: DelegatorError = DelegationError::CeilingExceeded {
            requested: U256::from(2),
            ceiling: U256::one(),
        }
        .into();
        assert_eq!(ceiling.category(), ErrorCategory::Validation);

        let lock: DelegatorError = PoolError::LockTimeout {
            path: PathBuf::from("wallet-pool.lock"),
            waited: Duration::from_secs(5),
        }
        .into();
        assert_eq!(lock.category(), ErrorCategory::Concurrency);
        assert!(lock.category().is_retryable());

        let reverted: DelegatorError = ChainError::Reverted {
            tx_hash: Default::default(),
        }
        .into();
        assert_eq!(reverted.category(), ErrorCategory::Chain);
        assert!(!reverted.category().is_retryable());

        let stale: DelegatorError = DelegationError::Expired { expires_at: 1 }.into();
        assert_eq!(stale.category().to_string(), "staleness");
        assert_eq!(DelegatorError::NoRootDelegation.category(), ErrorCategory::Staleness);
    }
}
