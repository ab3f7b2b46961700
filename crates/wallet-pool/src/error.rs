use std::path::PathBuf;
use std::time::Duration;

/// Convenient result alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors raised by the wallet pool and its lock.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The pool lock stayed held by a live process for the whole wait budget.
    #[error("timed out after {waited:?} waiting for pool lock {path}")]
    LockTimeout {
        /// Lock file (or lock name for non-file locks).
        path: PathBuf,
        /// Time spent waiting.
        waited: Duration,
    },
    /// No wallet with the given id is in the pool.
    #[error("wallet not found: {0}")]
    WalletNotFound(String),
    /// The wallet is assigned and cannot be removed.
    #[error("wallet {id} is assigned to {owner}")]
    WalletBusy {
        /// Wallet identifier.
        id: String,
        /// Current owner.
        owner: String,
    },
    /// A stored wallet key could not be read or generated.
    #[error("wallet key error: {0}")]
    Key(String),
    /// Failed to perform an I/O operation on the pool directory.
    #[error("pool storage failed: {0}")]
    Io(#[from] std::io::Error),
    /// The pool record could not be encoded or decoded.
    #[error("pool record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
