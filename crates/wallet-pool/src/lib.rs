//! Reusable agent execution wallets shared across processes through a
//! lock-guarded pool file.

pub mod error;
pub mod keys;
pub mod lock;
pub mod pool;

pub use error::{PoolError, Result};
pub use keys::KeyVault;
pub use lock::{
    FileLock, LockConfig, LockOwner, LockToken, MemoryLock, PoolLock, ProcessProbe,
    SystemProcessProbe,
};
pub use pool::{
    AssumeOwnersPresent, OwnerDirectory, PoolRecord, PoolWallet, WalletPoolManager, WalletStatus,
    LOCK_FILE, POOL_FILE,
};
