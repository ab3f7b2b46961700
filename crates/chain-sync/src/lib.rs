//! Chain-facing plumbing: state reads behind a seam, replay-protection nonce
//! snapshots, and transaction submission with a cached receipt path.

pub mod error;
pub mod nonce;
pub mod reader;
pub mod receipts;
pub mod retry;
pub mod submit;

pub use error::{ChainError, Result};
pub use nonce::{Consumption, NonceOracle, SigningBatch};
pub use reader::{ChainReader, EthersChainClient, TransactionSender};
pub use receipts::{normalize_receipt, NormalizedReceipt, ReceiptCache, ReceiptStatus};
pub use retry::RetryPolicy;
pub use submit::{SyncConfig, TransactionSync};
