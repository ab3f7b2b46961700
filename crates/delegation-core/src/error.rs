use ethers_core::types::U256;

use crate::caveats::CaveatKind;

/// Convenient result alias for delegation operations.
pub type Result<T> = std::result::Result<T, DelegationError>;

/// Errors raised while building, signing, verifying or persisting delegations.
#[derive(thiserror::Error, Debug)]
pub enum DelegationError {
    /// A caller-supplied parameter is out of range. Nothing was signed or written.
    #[error("invalid parameter: {0}")]
    Validation(String),
    /// `value_per_call_cap * max_calls` is above the deployment safety ceiling.
    #[error("requested budget {requested} wei exceeds safety ceiling of {ceiling} wei")]
    CeilingExceeded {
        /// Total value the delegation would allow.
        requested: U256,
        /// Configured ceiling.
        ceiling: U256,
    },
    /// The framework draft did not contain the restriction caveats the composer replaces.
    #[error("draft delegation is missing expected caveats: {missing:?}")]
    ProtocolDrift {
        /// Caveat kinds that were expected but absent.
        missing: Vec<CaveatKind>,
    },
    /// The user cancelled the biometric prompt.
    #[error("authentication declined")]
    AuthenticationDeclined,
    /// The signer failed for a reason other than user cancellation.
    #[error("signing failed: {0}")]
    Signing(String),
    /// Attempted to use an unsigned delegation where a signed one is required.
    #[error("delegation is unsigned")]
    Unsigned,
    /// Attempted to sign a delegation that already carries a signature.
    #[error("delegation is already signed")]
    AlreadySigned,
    /// A delegation chain failed linkage or signature verification.
    #[error("delegation chain invalid: {0}")]
    InvalidChain(String),
    /// Spending would push an asset above its configured limit.
    #[error("budget exceeded for {asset}: spent {spent} + {amount} > limit {limit}")]
    BudgetExceeded {
        /// Asset identifier.
        asset: String,
        /// Amount already spent.
        spent: U256,
        /// Amount requested.
        amount: U256,
        /// Configured limit.
        limit: U256,
    },
    /// The agent has executed its maximum number of trades.
    #[error("trade limit reached ({executed}/{max})")]
    TradeLimitReached {
        /// Trades executed so far.
        executed: u32,
        /// Maximum allowed.
        max: u32,
    },
    /// The agent is not in a state that allows the requested operation.
    #[error("agent {id} is {status}")]
    AgentInactive {
        /// Agent identifier.
        id: String,
        /// Current status label.
        status: String,
    },
    /// The delegation or agent has passed its expiry timestamp.
    #[error("expired at {expires_at}")]
    Expired {
        /// Expiry timestamp (unix seconds).
        expires_at: u64,
    },
    /// No record exists for the requested agent.
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    /// Terms or arguments could not be ABI-decoded.
    #[error("abi decoding failed: {0}")]
    Abi(#[from] ethers_core::abi::Error),
    /// Failed to perform an I/O operation on the record directory.
    #[error("storage operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be encoded or decoded.
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl DelegationError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        DelegationError::Validation(msg.into())
    }
}
