//! End-to-end delegation flow for autonomous trading agents: one passkey
//! prompt authorizes a root grant, after which scoped sub-delegations are
//! issued to pool wallets and reassembled into chains for redemption.

pub mod config;
pub mod delegator;
pub mod error;
pub mod session;

pub use config::DelegatorConfig;
pub use delegator::{
    transaction_sync, AgentDelegator, IssuedAgent, RootRequest, SubAgentRequest,
};
pub use error::{DelegatorError, ErrorCategory, Result};
pub use session::load_or_create_session_key;
