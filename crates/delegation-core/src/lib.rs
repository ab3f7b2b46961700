//! Delegation primitives for agent trading: caveat composition, typed-data
//! hashing, capability building, signing seams, agent state and the on-disk
//! record store.

pub mod builder;
pub mod caveats;
pub mod delegation;
pub mod error;
pub mod signer;
pub mod state;
pub mod store;

pub use builder::{
    now_ts, parse_native, per_call_cap, CapabilityBuilder, RootMetadata, RootParams, SubParams,
    UnsignedRoot, UnsignedSub, DEFAULT_SAFETY_CEILING,
};
pub use caveats::{
    decode_or_groups, encode_or_groups, Caveat, CaveatComposer, CaveatGroup, CaveatKind,
    ComposedCaveats, DriftPolicy, EnforcerAddresses, MethodSelector, StripReport, TradingScope,
    GROUP_APPROVE_ANY, GROUP_SCOPED_TRADING,
};
pub use delegation::{
    recover_session_signer, verify_chain, Delegation, DelegationDomain, ROOT_AUTHORITY,
};
pub use error::{DelegationError, Result};
pub use signer::{sign_delegation, DelegationSigner, SessionKey};
pub use state::{
    asset_key, AgentStatus, BudgetLedger, NewAgent, SubAgentState, TradeRecord, TradeStatus,
    NATIVE_ASSET,
};
pub use store::{DelegationChainRecord, DelegationStore, StoredRootDelegation};
