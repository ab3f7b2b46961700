use std::time::{SystemTime, UNIX_EPOCH};

use ethers_core::types::{Address, U256};
use ethers_core::utils::parse_ether;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::caveats::{CaveatComposer, MethodSelector, StripReport, TradingScope};
use crate::delegation::{Delegation, ROOT_AUTHORITY};
use crate::error::{DelegationError, Result};

pub const SECONDS_PER_DAY: u64 = 86_400;
pub const MAX_EXPIRY_DAYS: u32 = 365;
pub const MAX_CALLS_LIMIT: u32 = 1_000_000;
/// Default ceiling on `value_per_call_cap * max_calls`, in whole native units.
pub const DEFAULT_SAFETY_CEILING: u64 = 1_000;

/// Inputs for the one-time root grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootParams {
    pub delegator: Address,
    pub delegate: Address,
    pub expiry_days: u32,
    pub value_per_call_cap: U256,
    pub max_calls: u32,
}

impl RootParams {
    /// Derive the per-call cap from a total budget spread over `max_calls`.
    pub fn from_budget(
        delegator: Address,
        delegate: Address,
        expiry_days: u32,
        budget: U256,
        max_calls: u32,
    ) -> Result<Self> {
        Ok(Self {
            delegator,
            delegate,
            expiry_days,
            value_per_call_cap: per_call_cap(budget, max_calls)?,
            max_calls,
        })
    }
}

/// Inputs for a scoped sub-delegation to an agent wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubParams {
    pub delegate: Address,
    pub allowed_targets: Vec<Address>,
    pub allowed_selectors: Vec<MethodSelector>,
    pub expiry_days: u32,
    pub value_per_call_cap: U256,
    pub max_calls: u32,
}

impl SubParams {
    pub fn from_budget(
        delegate: Address,
        allowed_targets: Vec<Address>,
        allowed_selectors: Vec<MethodSelector>,
        expiry_days: u32,
        budget: U256,
        max_calls: u32,
    ) -> Result<Self> {
        Ok(Self {
            delegate,
            allowed_targets,
            allowed_selectors,
            expiry_days,
            value_per_call_cap: per_call_cap(budget, max_calls)?,
            max_calls,
        })
    }

    /// Total native value the sub-delegation can move.
    pub fn total_allocation(&self) -> U256 {
        self.value_per_call_cap.saturating_mul(U256::from(self.max_calls))
    }
}

/// Metadata derived while building a root delegation and persisted beside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootMetadata {
    pub allowed_targets: Vec<Address>,
    pub value_per_call_cap: U256,
    pub max_calls: u32,
    pub created_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct UnsignedRoot {
    pub delegation: Delegation,
    pub metadata: RootMetadata,
    pub strip_report: StripReport,
}

#[derive(Debug, Clone)]
pub struct UnsignedSub {
    pub delegation: Delegation,
    pub created_at: u64,
    pub expires_at: u64,
}

/// Assembles unsigned root and sub delegations. Every parameter check runs
/// before a draft is produced, so a rejected request never reaches a signer.
#[derive(Debug, Clone)]
pub struct CapabilityBuilder {
    composer: CaveatComposer,
    scope: TradingScope,
    safety_ceiling: U256,
}

impl CapabilityBuilder {
    pub fn new(composer: CaveatComposer, scope: TradingScope) -> Self {
        Self {
            composer,
            scope,
            safety_ceiling: U256::from(DEFAULT_SAFETY_CEILING) * U256::exp10(18),
        }
    }

    pub fn with_safety_ceiling(mut self, ceiling: U256) -> Self {
        self.safety_ceiling = ceiling;
        self
    }

    pub fn composer(&self) -> &CaveatComposer {
        &self.composer
    }

    pub fn scope(&self) -> &TradingScope {
        &self.scope
    }

    pub fn safety_ceiling(&self) -> U256 {
        self.safety_ceiling
    }

    pub fn build_root(&self, params: &RootParams) -> Result<UnsignedRoot> {
        self.build_root_at(params, now_ts())
    }

    /// Root grant with the all-zero salt and caveats
    /// `[OR-wrapper, expiry, callCount]`.
    pub fn build_root_at(&self, params: &RootParams, now: u64) -> Result<UnsignedRoot> {
        check_expiry(params.expiry_days)?;
        check_calls(params.max_calls)?;
        self.check_budget(params.value_per_call_cap, params.max_calls)?;
        if self.scope.targets.is_empty() || self.scope.selectors.is_empty() {
            return Err(DelegationError::validation(
                "trading scope needs at least one target and one selector",
            ));
        }

        let expires_at = now + u64::from(params.expiry_days) * SECONDS_PER_DAY;
        let enforcers = self.composer.enforcers();

        let mut scope_selectors = self.scope.selectors.clone();
        scope_selectors.push(self.scope.approve_selector);
        let mut draft = self.composer.expand_function_call_scope(
            &self.scope.targets,
            &scope_selectors,
            params.value_per_call_cap,
        );
        draft.push(enforcers.timestamp(now, expires_at));
        draft.push(enforcers.limited_calls(params.max_calls));

        let groups = self
            .composer
            .root_groups(&self.scope, params.value_per_call_cap);
        let composed = self.composer.compose_root_caveats(draft, &groups)?;

        debug!(
            delegator = ?params.delegator,
            delegate = ?params.delegate,
            expires_at,
            caveats = composed.caveats.len(),
            "built root delegation draft"
        );

        Ok(UnsignedRoot {
            delegation: Delegation {
                delegate: params.delegate,
                delegator: params.delegator,
                authority: ROOT_AUTHORITY,
                caveats: composed.caveats,
                salt: U256::zero(),
                signature: None,
            },
            metadata: RootMetadata {
                allowed_targets: self.scope.targets.clone(),
                value_per_call_cap: params.value_per_call_cap,
                max_calls: params.max_calls,
                created_at: now,
                expires_at,
            },
            strip_report: composed.report,
        })
    }

    pub fn build_sub(&self, parent: &Delegation, params: &SubParams) -> Result<UnsignedSub> {
        self.build_sub_at(parent, params, now_ts())
    }

    /// Sub-delegation from the parent's delegate to an agent wallet, with
    /// caveats `[targets, methods, value, expiry, callCount]`.
    pub fn build_sub_at(&self, parent: &Delegation, params: &SubParams, now: u64) -> Result<UnsignedSub> {
        check_expiry(params.expiry_days)?;
        check_calls(params.max_calls)?;
        self.check_budget(params.value_per_call_cap, params.max_calls)?;
        if params.allowed_targets.is_empty() {
            return Err(DelegationError::validation("allowed targets must not be empty"));
        }
        if params.allowed_selectors.is_empty() {
            return Err(DelegationError::validation("allowed selectors must not be empty"));
        }
        if !parent.is_signed() {
            return Err(DelegationError::Unsigned);
        }

        let expires_at = now + u64::from(params.expiry_days) * SECONDS_PER_DAY;
        let caveats = self.composer.sub_caveats(
            &params.allowed_targets,
            &params.allowed_selectors,
            params.value_per_call_cap,
            (now, expires_at),
            params.max_calls,
        );

        debug!(
            delegate = ?params.delegate,
            parent = ?parent.hash(),
            expires_at,
            "built sub delegation draft"
        );

        Ok(UnsignedSub {
            delegation: Delegation {
                delegate: params.delegate,
                delegator: parent.delegate,
                authority: parent.hash(),
                caveats,
                salt: random_salt(),
                signature: None,
            },
            created_at: now,
            expires_at,
        })
    }

    fn check_budget(&self, value_per_call_cap: U256, max_calls: u32) -> Result<()> {
        let requested = value_per_call_cap
            .checked_mul(U256::from(max_calls))
            .ok_or_else(|| DelegationError::validation("budget overflows uint256"))?;
        if requested > self.safety_ceiling {
            return Err(DelegationError::CeilingExceeded {
                requested,
                ceiling: self.safety_ceiling,
            });
        }
        Ok(())
    }
}

/// Spread `budget` evenly over `max_calls` (integer wei division).
pub fn per_call_cap(budget: U256, max_calls: u32) -> Result<U256> {
    check_calls(max_calls)?;
    Ok(budget / U256::from(max_calls))
}

/// Parse a decimal native-unit amount ("0.5") into wei.
pub fn parse_native(amount: &str) -> Result<U256> {
    parse_ether(amount)
        .map_err(|err| DelegationError::validation(format!("invalid amount {amount}: {err}")))
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn check_expiry(expiry_days: u32) -> Result<()> {
    if expiry_days == 0 || expiry_days > MAX_EXPIRY_DAYS {
        return Err(DelegationError::validation(format!(
            "expiry must be between 1 and {MAX_EXPIRY_DAYS} days, got {expiry_days}"
        )));
    }
    Ok(())
}

fn check_calls(max_calls: u32) -> Result<()> {
    if max_calls == 0 || max_calls > MAX_CALLS_LIMIT {
        return Err(DelegationError::validation(format!(
            "max calls must be between 1 and {MAX_CALLS_LIMIT}, got {max_calls}"
        )));
    }
    Ok(())
}

fn random_salt() -> U256 {
    U256::from_big_endian(&rand::random::<[u8; 32]>())
}
