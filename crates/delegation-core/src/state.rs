use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use ethers_core::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::caveats::MethodSelector;
use crate::error::{DelegationError, Result};

/// Asset identifier for the chain's native currency.
pub const NATIVE_ASSET: &str = "native";
/// Number of recent errors kept per agent.
pub const ERROR_LOG_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Revoked,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Revoked => "revoked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Revoked)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical ledger key for an asset: `native` or the lowercase token address.
pub fn asset_key(token: Option<Address>) -> String {
    match token {
        Some(address) => format!("{address:#x}"),
        None => NATIVE_ASSET.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBudget {
    pub spent: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<U256>,
}

/// Per-asset spend tracking. The native entry always exists and its limit is
/// pinned to the delegation's total allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLedger {
    pub allocated: U256,
    pub tokens: BTreeMap<String, AssetBudget>,
}

impl BudgetLedger {
    pub fn new(allocated: U256) -> Self {
        let mut tokens = BTreeMap::new();
        tokens.insert(
            NATIVE_ASSET.to_string(),
            AssetBudget {
                spent: U256::zero(),
                limit: Some(allocated),
            },
        );
        Self { allocated, tokens }
    }

    pub fn spent(&self, asset: &str) -> U256 {
        self.tokens
            .get(&asset.to_ascii_lowercase())
            .map(|entry| entry.spent)
            .unwrap_or_default()
    }

    pub fn limit(&self, asset: &str) -> Option<U256> {
        let asset = asset.to_ascii_lowercase();
        if asset == NATIVE_ASSET {
            return Some(self.allocated);
        }
        self.tokens.get(&asset).and_then(|entry| entry.limit)
    }

    pub fn remaining_native(&self) -> U256 {
        self.allocated.saturating_sub(self.spent(NATIVE_ASSET))
    }

    /// Add `amount` to the asset's cumulative spend. Additive: callers must
    /// not report the same spend twice. Returns the new total.
    pub fn record_spend(&mut self, asset: &str, amount: U256) -> Result<U256> {
        let asset = asset.to_ascii_lowercase();
        let limit = self.limit(&asset);
        let entry = self.tokens.entry(asset.clone()).or_default();
        let total = entry
            .spent
            .checked_add(amount)
            .ok_or_else(|| DelegationError::validation("spend overflows uint256"))?;

        if let Some(limit) = limit {
            if total > limit {
                return Err(DelegationError::BudgetExceeded {
                    asset,
                    spent: entry.spent,
                    amount,
                    limit,
                });
            }
        }

        entry.spent = total;
        Ok(total)
    }

    /// Set or clear a soft limit for a non-native asset. The limit may not
    /// sit below what has already been spent.
    pub fn set_limit(&mut self, asset: &str, limit: Option<U256>) -> Result<()> {
        let asset = asset.to_ascii_lowercase();
        if asset == NATIVE_ASSET {
            return Err(DelegationError::validation(
                "native limit is fixed to the delegation allocation",
            ));
        }
        let entry = self.tokens.entry(asset.clone()).or_default();
        if let Some(limit) = limit {
            if limit < entry.spent {
                return Err(DelegationError::validation(format!(
                    "limit {limit} for {asset} is below spent {}",
                    entry.spent
                )));
            }
        }
        entry.limit = limit;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeCounters {
    pub executed: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentErrorEntry {
    pub at: u64,
    pub message: String,
}

/// Mutable per-agent record created when a sub-delegation is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentState {
    pub id: String,
    pub wallet_id: String,
    pub wallet_address: Address,
    pub agent_class: String,
    pub status: AgentStatus,
    pub budget: BudgetLedger,
    pub trades: TradeCounters,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub errors: VecDeque<AgentErrorEntry>,
}

/// Inputs for [`SubAgentState::new`].
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub id: String,
    pub wallet_id: String,
    pub wallet_address: Address,
    pub agent_class: String,
    pub allocated: U256,
    pub max_trades: u32,
    pub created_at: u64,
    pub expires_at: u64,
}

impl SubAgentState {
    pub fn new(agent: NewAgent) -> Self {
        Self {
            id: agent.id,
            wallet_id: agent.wallet_id,
            wallet_address: agent.wallet_address,
            agent_class: agent.agent_class,
            status: AgentStatus::Running,
            budget: BudgetLedger::new(agent.allocated),
            trades: TradeCounters {
                executed: 0,
                max: agent.max_trades,
            },
            created_at: agent.created_at,
            last_activity_at: agent.created_at,
            expires_at: agent.expires_at,
            errors: VecDeque::new(),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_native(&self) -> U256 {
        self.budget.remaining_native()
    }

    pub fn update_token_spent(&mut self, asset: &str, amount: U256, now: u64) -> Result<U256> {
        let total = self.budget.record_spend(asset, amount)?;
        self.last_activity_at = now;
        Ok(total)
    }

    pub fn set_token_limit(&mut self, asset: &str, limit: Option<U256>) -> Result<()> {
        self.budget.set_limit(asset, limit)
    }

    /// Account for one executed trade: status, expiry, trade count and the
    /// native value it moved are all checked before anything changes.
    pub fn record_trade(&mut self, trade: &TradeRecord) -> Result<u32> {
        self.ensure_active(trade.timestamp)?;
        if self.trades.executed >= self.trades.max {
            return Err(DelegationError::TradeLimitReached {
                executed: self.trades.executed,
                max: self.trades.max,
            });
        }

        let mut ledger = self.budget.clone();
        if !trade.value_wei.is_zero() {
            ledger.record_spend(NATIVE_ASSET, trade.value_wei)?;
        }
        if let (Some(asset), Some(amount)) = (&trade.asset, trade.amount) {
            ledger.record_spend(asset, amount)?;
        }

        self.budget = ledger;
        self.trades.executed += 1;
        self.last_activity_at = trade.timestamp;
        if self.trades.executed == self.trades.max {
            info!(agent_id = %self.id, "agent reached its trade limit");
            self.status = AgentStatus::Completed;
        }
        Ok(self.trades.executed)
    }

    /// Append to the bounded error log, evicting the oldest entry when full.
    pub fn record_error(&mut self, message: impl Into<String>, now: u64) {
        if self.errors.len() == ERROR_LOG_CAPACITY {
            self.errors.pop_front();
        }
        self.errors.push_back(AgentErrorEntry {
            at: now,
            message: message.into(),
        });
        self.last_activity_at = now;
    }

    /// Revoked is final; other terminal states may only move to revoked.
    pub fn set_status(&mut self, status: AgentStatus, now: u64) -> Result<()> {
        if self.status == status {
            return Ok(());
        }
        if self.status == AgentStatus::Revoked
            || (self.status.is_terminal() && status != AgentStatus::Revoked)
        {
            return Err(DelegationError::AgentInactive {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.status = status;
        self.last_activity_at = now;
        Ok(())
    }

    /// Running and not yet expired.
    pub fn ensure_active(&self, now: u64) -> Result<()> {
        if self.status != AgentStatus::Running {
            return Err(DelegationError::AgentInactive {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        if self.is_expired(now) {
            return Err(DelegationError::Expired {
                expires_at: self.expires_at,
            });
        }
        Ok(())
    }

    /// Decode a stored record, upgrading legacy single-asset budgets into the
    /// per-asset map. The flag reports whether an upgrade happened.
    pub fn from_json(mut value: Value) -> Result<(Self, bool)> {
        let needs_upgrade = value
            .get("budget")
            .is_some_and(|budget| budget.get("tokens").is_none());

        if needs_upgrade {
            let legacy: LegacyBudget = serde_json::from_value(value["budget"].take())?;
            value["budget"] = serde_json::to_value(legacy.into_ledger())?;
        }

        let state: SubAgentState = serde_json::from_value(value)?;
        Ok((state, needs_upgrade))
    }
}

/// Budget shape written before per-asset tracking existed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyBudget {
    allocated: U256,
    #[serde(default)]
    spent: U256,
    #[serde(default)]
    token_address: Option<Address>,
    #[serde(default)]
    token_spent: Option<U256>,
}

impl LegacyBudget {
    fn into_ledger(self) -> BudgetLedger {
        let mut ledger = BudgetLedger::new(self.allocated);
        if let Some(native) = ledger.tokens.get_mut(NATIVE_ASSET) {
            native.spent = self.spent;
        }
        if let (Some(token), Some(spent)) = (self.token_address, self.token_spent) {
            ledger.tokens.insert(
                asset_key(Some(token)),
                AssetBudget { spent, limit: None },
            );
        }
        ledger
    }
}

/// One line of an agent's append-only trade log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<H256>,
    pub target: Address,
    pub selector: MethodSelector,
    pub value_wei: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<U256>,
    pub status: TradeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Submitted,
    Confirmed,
    Reverted,
}
