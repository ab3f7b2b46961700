use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chain_sync::{RetryPolicy, SyncConfig};
use delegation_core::{
    parse_native, DriftPolicy, EnforcerAddresses, TradingScope, DEFAULT_SAFETY_CEILING,
};
use ethers_core::types::{Address, U256};
use passkey_adapter::WebAuthnProfile;
use serde::{Deserialize, Serialize};
use tracing::warn;
use wallet_pool::LockConfig;

use crate::error::{DelegatorError, Result};

const DEFAULT_RPC_URL: &str = "https://testnet-rpc.monad.xyz";
const DEFAULT_CHAIN_ID: u64 = 10_143;
const DEFAULT_DELEGATION_MANAGER: [u8; 20] = [
    0xdb, 0x9b, 0x1e, 0x94, 0xb5, 0xb6, 0x9d, 0xf7, 0xe4, 0x01, 0xdd, 0xbe, 0xde, 0x43, 0x49, 0x11,
    0x41, 0x04, 0x7d, 0xb3,
];
const DEFAULT_NONCE_ENFORCER: [u8; 20] = [
    0xde, 0x4f, 0x2f, 0xac, 0x4b, 0x3d, 0x87, 0xa1, 0xd9, 0x95, 0x3c, 0xa5, 0xfc, 0x09, 0xfc, 0xa7,
    0xf3, 0x66, 0x25, 0x4f,
];

/// Everything the delegator needs to talk to one deployment. Every field has
/// a default so a partial JSON file is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelegatorConfig {
    pub data_dir: PathBuf,
    pub rpc_url: String,
    pub chain_id: u64,
    pub delegation_manager: Address,
    pub nonce_enforcer: Address,
    pub enforcers: EnforcerAddresses,
    pub trading: TradingScope,
    /// Upper bound on `value_per_call_cap * max_calls`, in wei.
    pub safety_ceiling: U256,
    pub drift_policy: DriftPolicy,
    pub webauthn: WebAuthnProfile,
    pub retry: RetryPolicy,
    pub sync: SyncConfig,
    pub lock: LockConfig,
}

impl Default for DelegatorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            chain_id: DEFAULT_CHAIN_ID,
            delegation_manager: Address::from(DEFAULT_DELEGATION_MANAGER),
            nonce_enforcer: Address::from(DEFAULT_NONCE_ENFORCER),
            enforcers: EnforcerAddresses::default(),
            trading: TradingScope::default(),
            safety_ceiling: U256::from(DEFAULT_SAFETY_CEILING) * U256::exp10(18),
            drift_policy: DriftPolicy::default(),
            webauthn: WebAuthnProfile::default(),
            retry: RetryPolicy::default(),
            sync: SyncConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl DelegatorConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|err| {
            DelegatorError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|err| DelegatorError::Config(format!("invalid {}: {err}", path.display())))
    }

    /// Defaults overlaid with `DELEGATOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(dir) = non_empty_var("DELEGATOR_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(url) = non_empty_var("DELEGATOR_RPC_URL").or_else(|| non_empty_var("ETH_RPC_URL")) {
            self.rpc_url = url;
        }

        if let Some(chain_id) = non_empty_var("DELEGATOR_CHAIN_ID") {
            self.chain_id = chain_id.trim().parse().map_err(|err| {
                DelegatorError::Config(format!("DELEGATOR_CHAIN_ID {chain_id:?}: {err}"))
            })?;
        }

        if let Some(ceiling) = non_empty_var("DELEGATOR_SAFETY_CEILING") {
            self.safety_ceiling = parse_native(ceiling.trim())?;
        }

        Ok(self)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.data_dir.join("wallet-pool")
    }

    pub fn session_key_path(&self) -> PathBuf {
        self.data_dir.join("session.key")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        Ok(_) => None,
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!(name, "ignoring environment variable: {err}");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-delegator")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delegator.json");
        fs::write(
            &path,
            r#"{"chainId": 1, "trading": {"targets": ["0x1111111111111111111111111111111111111111"], "selectors": ["0xa9059cbb"]}}"#,
        )
        .unwrap();

        let config = DelegatorConfig::load(&path).unwrap();
        assert_eq!(config.chain_id, 1);
        assert_eq!(config.trading.targets.len(), 1);
        assert_eq!(config.trading.approve_selector, delegation_core::MethodSelector::approve());
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.safety_ceiling, U256::exp10(21));
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DelegatorConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, DelegatorError::Config(_)));
    }

    #[test]
    fn default_deployment_addresses() {
        let config = DelegatorConfig::default();
        assert_eq!(
            format!("{:?}", config.delegation_manager),
            "0xdb9b1e94b5b69df7e401ddbede43491141047db3"
        );
        assert!(config.data_dir.ends_with(".agent-delegator"));
    }
}
