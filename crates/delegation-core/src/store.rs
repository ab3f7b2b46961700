use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use ethers_core::types::{Bytes, H256, U256};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::builder::RootMetadata;
use crate::delegation::Delegation;
use crate::error::{DelegationError, Result};
use crate::state::{SubAgentState, TradeRecord};

const ROOT_FILE: &str = "root-delegation.json";
const AGENTS_DIR: &str = "agents";
const STATE_FILE: &str = "state.json";
const CHAIN_FILE: &str = "delegation.json";
const TRADES_FILE: &str = "trades.jsonl";

/// Signed root delegation plus what was derived while building it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRootDelegation {
    pub delegation: Delegation,
    #[serde(flatten)]
    pub metadata: RootMetadata,
    /// Delegator nonce snapshot of the signing batch.
    pub nonce: U256,
    pub chain_id: u64,
    /// SEC1-encoded P-256 key that produced the root assertion.
    pub passkey_public_key: Bytes,
}

impl StoredRootDelegation {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.metadata.expires_at
    }
}

/// Everything needed to reassemble an agent's chain at redemption time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationChainRecord {
    pub agent_id: String,
    pub delegation: Delegation,
    pub parent_hash: H256,
    pub parent: Delegation,
    pub nonce: U256,
    pub created_at: u64,
}

/// File-backed store for root, chain and per-agent records. One JSON document
/// per record, written atomically; trades go to an append-only JSONL log.
#[derive(Debug, Clone)]
pub struct DelegationStore {
    base: PathBuf,
}

impl DelegationStore {
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(base.join(AGENTS_DIR))?;
        Ok(Self { base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn save_root(&self, root: &StoredRootDelegation) -> Result<()> {
        if !root.delegation.is_signed() {
            return Err(DelegationError::Unsigned);
        }
        write_json_atomic(&self.base.join(ROOT_FILE), root)?;
        info!(hash = ?root.delegation.hash(), "stored root delegation");
        Ok(())
    }

    pub fn load_root(&self) -> Result<Option<StoredRootDelegation>> {
        read_json(&self.base.join(ROOT_FILE))
    }

    /// Returns whether a root record existed.
    pub fn delete_root(&self) -> Result<bool> {
        remove_if_exists(&self.base.join(ROOT_FILE))
    }

    pub fn save_chain(&self, record: &DelegationChainRecord) -> Result<()> {
        if !record.delegation.is_signed() || !record.parent.is_signed() {
            return Err(DelegationError::Unsigned);
        }
        if record.parent_hash != record.parent.hash() {
            return Err(DelegationError::InvalidChain(
                "parent hash does not match stored parent".into(),
            ));
        }
        let dir = self.agent_dir(&record.agent_id)?;
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(CHAIN_FILE), record)
    }

    pub fn load_chain(&self, agent_id: &str) -> Result<Option<DelegationChainRecord>> {
        read_json(&self.agent_dir(agent_id)?.join(CHAIN_FILE))
    }

    pub fn save_state(&self, state: &SubAgentState) -> Result<()> {
        let dir = self.agent_dir(&state.id)?;
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(STATE_FILE), state)
    }

    /// Load an agent record, upgrading and rewriting legacy budget shapes.
    pub fn load_state(&self, agent_id: &str) -> Result<Option<SubAgentState>> {
        let path = self.agent_dir(agent_id)?.join(STATE_FILE);
        let Some(value) = read_json::<Value>(&path)? else {
            return Ok(None);
        };
        let (state, upgraded) = SubAgentState::from_json(value)?;
        if upgraded {
            info!(agent_id, "upgraded legacy budget record");
            self.save_state(&state)?;
        }
        Ok(Some(state))
    }

    /// Load, mutate and save an agent record. Nothing is written when `f`
    /// fails.
    pub fn update_state<T>(
        &self,
        agent_id: &str,
        f: impl FnOnce(&mut SubAgentState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self
            .load_state(agent_id)?
            .ok_or_else(|| DelegationError::AgentNotFound(agent_id.to_string()))?;
        let out = f(&mut state)?;
        self.save_state(&state)?;
        Ok(out)
    }

    pub fn update_token_spent(&self, agent_id: &str, asset: &str, amount: U256, now: u64) -> Result<U256> {
        self.update_state(agent_id, |state| state.update_token_spent(asset, amount, now))
    }

    /// True once an agent id has been reserved, even before its state is
    /// written.
    pub fn agent_exists(&self, agent_id: &str) -> bool {
        self.agent_dir(agent_id)
            .map(|dir| dir.is_dir())
            .unwrap_or(false)
    }

    /// Claim `agent_id` by creating its record directory. Fails if the id is
    /// already taken.
    pub fn reserve_agent(&self, agent_id: &str) -> Result<()> {
        let dir = self.agent_dir(agent_id)?;
        match fs::create_dir(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(
                DelegationError::validation(format!("agent id {agent_id} is already in use")),
            ),
            Err(err) => Err(err.into()),
        }
    }

    pub fn list_agents(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.base.join(AGENTS_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn append_trade(&self, agent_id: &str, trade: &TradeRecord) -> Result<()> {
        let dir = self.agent_dir(agent_id)?;
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRADES_FILE))?;
        let line = serde_json::to_string(trade)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read the trade log, skipping lines that fail to parse (a torn final
    /// write after a crash).
    pub fn read_trades(&self, agent_id: &str) -> Result<Vec<TradeRecord>> {
        let path = self.agent_dir(agent_id)?.join(TRADES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut trades = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(trade) => trades.push(trade),
                Err(err) => warn!(agent_id, "skipping unreadable trade log line: {err}"),
            }
        }
        Ok(trades)
    }

    /// Explicit teardown of every record belonging to an agent.
    pub fn remove_agent(&self, agent_id: &str) -> Result<bool> {
        let dir = self.agent_dir(agent_id)?;
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        debug!(agent_id, "removed agent records");
        Ok(true)
    }

    fn agent_dir(&self, agent_id: &str) -> Result<PathBuf> {
        let valid = !agent_id.is_empty()
            && agent_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(DelegationError::validation(format!("invalid agent id {agent_id:?}")));
        }
        Ok(self.base.join(AGENTS_DIR).join(agent_id))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DelegationError::validation("record path must have a parent directory"))?;
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| DelegationError::Io(err.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caveats::{EnforcerAddresses, MethodSelector};
    use crate::delegation::ROOT_AUTHORITY;
    use crate::state::{NewAgent, TradeStatus, NATIVE_ASSET};
    use ethers_core::types::Address;

    fn signed(authority: H256, salt: u64) -> Delegation {
        Delegation {
            delegate: Address::repeat_byte(2),
            delegator: Address::repeat_byte(1),
            authority,
            caveats: vec![EnforcerAddresses::default().limited_calls(3)],
            salt: U256::from(salt),
            signature: Some(Bytes::from(vec![5u8; 65])),
        }
    }

    fn state(id: &str) -> SubAgentState {
        SubAgentState::new(NewAgent {
            id: id.into(),
            wallet_id: "w-1".into(),
            wallet_address: Address::repeat_byte(0xaa),
            agent_class: "sniper".into(),
            allocated: U256::from(1_000),
            max_trades: 10,
            created_at: 1,
            expires_at: 10_000,
        })
    }

    #[test]
    fn root_record_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(dir.path()).unwrap();
        assert!(store.load_root().unwrap().is_none());

        let root = StoredRootDelegation {
            delegation: signed(ROOT_AUTHORITY, 0),
            metadata: RootMetadata {
                allowed_targets: vec![Address::repeat_byte(9)],
                value_per_call_cap: U256::from(5),
                max_calls: 100,
                created_at: 10,
                expires_at: 20,
            },
            nonce: U256::from(3),
            chain_id: 10143,
            passkey_public_key: Bytes::from(vec![4u8; 65]),
        };
        store.save_root(&root).unwrap();
        assert_eq!(store.load_root().unwrap(), Some(root.clone()));
        assert!(root.is_expired(20));

        assert!(store.delete_root().unwrap());
        assert!(!store.delete_root().unwrap());
    }

    #[test]
    fn unsigned_roots_are_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(dir.path()).unwrap();
        let mut delegation = signed(ROOT_AUTHORITY, 0);
        delegation.signature = None;
        let root = StoredRootDelegation {
            delegation,
            metadata: RootMetadata {
                allowed_targets: vec![],
                value_per_call_cap: U256::zero(),
                max_calls: 1,
                created_at: 0,
                expires_at: 1,
            },
            nonce: U256::zero(),
            chain_id: 1,
            passkey_public_key: Bytes::default(),
        };
        assert!(matches!(store.save_root(&root), Err(DelegationError::Unsigned)));
        assert!(store.load_root().unwrap().is_none());
    }

    #[test]
    fn chain_record_requires_matching_parent_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(dir.path()).unwrap();
        let parent = signed(ROOT_AUTHORITY, 0);
        let mut record = DelegationChainRecord {
            agent_id: "agent-7".into(),
            delegation: signed(parent.hash(), 42),
            parent_hash: parent.hash(),
            parent: parent.clone(),
            nonce: U256::zero(),
            created_at: 1,
        };
        store.save_chain(&record).unwrap();
        assert_eq!(store.load_chain("agent-7").unwrap(), Some(record.clone()));

        record.parent_hash = H256::zero();
        assert!(store.save_chain(&record).is_err());
    }

    #[test]
    fn state_updates_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(dir.path()).unwrap();
        store.save_state(&state("b-agent")).unwrap();
        store.save_state(&state("a-agent")).unwrap();
        assert_eq!(store.list_agents().unwrap(), vec!["a-agent", "b-agent"]);

        let total = store
            .update_token_spent("a-agent", NATIVE_ASSET, U256::from(400), 2)
            .unwrap();
        assert_eq!(total, U256::from(400));
        assert!(store
            .update_token_spent("a-agent", NATIVE_ASSET, U256::from(601), 3)
            .is_err());
        let reloaded = store.load_state("a-agent").unwrap().unwrap();
        assert_eq!(reloaded.budget.spent(NATIVE_ASSET), U256::from(400));

        assert!(matches!(
            store.update_token_spent("missing", NATIVE_ASSET, U256::one(), 4),
            Err(DelegationError::AgentNotFound(_))
        ));
        assert!(store.load_state("../escape").is_err());

        assert!(store.remove_agent("b-agent").unwrap());
        assert!(!store.agent_exists("b-agent"));

        store.reserve_agent("c-agent").unwrap();
        assert!(store.agent_exists("c-agent"));
        assert!(store.reserve_agent("c-agent").is_err());
        assert!(store.load_state("c-agent").unwrap().is_none());
    }

    #[test]
    fn legacy_state_is_rewritten_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(dir.path()).unwrap();
        let mut value = serde_json::to_value(state("legacy")).unwrap();
        value["budget"] = serde_json::json!({ "allocated": "0x3e8", "spent": "0x64" });
        let path = dir.path().join("agents/legacy/state.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let loaded = store.load_state("legacy").unwrap().unwrap();
        assert_eq!(loaded.budget.spent(NATIVE_ASSET), U256::from(100));

        let on_disk: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(on_disk["budget"]["tokens"]["native"].is_object());
    }

    #[test]
    fn trade_log_appends_and_tolerates_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(dir.path()).unwrap();
        let trade = TradeRecord {
            timestamp: 5,
            tx_hash: Some(H256::repeat_byte(1)),
            target: Address::repeat_byte(0x10),
            selector: MethodSelector::approve(),
            value_wei: U256::from(7),
            asset: None,
            amount: None,
            status: TradeStatus::Confirmed,
        };
        store.append_trade("agent-1", &trade).unwrap();
        store.append_trade("agent-1", &trade).unwrap();

        let log = dir.path().join("agents/agent-1/trades.jsonl");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        write!(file, "{{\"timestamp\":").unwrap();

        assert_eq!(store.read_trades("agent-1").unwrap(), vec![trade.clone(), trade]);
        assert!(store.read_trades("agent-2").unwrap().is_empty());
    }
}
