use std::sync::Arc;
use std::time::Duration;

use chain_sync::{ChainReader, Consumption, NonceOracle, TransactionSender, TransactionSync};
use delegation_core::builder::SECONDS_PER_DAY;
use delegation_core::{
    now_ts, sign_delegation, verify_chain, AgentStatus, CapabilityBuilder, CaveatComposer,
    Delegation, DelegationChainRecord, DelegationDomain, DelegationError, DelegationStore,
    MethodSelector, NewAgent, RootParams, SessionKey, StoredRootDelegation, SubAgentState,
    SubParams, TradeRecord, UnsignedSub,
};
use ethers_core::types::{Address, Bytes, U256};
use passkey_adapter::{public_key_sec1, verify_root_passkey, BiometricSigner, WebAuthnAdapter};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wallet_pool::{OwnerDirectory, PoolWallet, WalletPoolManager};

use crate::config::DelegatorConfig;
use crate::error::{DelegatorError, Result};
use crate::session::load_or_create_session_key;

/// One-time root grant from the user's smart account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRequest {
    pub delegator: Address,
    pub expiry_days: u32,
    /// Total native budget in wei, spread evenly over `max_calls`.
    pub budget: U256,
    pub max_calls: u32,
}

/// Parameters for a new autonomous worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentRequest {
    /// Generated when absent.
    pub agent_id: Option<String>,
    pub agent_class: String,
    /// Defaults to every target the root allows.
    pub allowed_targets: Vec<Address>,
    /// Defaults to the configured trading selectors.
    pub allowed_selectors: Vec<MethodSelector>,
    pub expiry_days: u32,
    pub budget: U256,
    pub max_calls: u32,
}

/// Records created for a freshly issued sub-agent.
#[derive(Debug, Clone)]
pub struct IssuedAgent {
    pub state: SubAgentState,
    pub chain: DelegationChainRecord,
    pub wallet: PoolWallet,
}

struct StoreOwners(DelegationStore);

impl OwnerDirectory for StoreOwners {
    fn exists(&self, owner: &str) -> bool {
        self.0.agent_exists(owner)
    }
}

/// Issues, persists and reassembles delegation chains: the root is signed
/// once through the passkey, sub-delegations by the unattended session key.
pub struct AgentDelegator {
    config: DelegatorConfig,
    domain: DelegationDomain,
    builder: CapabilityBuilder,
    store: DelegationStore,
    pool: WalletPoolManager,
    nonces: NonceOracle,
    passkey: WebAuthnAdapter,
    session: SessionKey,
}

impl AgentDelegator {
    pub fn new(
        config: DelegatorConfig,
        reader: Arc<dyn ChainReader>,
        passkey: Arc<dyn BiometricSigner>,
    ) -> Result<Self> {
        config.ensure_dirs()?;
        let store = DelegationStore::open(&config.data_dir)?;
        let pool = WalletPoolManager::with_file_lock(
            config.pool_dir(),
            config.lock.clone(),
            Arc::new(StoreOwners(store.clone())),
        )?;
        let session = load_or_create_session_key(&config.session_key_path())?;

        let composer =
            CaveatComposer::new(config.enforcers.clone()).with_drift_policy(config.drift_policy);
        let builder = CapabilityBuilder::new(composer, config.trading.clone())
            .with_safety_ceiling(config.safety_ceiling);

        info!(
            data_dir = %config.data_dir.display(),
            chain_id = config.chain_id,
            session = ?session.address(),
            "agent delegator ready"
        );

        Ok(Self {
            domain: DelegationDomain::delegation_manager(config.chain_id, config.delegation_manager),
            nonces: NonceOracle::new(reader, config.retry.clone()),
            passkey: WebAuthnAdapter::new(passkey, config.webauthn.clone()),
            config,
            builder,
            store,
            pool,
            session,
        })
    }

    pub fn config(&self) -> &DelegatorConfig {
        &self.config
    }

    pub fn domain(&self) -> &DelegationDomain {
        &self.domain
    }

    pub fn store(&self) -> &DelegationStore {
        &self.store
    }

    pub fn pool(&self) -> &WalletPoolManager {
        &self.pool
    }

    pub fn nonces(&self) -> &NonceOracle {
        &self.nonces
    }

    /// Address the root delegation names as its delegate.
    pub fn session_address(&self) -> Address {
        self.session.address()
    }

    /// Prompt once for the root grant. An existing live root for the same
    /// delegator is returned untouched unless `force` is set, in which case a
    /// new root supersedes it.
    pub async fn authorize_root(
        &self,
        request: &RootRequest,
        force: bool,
    ) -> Result<StoredRootDelegation> {
        let now = now_ts();
        if !force {
            if let Some(existing) = self.store.load_root()? {
                if existing.delegation.delegator == request.delegator
                    && existing.delegation.delegate == self.session.address()
                    && existing.chain_id == self.config.chain_id
                    && !existing.is_expired(now)
                {
                    info!(hash = ?existing.delegation.hash(), "reusing live root delegation");
                    return Ok(existing);
                }
            }
        }

        let params = RootParams::from_budget(
            request.delegator,
            self.session.address(),
            request.expiry_days,
            request.budget,
            request.max_calls,
        )?;
        let draft = self.builder.build_root_at(&params, now)?;
        if !draft.strip_report.is_clean() {
            warn!(missing = ?draft.strip_report.missing, "root draft drifted from the expected caveat set");
        }

        let batch = self.nonces.begin_batch(request.delegator).await?;
        let signed = sign_delegation(&self.passkey, draft.delegation, &self.domain).await?;

        let root = StoredRootDelegation {
            delegation: signed,
            metadata: draft.metadata,
            nonce: batch.nonce(),
            chain_id: self.config.chain_id,
            passkey_public_key: Bytes::from(public_key_sec1(&self.passkey.public_key())),
        };
        self.store.save_root(&root)?;
        info!(
            delegator = ?request.delegator,
            nonce = %root.nonce,
            expires_at = root.metadata.expires_at,
            "authorized root delegation"
        );
        Ok(root)
    }

    /// Issue a scoped sub-delegation to a pool wallet, signed by the session
    /// key without a prompt.
    pub async fn issue_sub_agent(&self, request: &SubAgentRequest) -> Result<IssuedAgent> {
        let now = now_ts();
        let root = self.live_root(now)?;
        if root.delegation.delegate != self.session.address() {
            return Err(DelegatorError::OutsideRootScope(format!(
                "root delegates to {:?}, not this session key",
                root.delegation.delegate
            )));
        }

        let targets = if request.allowed_targets.is_empty() {
            root.metadata.allowed_targets.clone()
        } else {
            request.allowed_targets.clone()
        };
        let selectors = if request.allowed_selectors.is_empty() {
            self.config.trading.selectors.clone()
        } else {
            request.allowed_selectors.clone()
        };

        let params = SubParams::from_budget(
            Address::zero(),
            targets,
            selectors,
            request.expiry_days,
            request.budget,
            request.max_calls,
        )?;
        self.check_within_root(&root, &params, now)?;
        // Validated draft; the delegate is filled in once a wallet is assigned.
        let mut draft = self.builder.build_sub_at(&root.delegation, &params, now)?;

        let agent_id = match &request.agent_id {
            Some(id) => id.clone(),
            None => format!("agent-{}", Uuid::new_v4().simple()),
        };
        self.store.reserve_agent(&agent_id)?;

        match self.finish_issue(&agent_id, request, &root, &mut draft, &params).await {
            Ok(issued) => Ok(issued),
            Err(err) => {
                warn!(agent_id, "sub-agent issuance failed, rolling back: {err}");
                if let Err(cleanup) = self.store.remove_agent(&agent_id) {
                    warn!(agent_id, "could not remove partial agent records: {cleanup}");
                }
                Err(err)
            }
        }
    }

    async fn finish_issue(
        &self,
        agent_id: &str,
        request: &SubAgentRequest,
        root: &StoredRootDelegation,
        draft: &mut UnsignedSub,
        params: &SubParams,
    ) -> Result<IssuedAgent> {
        let wallet = self.pool.assign_wallet(agent_id).await?;
        draft.delegation.delegate = wallet.address;

        let signed = async {
            let batch = self.nonces.begin_batch(root.delegation.delegator).await?;
            let delegation =
                sign_delegation(&self.session, draft.delegation.clone(), &self.domain).await?;
            Ok::<_, DelegatorError>((delegation, batch.nonce()))
        }
        .await;

        let (delegation, nonce) = match signed {
            Ok(signed) => signed,
            Err(err) => {
                self.release_quietly(&wallet.id).await;
                return Err(err);
            }
        };

        let chain = DelegationChainRecord {
            agent_id: agent_id.to_string(),
            delegation,
            parent_hash: root.delegation.hash(),
            parent: root.delegation.clone(),
            nonce,
            created_at: draft.created_at,
        };
        let state = SubAgentState::new(NewAgent {
            id: agent_id.to_string(),
            wallet_id: wallet.id.clone(),
            wallet_address: wallet.address,
            agent_class: request.agent_class.clone(),
            allocated: params.total_allocation(),
            max_trades: params.max_calls,
            created_at: draft.created_at,
            expires_at: draft.expires_at,
        });

        let persisted = self
            .store
            .save_chain(&chain)
            .and_then(|()| self.store.save_state(&state));
        if let Err(err) = persisted {
            self.release_quietly(&wallet.id).await;
            return Err(err.into());
        }

        info!(
            agent_id,
            wallet = ?wallet.address,
            allocated = %state.budget.allocated,
            expires_at = state.expires_at,
            "issued sub-agent delegation"
        );
        Ok(IssuedAgent {
            state,
            chain,
            wallet,
        })
    }

    /// Chain for redemption, leaf first: `[sub, root]`. Fails if the agent is
    /// inactive, the root was superseded, or either signature does not verify.
    /// The delegator nonce advances with every redemption, so it is not checked
    /// here.
    pub async fn redemption_chain(&self, agent_id: &str) -> Result<Vec<Delegation>> {
        let now = now_ts();
        let state = self.load_state(agent_id)?;
        state.ensure_active(now)?;

        let chain = self
            .store
            .load_chain(agent_id)?
            .ok_or_else(|| DelegationError::AgentNotFound(agent_id.to_string()))?;
        let root = self.live_root(now)?;
        if chain.parent_hash != root.delegation.hash() {
            return Err(DelegationError::InvalidChain(
                "agent was issued under a superseded root delegation".into(),
            )
            .into());
        }

        verify_chain(&chain.parent, &chain.delegation, &self.domain)?;
        verify_root_passkey(&chain.parent, &self.domain, &root.passkey_public_key)?;

        debug!(agent_id, "assembled redemption chain");
        Ok(vec![chain.delegation, chain.parent])
    }

    /// Wait until the agent's delegator nonce moves past `observed`, which
    /// confirms a submitted redemption landed. A zero timeout reads once.
    pub async fn confirm_redemption(
        &self,
        agent_id: &str,
        observed: U256,
        timeout: Duration,
    ) -> Result<Consumption> {
        let chain = self
            .store
            .load_chain(agent_id)?
            .ok_or_else(|| DelegationError::AgentNotFound(agent_id.to_string()))?;
        let outcome = self
            .nonces
            .wait_for_consumption(chain.parent.delegator, observed, timeout)
            .await?;
        debug!(agent_id, consumed = outcome.is_consumed(), "checked redemption nonce");
        Ok(outcome)
    }

    /// Account for an executed trade and append it to the agent's log. A
    /// rejected trade is written to the agent's error log instead.
    pub async fn record_trade(&self, agent_id: &str, trade: &TradeRecord) -> Result<SubAgentState> {
        let outcome = self.store.update_state(agent_id, |state| {
            state.record_trade(trade)?;
            Ok(state.clone())
        });
        let state = match outcome {
            Ok(state) => state,
            Err(err @ DelegationError::AgentNotFound(_)) => return Err(err.into()),
            Err(err) => {
                if let Err(log_err) = self.record_agent_error(agent_id, &err.to_string()) {
                    warn!(agent_id, "could not record trade rejection: {log_err}");
                }
                return Err(err.into());
            }
        };

        self.store.append_trade(agent_id, trade)?;
        if state.status.is_terminal() {
            self.release_quietly(&state.wallet_id).await;
        }
        Ok(state)
    }

    pub fn record_agent_error(&self, agent_id: &str, message: &str) -> Result<()> {
        let now = now_ts();
        self.store.update_state(agent_id, |state| {
            state.record_error(message, now);
            Ok(())
        })?;
        Ok(())
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<SubAgentState> {
        let now = now_ts();
        let state = self.store.update_state(agent_id, |state| {
            state.set_status(status, now)?;
            Ok(state.clone())
        })?;
        if state.status.is_terminal() {
            self.release_quietly(&state.wallet_id).await;
        }
        Ok(state)
    }

    /// Mark the agent revoked and return its wallet to the pool. Records stay
    /// on disk until [`AgentDelegator::remove_agent`].
    pub async fn revoke_agent(&self, agent_id: &str) -> Result<SubAgentState> {
        let state = self.set_agent_status(agent_id, AgentStatus::Revoked).await?;
        info!(agent_id, "revoked sub-agent");
        Ok(state)
    }

    /// Delete the root record and revoke every agent issued under it.
    /// Returns the number of agents revoked.
    pub async fn revoke_root(&self) -> Result<usize> {
        let mut revoked = 0;
        for agent_id in self.store.list_agents()? {
            let Some(state) = self.store.load_state(&agent_id)? else {
                continue;
            };
            if state.status != AgentStatus::Revoked {
                self.revoke_agent(&agent_id).await?;
                revoked += 1;
            }
        }
        let existed = self.store.delete_root()?;
        info!(existed, revoked, "revoked root delegation");
        Ok(revoked)
    }

    /// Explicit teardown: releases the wallet and deletes every record.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<bool> {
        if let Some(state) = self.store.load_state(agent_id)? {
            self.release_quietly(&state.wallet_id).await;
        }
        Ok(self.store.remove_agent(agent_id)?)
    }

    pub fn agents(&self) -> Result<Vec<SubAgentState>> {
        let mut states = Vec::new();
        for agent_id in self.store.list_agents()? {
            if let Some(state) = self.store.load_state(&agent_id)? {
                states.push(state);
            }
        }
        Ok(states)
    }

    pub async fn cleanup_idle_wallets(&self, max_age_days: u32) -> Result<Vec<String>> {
        Ok(self.pool.cleanup_idle_wallets(max_age_days).await?)
    }

    fn load_state(&self, agent_id: &str) -> Result<SubAgentState> {
        Ok(self
            .store
            .load_state(agent_id)?
            .ok_or_else(|| DelegationError::AgentNotFound(agent_id.to_string()))?)
    }

    fn live_root(&self, now: u64) -> Result<StoredRootDelegation> {
        let root = self
            .store
            .load_root()?
            .ok_or(DelegatorError::NoRootDelegation)?;
        if root.chain_id != self.config.chain_id {
            return Err(DelegatorError::OutsideRootScope(format!(
                "root was signed for chain {}, configured chain is {}",
                root.chain_id, self.config.chain_id
            )));
        }
        if root.is_expired(now) {
            return Err(DelegationError::Expired {
                expires_at: root.metadata.expires_at,
            }
            .into());
        }
        Ok(root)
    }

    fn check_within_root(&self, root: &StoredRootDelegation, params: &SubParams, now: u64) -> Result<()> {
        if let Some(target) = params
            .allowed_targets
            .iter()
            .find(|target| !root.metadata.allowed_targets.contains(target))
        {
            return Err(DelegatorError::OutsideRootScope(format!(
                "target {target:?} is not allowed by the root"
            )));
        }

        let scope = &self.config.trading;
        if let Some(selector) = params
            .allowed_selectors
            .iter()
            .find(|selector| !scope.selectors.contains(selector) && **selector != scope.approve_selector)
        {
            return Err(DelegatorError::OutsideRootScope(format!(
                "selector {selector} is not allowed by the root"
            )));
        }

        let expires_at = now + u64::from(params.expiry_days) * SECONDS_PER_DAY;
        if expires_at > root.metadata.expires_at {
            return Err(DelegatorError::OutsideRootScope(format!(
                "expiry {expires_at} is after the root expiry {}",
                root.metadata.expires_at
            )));
        }
        if params.value_per_call_cap > root.metadata.value_per_call_cap {
            return Err(DelegatorError::OutsideRootScope(format!(
                "per-call cap {} wei is above the root cap {} wei",
                params.value_per_call_cap, root.metadata.value_per_call_cap
            )));
        }
        if params.max_calls > root.metadata.max_calls {
            return Err(DelegatorError::OutsideRootScope(format!(
                "{} calls requested, root allows {}",
                params.max_calls, root.metadata.max_calls
            )));
        }
        Ok(())
    }

    async fn release_quietly(&self, wallet_id: &str) {
        if let Err(err) = self.pool.release_wallet(wallet_id).await {
            warn!(wallet_id, "could not release pool wallet: {err}");
        }
    }
}

/// Submission path for redemption transactions, sharing one receipt cache.
pub fn transaction_sync<C>(config: &DelegatorConfig, client: Arc<C>) -> TransactionSync
where
    C: ChainReader + TransactionSender + 'static,
{
    let cache = Arc::new(config.sync.build_cache());
    let sender: Arc<dyn TransactionSender> = client.clone();
    let reader: Arc<dyn ChainReader> = client;
    TransactionSync::new(sender, reader, cache, config.sync.clone()).with_retry(config.retry.clone())
}
