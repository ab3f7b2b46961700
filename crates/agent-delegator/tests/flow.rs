use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_delegator::{
    AgentDelegator, DelegatorConfig, DelegatorError, ErrorCategory, RootRequest, SubAgentRequest,
};
use async_trait::async_trait;
use chain_sync::{ChainError, ChainReader, Consumption};
use delegation_core::{
    decode_or_groups, now_ts, parse_native, verify_chain, AgentStatus, DelegationError,
    EnforcerAddresses, MethodSelector, TradeRecord, TradeStatus, TradingScope, NATIVE_ASSET,
};
use ethers_core::types::{Address, Bytes, H256, U256};
use passkey_adapter::{BiometricSigner, SignatureError, SoftwarePasskey};
use serde_json::Value;
use wallet_pool::WalletStatus;

fn user() -> Address {
    Address::repeat_byte(0x42)
}

fn router() -> Address {
    Address::repeat_byte(0x11)
}

fn perps() -> Address {
    Address::repeat_byte(0x22)
}

fn swap() -> MethodSelector {
    MethodSelector::from_signature("swapExactETHForTokens(uint256,address[],address,uint256)")
}

/// Chain state reduced to a settable delegator nonce.
#[derive(Default)]
struct FakeChain {
    nonce: Mutex<U256>,
    reads: AtomicUsize,
}

impl FakeChain {
    fn set_nonce(&self, nonce: u64) {
        *self.nonce.lock().unwrap() = U256::from(nonce);
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn current_nonce(&self, _delegator: Address) -> chain_sync::Result<U256> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(*self.nonce.lock().unwrap())
    }

    async fn balance(&self, _account: Address) -> chain_sync::Result<U256> {
        Ok(U256::zero())
    }

    async fn call(&self, _to: Address, _data: Bytes) -> chain_sync::Result<Bytes> {
        Err(ChainError::Decode("no contracts in the fake chain".into()))
    }

    async fn transaction_receipt(&self, _tx_hash: H256) -> chain_sync::Result<Option<Value>> {
        Ok(None)
    }
}

/// Passkey whose prompt the user always dismisses.
struct DecliningPasskey(SoftwarePasskey);

#[async_trait]
impl BiometricSigner for DecliningPasskey {
    fn key_id(&self) -> &str {
        self.0.key_id()
    }

    fn public_key(&self) -> p256::ecdsa::VerifyingKey {
        self.0.public_key()
    }

    async fn sign_digest(&self, _digest: [u8; 32]) -> passkey_adapter::Result<Vec<u8>> {
        Err(SignatureError::Cancelled)
    }
}

fn config(dir: &Path) -> DelegatorConfig {
    DelegatorConfig {
        data_dir: dir.to_path_buf(),
        trading: TradingScope::new(vec![router(), perps()], vec![swap()]),
        ..DelegatorConfig::default()
    }
}

fn delegator(dir: &Path, chain: Arc<FakeChain>) -> AgentDelegator {
    let passkey = Arc::new(SoftwarePasskey::generate("test-passkey"));
    AgentDelegator::new(config(dir), chain, passkey).unwrap()
}

fn root_request() -> RootRequest {
    RootRequest {
        delegator: user(),
        expiry_days: 7,
        budget: parse_native("50").unwrap(),
        max_calls: 100,
    }
}

fn sub_request(max_calls: u32) -> SubAgentRequest {
    SubAgentRequest {
        agent_id: None,
        agent_class: "dca".into(),
        allowed_targets: vec![router()],
        allowed_selectors: vec![swap()],
        expiry_days: 1,
        budget: parse_native("10").unwrap() * U256::from(max_calls) / U256::from(20),
        max_calls,
    }
}

fn trade() -> TradeRecord {
    TradeRecord {
        timestamp: now_ts(),
        tx_hash: Some(H256::repeat_byte(0x77)),
        target: router(),
        selector: swap(),
        value_wei: parse_native("0.5").unwrap(),
        asset: None,
        amount: None,
        status: TradeStatus::Confirmed,
    }
}

#[tokio::test]
async fn root_authorization_is_reused_until_forced() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(FakeChain::default());
    chain.set_nonce(3);
    let delegator = delegator(dir.path(), chain.clone());

    let root = delegator.authorize_root(&root_request(), false).await.unwrap();
    assert_eq!(root.nonce, U256::from(3));
    assert_eq!(root.metadata.value_per_call_cap, parse_native("0.5").unwrap());
    assert_eq!(root.delegation.delegate, delegator.session_address());

    let enforcers = EnforcerAddresses::default();
    let caveats = &root.delegation.caveats;
    assert_eq!(caveats.len(), 3);
    assert_eq!(caveats[0].enforcer, enforcers.logical_or_wrapper);
    assert_eq!(caveats[1].enforcer, enforcers.timestamp);
    assert_eq!(caveats[2].enforcer, enforcers.limited_calls);
    assert_eq!(decode_or_groups(&caveats[0].terms).unwrap().len(), 2);

    let again = delegator.authorize_root(&root_request(), false).await.unwrap();
    assert_eq!(again.delegation, root.delegation);
    assert_eq!(chain.reads(), 1);

    chain.set_nonce(4);
    let forced = delegator.authorize_root(&root_request(), true).await.unwrap();
    assert_eq!(forced.nonce, U256::from(4));
    assert_eq!(delegator.store().load_root().unwrap(), Some(forced));
}

#[tokio::test]
async fn declined_prompt_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let passkey = Arc::new(DecliningPasskey(SoftwarePasskey::generate("declines")));
    let delegator =
        AgentDelegator::new(config(dir.path()), Arc::new(FakeChain::default()), passkey).unwrap();

    let err = delegator.authorize_root(&root_request(), false).await.unwrap_err();
    assert!(matches!(
        err,
        DelegatorError::Delegation(DelegationError::AuthenticationDeclined)
    ));
    assert_eq!(err.category(), ErrorCategory::Authentication);
    assert!(delegator.store().load_root().unwrap().is_none());
}

#[tokio::test]
async fn over_ceiling_budget_is_rejected_before_any_chain_read() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(FakeChain::default());
    let delegator = delegator(dir.path(), chain.clone());

    let request = RootRequest {
        budget: parse_native("1001").unwrap(),
        ..root_request()
    };
    let err = delegator.authorize_root(&request, false).await.unwrap_err();
    assert!(matches!(
        err,
        DelegatorError::Delegation(DelegationError::CeilingExceeded { .. })
    ));
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(chain.reads(), 0);
}

#[tokio::test]
async fn sub_agent_chain_verifies_and_shares_the_batch_nonce() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(FakeChain::default());
    chain.set_nonce(9);
    let delegator = delegator(dir.path(), chain.clone());
    let root = delegator.authorize_root(&root_request(), false).await.unwrap();

    let issued = delegator.issue_sub_agent(&sub_request(20)).await.unwrap();
    assert_eq!(issued.chain.nonce, root.nonce);
    assert_eq!(issued.chain.parent_hash, root.delegation.hash());
    assert_eq!(issued.chain.delegation.delegate, issued.wallet.address);
    assert_eq!(issued.state.budget.allocated, parse_native("10").unwrap());
    assert_eq!(issued.state.trades.max, 20);
    assert_eq!(issued.wallet.status, WalletStatus::Active);

    let links = delegator.redemption_chain(&issued.state.id).await.unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0], issued.chain.delegation);
    assert_eq!(links[1], root.delegation);
    verify_chain(&links[1], &links[0], delegator.domain()).unwrap();

    let mut tampered = links[0].clone();
    tampered.caveats.pop();
    assert!(verify_chain(&links[1], &tampered, delegator.domain()).is_err());
}

#[tokio::test]
async fn chain_stays_redeemable_as_the_nonce_advances() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(FakeChain::default());
    let delegator = delegator(dir.path(), chain.clone());
    let root = delegator.authorize_root(&root_request(), false).await.unwrap();
    let issued = delegator.issue_sub_agent(&sub_request(20)).await.unwrap();
    let agent_id = issued.state.id.clone();

    let pending = delegator
        .confirm_redemption(&agent_id, U256::zero(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(pending, Consumption::NotConsumed { current: U256::zero() });

    // Each redemption bumps the delegator nonce on chain.
    delegator.redemption_chain(&agent_id).await.unwrap();
    chain.set_nonce(1);
    let confirmed = delegator
        .confirm_redemption(&agent_id, U256::zero(), Duration::ZERO)
        .await
        .unwrap();
    assert!(confirmed.is_consumed());
    delegator.record_trade(&agent_id, &trade()).await.unwrap();

    chain.set_nonce(2);
    let links = delegator.redemption_chain(&agent_id).await.unwrap();
    assert_eq!(links[0], issued.chain.delegation);

    // Later issuance snapshots the current nonce without a new root prompt.
    let second = delegator.issue_sub_agent(&sub_request(20)).await.unwrap();
    assert_eq!(second.chain.nonce, U256::from(2));
    assert_eq!(second.chain.parent_hash, root.delegation.hash());
    delegator.redemption_chain(&second.state.id).await.unwrap();
    assert_eq!(delegator.agents().unwrap().len(), 2);
}

#[tokio::test]
async fn sub_requests_must_fit_inside_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let delegator = delegator(dir.path(), Arc::new(FakeChain::default()));

    let err = delegator.issue_sub_agent(&sub_request(20)).await.unwrap_err();
    assert!(matches!(err, DelegatorError::NoRootDelegation));

    delegator.authorize_root(&root_request(), false).await.unwrap();

    let foreign_target = SubAgentRequest {
        allowed_targets: vec![Address::repeat_byte(0x99)],
        ..sub_request(20)
    };
    assert!(matches!(
        delegator.issue_sub_agent(&foreign_target).await,
        Err(DelegatorError::OutsideRootScope(_))
    ));

    let too_long = SubAgentRequest {
        expiry_days: 30,
        ..sub_request(20)
    };
    assert!(matches!(
        delegator.issue_sub_agent(&too_long).await,
        Err(DelegatorError::OutsideRootScope(_))
    ));

    let too_rich = SubAgentRequest {
        budget: parse_native("20").unwrap(),
        ..sub_request(20)
    };
    assert!(matches!(
        delegator.issue_sub_agent(&too_rich).await,
        Err(DelegatorError::OutsideRootScope(_))
    ));

    assert!(delegator.agents().unwrap().is_empty());
    assert!(delegator.pool().wallets().unwrap().is_empty());
}

#[tokio::test]
async fn trades_spend_budget_and_completion_frees_the_wallet() {
    let dir = tempfile::tempdir().unwrap();
    let delegator = delegator(dir.path(), Arc::new(FakeChain::default()));
    delegator.authorize_root(&root_request(), false).await.unwrap();
    let issued = delegator.issue_sub_agent(&sub_request(2)).await.unwrap();
    let id = issued.state.id.clone();

    let state = delegator.record_trade(&id, &trade()).await.unwrap();
    assert_eq!(state.trades.executed, 1);
    assert_eq!(state.budget.spent(NATIVE_ASSET), parse_native("0.5").unwrap());

    let state = delegator.record_trade(&id, &trade()).await.unwrap();
    assert_eq!(state.status, AgentStatus::Completed);
    assert_eq!(delegator.store().read_trades(&id).unwrap().len(), 2);

    let wallet = delegator.pool().wallet(&issued.wallet.id).unwrap().unwrap();
    assert_eq!(wallet.status, WalletStatus::Idle);

    let err = delegator.record_trade(&id, &trade()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    let state = delegator.store().load_state(&id).unwrap().unwrap();
    assert_eq!(state.errors.len(), 1);
    assert_eq!(delegator.store().read_trades(&id).unwrap().len(), 2);

    let next = delegator.issue_sub_agent(&sub_request(2)).await.unwrap();
    assert_eq!(next.wallet.id, issued.wallet.id);
}

#[tokio::test]
async fn revoking_the_root_revokes_every_agent() {
    let dir = tempfile::tempdir().unwrap();
    let delegator = delegator(dir.path(), Arc::new(FakeChain::default()));
    delegator.authorize_root(&root_request(), false).await.unwrap();
    let first = delegator.issue_sub_agent(&sub_request(4)).await.unwrap();
    let second = delegator.issue_sub_agent(&sub_request(4)).await.unwrap();
    assert_ne!(first.wallet.id, second.wallet.id);

    assert_eq!(delegator.revoke_root().await.unwrap(), 2);
    assert!(delegator.store().load_root().unwrap().is_none());
    for state in delegator.agents().unwrap() {
        assert_eq!(state.status, AgentStatus::Revoked);
    }
    assert!(delegator
        .pool()
        .wallets()
        .unwrap()
        .iter()
        .all(|wallet| wallet.status == WalletStatus::Idle));

    let err = delegator.redemption_chain(&first.state.id).await.unwrap_err();
    assert!(matches!(
        err,
        DelegatorError::Delegation(DelegationError::AgentInactive { .. })
    ));

    assert!(delegator.remove_agent(&first.state.id).await.unwrap());
    assert_eq!(delegator.agents().unwrap().len(), 1);
}
