use std::sync::Arc;

use agent_delegator::{AgentDelegator, DelegatorConfig, RootRequest, SubAgentRequest};
use chain_sync::EthersChainClient;
use delegation_core::{parse_native, MethodSelector, TradingScope};
use ethers_core::types::Address;
use passkey_adapter::SoftwarePasskey;
use tracing::info;

/// Authorizes a root grant with a throwaway software passkey and issues one
/// sub-agent against the configured RPC endpoint.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_delegator=debug".into()),
        )
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => DelegatorConfig::load(path)?.with_env_overrides()?,
        None => DelegatorConfig::from_env()?,
    };
    if config.trading.targets.is_empty() {
        config.trading = TradingScope::new(
            vec![Address::repeat_byte(0x11)],
            vec![MethodSelector::from_signature(
                "swapExactETHForTokens(uint256,address[],address,uint256)",
            )],
        );
    }

    let client = Arc::new(EthersChainClient::connect(
        &config.rpc_url,
        config.delegation_manager,
        config.nonce_enforcer,
    )?);
    let delegator_address: Address = std::env::var("DELEGATOR_ACCOUNT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| Address::repeat_byte(0x42));

    let passkey = Arc::new(SoftwarePasskey::generate("delegator-dev"));
    let delegator = AgentDelegator::new(config, client, passkey)?;

    let root = delegator
        .authorize_root(
            &RootRequest {
                delegator: delegator_address,
                expiry_days: 7,
                budget: parse_native("50")?,
                max_calls: 100,
            },
            true,
        )
        .await?;
    info!(hash = ?root.delegation.hash(), nonce = %root.nonce, "root ready");

    let issued = delegator
        .issue_sub_agent(&SubAgentRequest {
            agent_id: None,
            agent_class: "dev".into(),
            allowed_targets: Vec::new(),
            allowed_selectors: Vec::new(),
            expiry_days: 1,
            budget: parse_native("10")?,
            max_calls: 20,
        })
        .await?;
    info!(
        agent_id = %issued.state.id,
        wallet = ?issued.wallet.address,
        "sub-agent issued"
    );

    let chain = delegator.redemption_chain(&issued.state.id).await?;
    info!(links = chain.len(), "redemption chain verified");
    Ok(())
}
