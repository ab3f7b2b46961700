use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::{Address, U256};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::reader::ChainReader;
use crate::retry::RetryPolicy;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Nonce read once for a group of delegations signed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningBatch {
    delegator: Address,
    nonce: U256,
}

impl SigningBatch {
    pub fn delegator(&self) -> Address {
        self.delegator
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// The on-chain counter moved past the observed value.
    Consumed { current: U256 },
    NotConsumed { current: U256 },
}

impl Consumption {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Consumption::Consumed { .. })
    }
}

/// Reads the verifier's replay-protection counter. Every read goes to the
/// chain; nothing is cached between batches.
#[derive(Clone)]
pub struct NonceOracle {
    reader: Arc<dyn ChainReader>,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl NonceOracle {
    pub fn new(reader: Arc<dyn ChainReader>, retry: RetryPolicy) -> Self {
        Self {
            reader,
            retry,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn fetch_nonce(&self, delegator: Address) -> Result<U256> {
        let reader = Arc::clone(&self.reader);
        self.retry
            .run("current_nonce", move || {
                let reader = Arc::clone(&reader);
                async move { reader.current_nonce(delegator).await }
            })
            .await
    }

    /// Take the single snapshot every delegation in a batch is bound to.
    pub async fn begin_batch(&self, delegator: Address) -> Result<SigningBatch> {
        let nonce = self.fetch_nonce(delegator).await?;
        debug!(?delegator, %nonce, "opened signing batch");
        Ok(SigningBatch { delegator, nonce })
    }

    /// Poll until the counter exceeds `observed`. A zero timeout performs
    /// exactly one read.
    pub async fn wait_for_consumption(
        &self,
        delegator: Address,
        observed: U256,
        timeout: Duration,
    ) -> Result<Consumption> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.fetch_nonce(delegator).await?;
            if current > observed {
                info!(?delegator, %observed, %current, "nonce consumed");
                return Ok(Consumption::Consumed { current });
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(?delegator, %observed, "nonce not consumed before timeout");
                return Ok(Consumption::NotConsumed { current });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// A record signed at `recorded` is stale once the chain has moved on.
    pub async fn is_stale(&self, delegator: Address, recorded: U256) -> Result<bool> {
        Ok(self.fetch_nonce(delegator).await? > recorded)
    }
}
