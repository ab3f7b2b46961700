use std::fmt;

use async_trait::async_trait;
use ethers_core::types::{Address, Bytes, H256};
use ethers_signers::{LocalWallet, Signer};
use tracing::debug;

use crate::delegation::{Delegation, DelegationDomain};
use crate::error::{DelegationError, Result};

/// Produces a signature the verifying contract accepts for a typed-data
/// digest. Implementations decide the scheme (session ECDSA key, passkey
/// assertion, ...); callers only see the resulting bytes.
#[async_trait]
pub trait DelegationSigner: Send + Sync {
    /// Short label used in logs.
    fn scheme(&self) -> &'static str;

    /// Sign `digest`. A cancelled user prompt must surface as
    /// [`DelegationError::AuthenticationDeclined`].
    async fn sign_digest(&self, digest: H256) -> Result<Bytes>;
}

/// Sign an unsigned draft, returning the signed delegation. Nothing is
/// returned on failure, so a declined prompt leaves no partial object behind.
pub async fn sign_delegation(
    signer: &dyn DelegationSigner,
    delegation: Delegation,
    domain: &DelegationDomain,
) -> Result<Delegation> {
    if delegation.is_signed() {
        return Err(DelegationError::AlreadySigned);
    }
    let digest = domain.signing_digest(&delegation);
    debug!(scheme = signer.scheme(), digest = ?digest, "signing delegation");
    let signature = signer.sign_digest(digest).await?;
    delegation.into_signed(signature)
}

/// Unattended secp256k1 key that signs sub-delegations without a biometric
/// prompt.
#[derive(Clone)]
pub struct SessionKey {
    wallet: LocalWallet,
}

impl SessionKey {
    pub fn random() -> Self {
        Self {
            wallet: LocalWallet::new(&mut rand::thread_rng()),
        }
    }

    pub fn from_hex(secret: &str) -> Result<Self> {
        let trimmed = secret.trim();
        let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
            .map_err(|err| DelegationError::validation(format!("session key is not hex: {err}")))?;
        let wallet = LocalWallet::from_bytes(&bytes)
            .map_err(|err| DelegationError::validation(format!("invalid session key: {err}")))?;
        Ok(Self { wallet })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.wallet.signer().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DelegationSigner for SessionKey {
    fn scheme(&self) -> &'static str {
        "session-ecdsa"
    }

    async fn sign_digest(&self, digest: H256) -> Result<Bytes> {
        let signature = self
            .wallet
            .sign_hash(digest)
            .map_err(|err| DelegationError::Signing(err.to_string()))?;
        Ok(Bytes::from(signature.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_round_trips_through_hex() {
        let key = SessionKey::random();
        let restored = SessionKey::from_hex(&format!("0x{}", key.to_hex())).unwrap();
        assert_eq!(key.address(), restored.address());
        assert!(SessionKey::from_hex("zz").is_err());
    }

    #[tokio::test]
    async fn session_signature_is_65_bytes() {
        let key = SessionKey::random();
        let sig = key.sign_digest(H256::repeat_byte(3)).await.unwrap();
        assert_eq!(sig.len(), 65);
    }
}
