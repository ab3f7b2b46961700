use std::fmt;

use async_trait::async_trait;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tracing::debug;

use crate::error::{Result, SignatureError};

/// A P-256 key whose use is gated by a biometric prompt.
///
/// Implementations return the raw 64-byte `r || s` encoding and report a
/// dismissed prompt as [`SignatureError::Cancelled`].
#[async_trait]
pub trait BiometricSigner: Send + Sync {
    /// Stable identifier of the key on the device.
    fn key_id(&self) -> &str;

    fn public_key(&self) -> VerifyingKey;

    async fn sign_digest(&self, digest: [u8; 32]) -> Result<Vec<u8>>;
}

/// In-process key standing in for a secure-enclave key during development
/// and tests. It never prompts.
#[derive(Clone)]
pub struct SoftwarePasskey {
    key_id: String,
    signing: SigningKey,
}

impl SoftwarePasskey {
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            signing: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret(key_id: impl Into<String>, secret: &[u8]) -> Result<Self> {
        let signing = SigningKey::from_slice(secret)
            .map_err(|err| SignatureError::Device(format!("invalid P-256 secret: {err}")))?;
        Ok(Self {
            key_id: key_id.into(),
            signing,
        })
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing.to_bytes().to_vec()
    }
}

impl fmt::Debug for SoftwarePasskey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwarePasskey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BiometricSigner for SoftwarePasskey {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key().clone()
    }

    async fn sign_digest(&self, digest: [u8; 32]) -> Result<Vec<u8>> {
        let signature: Signature = self
            .signing
            .sign_prehash(&digest)
            .map_err(|err| SignatureError::Device(err.to_string()))?;
        debug!(key_id = %self.key_id, "software passkey signed digest");
        Ok(signature.to_bytes().to_vec())
    }
}

/// Uncompressed SEC1 encoding of a public key, as persisted beside the root.
pub fn public_key_sec1(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

pub fn public_key_from_sec1(bytes: &[u8]) -> Result<VerifyingKey> {
    VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|err| SignatureError::InvalidPublicKey(err.to_string()))
}
