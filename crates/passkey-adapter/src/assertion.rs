use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use delegation_core::{Delegation, DelegationDomain, DelegationSigner};
use ethers_core::abi::{self, ParamType, Token};
use ethers_core::types::{Bytes, H256, U256};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use tracing::{debug, info};

use crate::biometric::{public_key_from_sec1, BiometricSigner};
use crate::error::{Result, SignatureError};

/// Order of the P-256 group.
const P256_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xbc, 0xe6, 0xfa, 0xad, 0xa7, 0x17, 0x9e, 0x84, 0xf3, 0xb9, 0xca, 0xc2, 0xfc, 0x63, 0x25, 0x51,
];

pub const RAW_SIGNATURE_LEN: usize = 64;
/// User present and user verified.
pub const AUTHENTICATOR_FLAGS: u8 = 0x05;
pub const CLIENT_DATA_PREFIX: &str = "{\"type\":\"webauthn.get\",\"challenge\":\"";
/// Offset of `"type"` inside the client-data document.
pub const TYPE_LOCATION: usize = 1;

const TYPE_FIELD: &str = "\"type\":\"webauthn.get\"";

/// Relying-party settings baked into every synthetic assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebAuthnProfile {
    pub rp_id: String,
    pub origin: String,
    pub require_user_verification: bool,
}

impl Default for WebAuthnProfile {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            origin: "https://localhost".to_string(),
            require_user_verification: true,
        }
    }
}

impl WebAuthnProfile {
    /// `sha256(rpId) || flags || signCount(0)`, 37 bytes.
    pub fn authenticator_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&Sha256::digest(self.rp_id.as_bytes()));
        data.push(AUTHENTICATOR_FLAGS);
        data.extend_from_slice(&0u32.to_be_bytes());
        data
    }

    pub fn client_data_suffix(&self) -> String {
        format!("\",\"origin\":\"{}\",\"crossOrigin\":false}}", self.origin)
    }

    pub fn client_data_json(&self, challenge: H256) -> String {
        client_data_json(CLIENT_DATA_PREFIX, challenge, &self.client_data_suffix())
    }
}

fn client_data_json(prefix: &str, challenge: H256, suffix: &str) -> String {
    format!("{prefix}{}{suffix}", URL_SAFE_NO_PAD.encode(challenge.as_bytes()))
}

/// `sha256(authenticatorData || sha256(clientDataJSON))`, the message the
/// device key signs.
pub fn assertion_digest(authenticator_data: &[u8], client_data_json: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(authenticator_data);
    hasher.update(Sha256::digest(client_data_json.as_bytes()));
    hasher.finalize().into()
}

/// Split a raw `r || s` signature, folding `s` into the lower half of the
/// group order.
pub fn normalize_signature(raw: &[u8]) -> Result<(U256, U256)> {
    if raw.len() != RAW_SIGNATURE_LEN {
        return Err(SignatureError::InvalidLength {
            expected: RAW_SIGNATURE_LEN,
            actual: raw.len(),
        });
    }
    let order = curve_order();
    let r = U256::from_big_endian(&raw[..32]);
    let mut s = U256::from_big_endian(&raw[32..]);
    if r.is_zero() || r >= order {
        return Err(SignatureError::Malformed(format!("r out of range: {r:#x}")));
    }
    if s.is_zero() || s >= order {
        return Err(SignatureError::Malformed(format!("s out of range: {s:#x}")));
    }
    if s > order >> 1 {
        s = order - s;
    }
    Ok((r, s))
}

pub fn curve_order() -> U256 {
    U256::from_big_endian(&P256_ORDER)
}

pub fn half_order() -> U256 {
    curve_order() >> 1
}

/// Assertion fields in the order the verifying contract decodes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticAssertion {
    pub key_id_hash: H256,
    pub r: U256,
    pub s: U256,
    pub authenticator_data: Bytes,
    pub require_user_verification: bool,
    pub client_data_prefix: String,
    pub client_data_suffix: String,
    pub type_location: U256,
}

impl SyntheticAssertion {
    pub fn encode(&self) -> Bytes {
        Bytes::from(abi::encode(&[
            Token::FixedBytes(self.key_id_hash.as_bytes().to_vec()),
            Token::Uint(self.r),
            Token::Uint(self.s),
            Token::Bytes(self.authenticator_data.to_vec()),
            Token::Bool(self.require_user_verification),
            Token::String(self.client_data_prefix.clone()),
            Token::String(self.client_data_suffix.clone()),
            Token::Uint(self.type_location),
        ]))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let tokens = abi::decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Bytes,
                ParamType::Bool,
                ParamType::String,
                ParamType::String,
                ParamType::Uint(256),
            ],
            payload,
        )
        .map_err(|err| SignatureError::Malformed(err.to_string()))?;

        match tokens.as_slice() {
            [Token::FixedBytes(key_id_hash), Token::Uint(r), Token::Uint(s), Token::Bytes(authenticator_data), Token::Bool(require_uv), Token::String(prefix), Token::String(suffix), Token::Uint(type_location)] => {
                Ok(Self {
                    key_id_hash: H256::from_slice(key_id_hash),
                    r: *r,
                    s: *s,
                    authenticator_data: Bytes::from(authenticator_data.clone()),
                    require_user_verification: *require_uv,
                    client_data_prefix: prefix.clone(),
                    client_data_suffix: suffix.clone(),
                    type_location: *type_location,
                })
            }
            _ => Err(SignatureError::Malformed("unexpected token layout".into())),
        }
    }

    fn raw_signature(&self) -> [u8; RAW_SIGNATURE_LEN] {
        let mut raw = [0u8; RAW_SIGNATURE_LEN];
        self.r.to_big_endian(&mut raw[..32]);
        self.s.to_big_endian(&mut raw[32..]);
        raw
    }
}

pub fn key_id_hash(key_id: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(key_id.as_bytes()))
}

/// Re-derive the client-data document for `challenge` and check the P-256
/// signature carried by `assertion`.
pub fn verify_assertion(
    assertion: &SyntheticAssertion,
    challenge: H256,
    public_key: &VerifyingKey,
) -> Result<()> {
    if assertion.s > half_order() {
        return Err(SignatureError::Verification("signature s is not normalized".into()));
    }
    let prefix = &assertion.client_data_prefix;
    let type_ok = assertion.type_location < U256::from(prefix.len())
        && prefix
            .get(assertion.type_location.as_usize()..)
            .is_some_and(|rest| rest.starts_with(TYPE_FIELD));
    if !type_ok {
        return Err(SignatureError::Verification(
            "client data type field not at declared offset".into(),
        ));
    }

    let client_data = client_data_json(
        &assertion.client_data_prefix,
        challenge,
        &assertion.client_data_suffix,
    );
    let digest = assertion_digest(&assertion.authenticator_data, &client_data);
    let signature = Signature::from_slice(&assertion.raw_signature())
        .map_err(|err| SignatureError::Verification(err.to_string()))?;
    public_key
        .verify_prehash(&digest, &signature)
        .map_err(|err| SignatureError::Verification(err.to_string()))
}

/// Check a root delegation's passkey signature against the SEC1 public key
/// stored beside it.
pub fn verify_root_passkey(
    root: &Delegation,
    domain: &DelegationDomain,
    public_key_sec1: &[u8],
) -> Result<()> {
    let payload = root
        .signature_bytes()
        .map_err(|err| SignatureError::Verification(err.to_string()))?;
    let assertion = SyntheticAssertion::decode(payload)?;
    let key = public_key_from_sec1(public_key_sec1)?;
    verify_assertion(&assertion, domain.signing_digest(root), &key)
}

/// Turns a biometric device signature into a verifier-acceptable assertion.
#[derive(Clone)]
pub struct WebAuthnAdapter {
    signer: Arc<dyn BiometricSigner>,
    profile: WebAuthnProfile,
}

impl WebAuthnAdapter {
    pub fn new(signer: Arc<dyn BiometricSigner>, profile: WebAuthnProfile) -> Self {
        Self { signer, profile }
    }

    pub fn profile(&self) -> &WebAuthnProfile {
        &self.profile
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signer.public_key()
    }

    /// Prompt for a signature over `challenge` and package it.
    pub async fn assert(&self, challenge: H256) -> Result<SyntheticAssertion> {
        let authenticator_data = self.profile.authenticator_data();
        let client_data = self.profile.client_data_json(challenge);
        let digest = assertion_digest(&authenticator_data, &client_data);

        let raw = match self.signer.sign_digest(digest).await {
            Ok(raw) => raw,
            Err(SignatureError::Cancelled) => {
                info!(key_id = %self.signer.key_id(), "biometric prompt declined");
                return Err(SignatureError::Cancelled);
            }
            Err(err) => return Err(err),
        };
        let (r, s) = normalize_signature(&raw)?;
        debug!(key_id = %self.signer.key_id(), "built synthetic assertion");

        Ok(SyntheticAssertion {
            key_id_hash: key_id_hash(self.signer.key_id()),
            r,
            s,
            authenticator_data: Bytes::from(authenticator_data),
            require_user_verification: self.profile.require_user_verification,
            client_data_prefix: CLIENT_DATA_PREFIX.to_string(),
            client_data_suffix: self.profile.client_data_suffix(),
            type_location: U256::from(TYPE_LOCATION),
        })
    }
}

#[async_trait]
impl DelegationSigner for WebAuthnAdapter {
    fn scheme(&self) -> &'static str {
        "webauthn-p256"
    }

    async fn sign_digest(&self, digest: H256) -> delegation_core::Result<Bytes> {
        Ok(self.assert(digest).await?.encode())
    }
}
