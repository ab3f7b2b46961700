//! Emulated WebAuthn assertions for biometric-gated P-256 keys, so a
//! delegation signed on-device verifies against a contract that expects an
//! authenticator response.

pub mod assertion;
pub mod biometric;
pub mod error;

pub use assertion::{
    assertion_digest, key_id_hash, normalize_signature, verify_assertion, verify_root_passkey,
    SyntheticAssertion, WebAuthnAdapter, WebAuthnProfile,
};
pub use biometric::{public_key_from_sec1, public_key_sec1, BiometricSigner, SoftwarePasskey};
pub use error::{Result, SignatureError};
