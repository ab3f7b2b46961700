use delegation_core::DelegationError;

/// Convenient result alias for passkey operations.
pub type Result<T> = std::result::Result<T, SignatureError>;

/// Errors raised while producing or checking a synthetic assertion.
#[derive(thiserror::Error, Debug)]
pub enum SignatureError {
    /// The user dismissed the biometric prompt.
    #[error("biometric prompt cancelled")]
    Cancelled,
    /// The device returned something other than raw `r || s`.
    #[error("expected a {expected}-byte raw signature, got {actual} bytes")]
    InvalidLength {
        /// Required length.
        expected: usize,
        /// Length received.
        actual: usize,
    },
    /// The biometric key failed for a reason other than cancellation.
    #[error("biometric device error: {0}")]
    Device(String),
    /// A public key could not be parsed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    /// An assertion payload could not be decoded.
    #[error("malformed assertion payload: {0}")]
    Malformed(String),
    /// The assertion does not verify against the given key and challenge.
    #[error("assertion verification failed: {0}")]
    Verification(String),
}

impl From<SignatureError> for DelegationError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Cancelled => DelegationError::AuthenticationDeclined,
            SignatureError::Verification(msg) => DelegationError::InvalidChain(msg),
            other => DelegationError::Signing(other.to_string()),
        }
    }
}
