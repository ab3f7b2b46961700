use ethers_core::abi::{self, Token};
use ethers_core::types::transaction::eip712::EIP712Domain;
use ethers_core::types::{Address, Bytes, Signature, H256, U256};
use ethers_core::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::caveats::Caveat;
use crate::error::{DelegationError, Result};

/// Authority value marking a delegation as a top-level grant.
pub const ROOT_AUTHORITY: H256 = H256([0xff; 32]);

pub const CAVEAT_TYPE: &str = "Caveat(address enforcer,bytes terms)";
pub const DELEGATION_TYPE: &str = "Delegation(address delegate,address delegator,bytes32 authority,Caveat[] caveats,uint256 salt)Caveat(address enforcer,bytes terms)";

/// A permission object authorising `delegate` to act for `delegator` within
/// the bounds of `caveats`. A missing signature marks an unsigned draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    pub delegate: Address,
    pub delegator: Address,
    pub authority: H256,
    pub caveats: Vec<Caveat>,
    pub salt: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Bytes>,
}

impl Delegation {
    pub fn is_signed(&self) -> bool {
        self.signature.as_ref().is_some_and(|sig| !sig.is_empty())
    }

    pub fn is_root(&self) -> bool {
        self.authority == ROOT_AUTHORITY
    }

    /// Typed-data struct hash. This is the delegation's identity and the
    /// authority value children reference. Signatures and caveat args are
    /// not covered.
    pub fn hash(&self) -> H256 {
        let caveat_hashes: Vec<u8> = self.caveats.iter().flat_map(caveat_hash).collect();
        let encoded = abi::encode(&[
            Token::FixedBytes(keccak256(DELEGATION_TYPE.as_bytes()).to_vec()),
            Token::Address(self.delegate),
            Token::Address(self.delegator),
            Token::FixedBytes(self.authority.as_bytes().to_vec()),
            Token::FixedBytes(keccak256(caveat_hashes).to_vec()),
            Token::Uint(self.salt),
        ]);
        H256(keccak256(encoded))
    }

    /// Attach a signature, producing the immutable signed form.
    pub fn into_signed(self, signature: Bytes) -> Result<Self> {
        if self.is_signed() {
            return Err(DelegationError::AlreadySigned);
        }
        if signature.is_empty() {
            return Err(DelegationError::Signing("empty signature".into()));
        }
        Ok(Self {
            signature: Some(signature),
            ..self
        })
    }

    pub fn signature_bytes(&self) -> Result<&Bytes> {
        self.signature
            .as_ref()
            .filter(|sig| !sig.is_empty())
            .ok_or(DelegationError::Unsigned)
    }
}

fn caveat_hash(caveat: &Caveat) -> [u8; 32] {
    keccak256(abi::encode(&[
        Token::FixedBytes(keccak256(CAVEAT_TYPE.as_bytes()).to_vec()),
        Token::Address(caveat.enforcer),
        Token::FixedBytes(keccak256(&caveat.terms).to_vec()),
    ]))
}

/// EIP-712 domain of the verifying delegation manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl DelegationDomain {
    pub fn delegation_manager(chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            name: "DelegationManager".to_string(),
            version: "1".to_string(),
            chain_id,
            verifying_contract,
        }
    }

    pub fn separator(&self) -> H256 {
        let domain = EIP712Domain {
            name: Some(self.name.clone()),
            version: Some(self.version.clone()),
            chain_id: Some(U256::from(self.chain_id)),
            verifying_contract: Some(self.verifying_contract),
            salt: None,
        };
        H256(domain.separator())
    }

    /// `keccak256(0x1901 || domainSeparator || delegationHash)`, the digest
    /// every signer commits to.
    pub fn signing_digest(&self, delegation: &Delegation) -> H256 {
        let mut preimage = Vec::with_capacity(66);
        preimage.extend_from_slice(&[0x19, 0x01]);
        preimage.extend_from_slice(self.separator().as_bytes());
        preimage.extend_from_slice(delegation.hash().as_bytes());
        H256(keccak256(preimage))
    }
}

/// Recover the ECDSA signer of a session-key signed delegation.
pub fn recover_session_signer(delegation: &Delegation, domain: &DelegationDomain) -> Result<Address> {
    let raw = delegation.signature_bytes()?;
    let signature = Signature::try_from(&raw[..])
        .map_err(|err| DelegationError::InvalidChain(format!("malformed signature: {err}")))?;
    signature
        .recover(domain.signing_digest(delegation))
        .map_err(|err| DelegationError::InvalidChain(format!("signature recovery failed: {err}")))
}

/// Check that `sub` is a valid child of `root`: linkage by hash, delegator
/// continuity, and a sub signature from the root's delegate.
///
/// The root's own signature is a passkey assertion and is checked separately
/// against the stored public key.
pub fn verify_chain(root: &Delegation, sub: &Delegation, domain: &DelegationDomain) -> Result<()> {
    if !root.is_signed() || !sub.is_signed() {
        return Err(DelegationError::Unsigned);
    }
    if !root.is_root() {
        return Err(DelegationError::InvalidChain(
            "parent does not carry the root authority".into(),
        ));
    }
    if sub.authority != root.hash() {
        return Err(DelegationError::InvalidChain(format!(
            "sub authority {:?} does not match parent hash {:?}",
            sub.authority,
            root.hash()
        )));
    }
    if sub.delegator != root.delegate {
        return Err(DelegationError::InvalidChain(format!(
            "sub delegator {:?} is not the parent delegate {:?}",
            sub.delegator, root.delegate
        )));
    }

    let signer = recover_session_signer(sub, domain)?;
    if signer != sub.delegator {
        return Err(DelegationError::InvalidChain(format!(
            "sub signed by {signer:?}, expected {:?}",
            sub.delegator
        )));
    }
    Ok(())
}
