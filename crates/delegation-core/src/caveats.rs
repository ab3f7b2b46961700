use std::fmt;
use std::str::FromStr;

use ethers_core::abi::{self, ParamType, Token};
use ethers_core::types::{Address, Bytes, U256};
use ethers_core::utils::keccak256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::{DelegationError, Result};

/// Index of the "approve-any" group inside the root OR-wrapper.
pub const GROUP_APPROVE_ANY: usize = 0;
/// Index of the "scoped-trading" group inside the root OR-wrapper.
pub const GROUP_SCOPED_TRADING: usize = 1;

/// Caveats the framework's `functionCall` scope expands into. The composer
/// removes these from root drafts and replaces them with an OR-wrapper.
const SCOPE_RESTRICTIONS: [CaveatKind; 3] = [
    CaveatKind::AllowedTargets,
    CaveatKind::AllowedMethods,
    CaveatKind::ValueLte,
];

/// Four-byte function selector, serialised as a `0x`-prefixed hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodSelector(pub [u8; 4]);

impl MethodSelector {
    /// Derive the selector from a canonical Solidity signature such as
    /// `transfer(address,uint256)`.
    pub fn from_signature(signature: &str) -> Self {
        let hash = keccak256(signature.as_bytes());
        Self([hash[0], hash[1], hash[2], hash[3]])
    }

    /// ERC-20 `approve(address,uint256)`.
    pub fn approve() -> Self {
        Self::from_signature("approve(address,uint256)")
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for MethodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for MethodSelector {
    type Err = DelegationError;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(trimmed)
            .map_err(|err| DelegationError::validation(format!("invalid selector {value}: {err}")))?;
        let selector: [u8; 4] = bytes
            .try_into()
            .map_err(|_| DelegationError::validation(format!("selector {value} is not 4 bytes")))?;
        Ok(Self(selector))
    }
}

impl Serialize for MethodSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MethodSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Restriction types understood by the on-chain verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaveatKind {
    AllowedTargets,
    AllowedMethods,
    ValueLte,
    Timestamp,
    LimitedCalls,
    ExactCalldata,
    LogicalOrWrapper,
}

impl CaveatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowedTargets => "allowedTargets",
            Self::AllowedMethods => "allowedMethods",
            Self::ValueLte => "valueLte",
            Self::Timestamp => "timestamp",
            Self::LimitedCalls => "limitedCalls",
            Self::ExactCalldata => "exactCalldata",
            Self::LogicalOrWrapper => "logicalOrWrapper",
        }
    }
}

impl fmt::Display for CaveatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single restriction attached to a delegation.
///
/// `args` is supplied at redemption time and is not covered by the
/// delegation hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    pub enforcer: Address,
    pub terms: Bytes,
    #[serde(default)]
    pub args: Bytes,
}

impl Caveat {
    pub fn new(enforcer: Address, terms: impl Into<Bytes>) -> Self {
        Self {
            enforcer,
            terms: terms.into(),
            args: Bytes::default(),
        }
    }
}

/// A set of caveats that are ANDed together inside an OR-wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatGroup {
    pub caveats: Vec<Caveat>,
}

impl CaveatGroup {
    pub fn new(caveats: Vec<Caveat>) -> Self {
        Self { caveats }
    }
}

/// Deployed enforcer contract per caveat kind. Override per chain deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnforcerAddresses {
    pub allowed_targets: Address,
    pub allowed_methods: Address,
    pub value_lte: Address,
    pub timestamp: Address,
    pub limited_calls: Address,
    pub exact_calldata: Address,
    pub logical_or_wrapper: Address,
}

impl Default for EnforcerAddresses {
    fn default() -> Self {
        Self {
            allowed_targets: static_address("0x7F20f61b1f09b08D970938F6fa563634d65c4EeB"),
            allowed_methods: static_address("0x2c21fD0Cb9DC8445CB3fb0DC5E7Bb0Aca01842B5"),
            value_lte: static_address("0x92Bf12322527cAA612fd31a0e810472BBB106A8F"),
            timestamp: static_address("0x1046bb45C8d673d4ea75321280DB34899413c069"),
            limited_calls: static_address("0x04658B29F6b82ed55274221a06Fc97D318E25416"),
            exact_calldata: static_address("0x99F2e9bF15ce5eC84685604836F71aB835DBBdED"),
            logical_or_wrapper: static_address("0xE1302607a3251AF54c3a6e69318d6aa07F5eB46c"),
        }
    }
}

impl EnforcerAddresses {
    pub fn address_of(&self, kind: CaveatKind) -> Address {
        match kind {
            CaveatKind::AllowedTargets => self.allowed_targets,
            CaveatKind::AllowedMethods => self.allowed_methods,
            CaveatKind::ValueLte => self.value_lte,
            CaveatKind::Timestamp => self.timestamp,
            CaveatKind::LimitedCalls => self.limited_calls,
            CaveatKind::ExactCalldata => self.exact_calldata,
            CaveatKind::LogicalOrWrapper => self.logical_or_wrapper,
        }
    }

    /// Reverse lookup used when filtering drafts by enforcer identity.
    pub fn kind_of(&self, enforcer: Address) -> Option<CaveatKind> {
        [
            CaveatKind::AllowedTargets,
            CaveatKind::AllowedMethods,
            CaveatKind::ValueLte,
            CaveatKind::Timestamp,
            CaveatKind::LimitedCalls,
            CaveatKind::ExactCalldata,
            CaveatKind::LogicalOrWrapper,
        ]
        .into_iter()
        .find(|kind| self.address_of(*kind) == enforcer)
    }

    pub fn allowed_targets(&self, targets: &[Address]) -> Caveat {
        let mut terms = Vec::with_capacity(targets.len() * 20);
        for target in targets {
            terms.extend_from_slice(target.as_bytes());
        }
        Caveat::new(self.allowed_targets, terms)
    }

    pub fn allowed_methods(&self, selectors: &[MethodSelector]) -> Caveat {
        let mut terms = Vec::with_capacity(selectors.len() * 4);
        for selector in selectors {
            terms.extend_from_slice(selector.as_bytes());
        }
        Caveat::new(self.allowed_methods, terms)
    }

    pub fn value_lte(&self, max_value: U256) -> Caveat {
        Caveat::new(self.value_lte, u256_word(max_value).to_vec())
    }

    /// Validity window. Terms are `uint128 after || uint128 before`.
    pub fn timestamp(&self, after: u64, before: u64) -> Caveat {
        let mut terms = Vec::with_capacity(32);
        terms.extend_from_slice(&u128::from(after).to_be_bytes());
        terms.extend_from_slice(&u128::from(before).to_be_bytes());
        Caveat::new(self.timestamp, terms)
    }

    pub fn limited_calls(&self, max_calls: u32) -> Caveat {
        Caveat::new(self.limited_calls, u256_word(U256::from(max_calls)).to_vec())
    }

    pub fn exact_calldata(&self, calldata: Bytes) -> Caveat {
        Caveat::new(self.exact_calldata, calldata)
    }

    pub fn logical_or(&self, groups: &[CaveatGroup]) -> Caveat {
        Caveat::new(self.logical_or_wrapper, encode_or_groups(groups))
    }
}

/// Contracts and selectors an agent may trade against, plus the approval
/// selector that is allowed on arbitrary asset contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingScope {
    pub targets: Vec<Address>,
    pub selectors: Vec<MethodSelector>,
    #[serde(default = "MethodSelector::approve")]
    pub approve_selector: MethodSelector,
}

impl TradingScope {
    pub fn new(targets: Vec<Address>, selectors: Vec<MethodSelector>) -> Self {
        Self {
            targets,
            selectors,
            approve_selector: MethodSelector::approve(),
        }
    }
}

impl Default for TradingScope {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

/// What to do when a framework draft lacks a restriction caveat the composer
/// expected to replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    /// Log the drift and continue with the OR-wrapper substitution.
    #[default]
    Warn,
    /// Fail with [`DelegationError::ProtocolDrift`].
    Reject,
}

/// Outcome of stripping scope restrictions from a draft.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripReport {
    pub removed: Vec<CaveatKind>,
    pub missing: Vec<CaveatKind>,
}

impl StripReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Final caveat list for a root delegation together with the strip report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedCaveats {
    pub caveats: Vec<Caveat>,
    pub report: StripReport,
}

/// Builds caveat lists, including OR-grouping of restrictions the verifier
/// would otherwise AND together.
#[derive(Debug, Clone, Default)]
pub struct CaveatComposer {
    enforcers: EnforcerAddresses,
    drift_policy: DriftPolicy,
}

impl CaveatComposer {
    pub fn new(enforcers: EnforcerAddresses) -> Self {
        Self {
            enforcers,
            drift_policy: DriftPolicy::default(),
        }
    }

    pub fn with_drift_policy(mut self, policy: DriftPolicy) -> Self {
        self.drift_policy = policy;
        self
    }

    pub fn enforcers(&self) -> &EnforcerAddresses {
        &self.enforcers
    }

    /// Expand a `functionCall` scope into the AND-composed
    /// target/method/value caveats the framework generates for a draft.
    pub fn expand_function_call_scope(
        &self,
        targets: &[Address],
        selectors: &[MethodSelector],
        value_lte: U256,
    ) -> Vec<Caveat> {
        vec![
            self.enforcers.allowed_targets(targets),
            self.enforcers.allowed_methods(selectors),
            self.enforcers.value_lte(value_lte),
        ]
    }

    /// Remove every scope restriction caveat from `draft`, keeping the rest
    /// in their original order.
    pub fn strip_restrictions(&self, draft: Vec<Caveat>) -> (Vec<Caveat>, StripReport) {
        let mut report = StripReport::default();
        let mut kept = Vec::with_capacity(draft.len());

        for caveat in draft {
            match self.enforcers.kind_of(caveat.enforcer) {
                Some(kind) if SCOPE_RESTRICTIONS.contains(&kind) => {
                    if !report.removed.contains(&kind) {
                        report.removed.push(kind);
                    }
                }
                _ => kept.push(caveat),
            }
        }

        report.missing = SCOPE_RESTRICTIONS
            .iter()
            .copied()
            .filter(|kind| !report.removed.contains(kind))
            .collect();

        debug!(removed = ?report.removed, missing = ?report.missing, "stripped scope restrictions");
        (kept, report)
    }

    /// Pure `draftCaveats -> finalCaveats` transformation for root delegations:
    /// strip the scope restrictions and prepend a single OR-wrapper over
    /// `groups`.
    pub fn compose_root_caveats(
        &self,
        draft: Vec<Caveat>,
        groups: &[CaveatGroup],
    ) -> Result<ComposedCaveats> {
        if groups.len() < 2 {
            return Err(DelegationError::validation(
                "logical-or wrapper needs at least two caveat groups",
            ));
        }

        let (kept, report) = self.strip_restrictions(draft);
        if !report.is_clean() {
            match self.drift_policy {
                DriftPolicy::Warn => warn!(
                    missing = ?report.missing,
                    "draft delegation lacks expected restriction caveats; framework version drift?"
                ),
                DriftPolicy::Reject => {
                    return Err(DelegationError::ProtocolDrift {
                        missing: report.missing,
                    })
                }
            }
        }

        let mut caveats = Vec::with_capacity(kept.len() + 1);
        caveats.push(self.enforcers.logical_or(groups));
        caveats.extend(kept);
        self.check_or_position(&caveats)?;

        Ok(ComposedCaveats { caveats, report })
    }

    /// The two root capability groups: approvals on any asset contract, and
    /// scoped calls to the trading contracts.
    pub fn root_groups(&self, scope: &TradingScope, value_per_call_cap: U256) -> Vec<CaveatGroup> {
        vec![
            CaveatGroup::new(vec![self.enforcers.allowed_methods(&[scope.approve_selector])]),
            CaveatGroup::new(vec![
                self.enforcers.allowed_targets(&scope.targets),
                self.enforcers.allowed_methods(&scope.selectors),
                self.enforcers.value_lte(value_per_call_cap),
            ]),
        ]
    }

    /// Caveats for a sub-delegation, in the order the verifier evaluates them.
    pub fn sub_caveats(
        &self,
        targets: &[Address],
        selectors: &[MethodSelector],
        value_per_call_cap: U256,
        window: (u64, u64),
        max_calls: u32,
    ) -> Vec<Caveat> {
        let mut caveats = self.expand_function_call_scope(targets, selectors, value_per_call_cap);
        caveats.push(self.enforcers.timestamp(window.0, window.1));
        caveats.push(self.enforcers.limited_calls(max_calls));
        caveats
    }

    /// An OR-wrapper is only honoured as the first caveat, and only once.
    pub fn check_or_position(&self, caveats: &[Caveat]) -> Result<()> {
        let or_wrapper = self.enforcers.logical_or_wrapper;
        let positions: Vec<usize> = caveats
            .iter()
            .enumerate()
            .filter(|(_, caveat)| caveat.enforcer == or_wrapper)
            .map(|(idx, _)| idx)
            .collect();
        match positions.as_slice() {
            [] | [0] => Ok(()),
            _ => Err(DelegationError::validation(format!(
                "logical-or wrapper must be the single first caveat, found at {positions:?}"
            ))),
        }
    }

    /// Fill the OR-wrapper's redemption args with the chosen group index.
    pub fn select_group(&self, mut caveats: Vec<Caveat>, group: usize) -> Result<Vec<Caveat>> {
        let wrapper = caveats
            .first_mut()
            .filter(|caveat| caveat.enforcer == self.enforcers.logical_or_wrapper)
            .ok_or_else(|| DelegationError::validation("delegation has no logical-or wrapper"))?;

        let groups = decode_or_groups(&wrapper.terms)?;
        let selected = groups.get(group).ok_or_else(|| {
            DelegationError::validation(format!(
                "group {group} out of range ({} groups)",
                groups.len()
            ))
        })?;

        let caveat_args = selected
            .caveats
            .iter()
            .map(|caveat| Token::Bytes(caveat.args.to_vec()))
            .collect();
        wrapper.args = Bytes::from(abi::encode(&[Token::Tuple(vec![
            Token::Uint(U256::from(group)),
            Token::Array(caveat_args),
        ])]));
        Ok(caveats)
    }
}

/// `abi.encode(CaveatGroup[])` where `CaveatGroup { Caveat[] caveats }`.
pub fn encode_or_groups(groups: &[CaveatGroup]) -> Bytes {
    let groups = groups
        .iter()
        .map(|group| {
            Token::Tuple(vec![Token::Array(
                group.caveats.iter().map(caveat_token).collect(),
            )])
        })
        .collect();
    Bytes::from(abi::encode(&[Token::Array(groups)]))
}

pub fn decode_or_groups(terms: &[u8]) -> Result<Vec<CaveatGroup>> {
    let caveat_type = ParamType::Tuple(vec![ParamType::Address, ParamType::Bytes, ParamType::Bytes]);
    let group_type = ParamType::Tuple(vec![ParamType::Array(Box::new(caveat_type))]);
    let mut tokens = abi::decode(&[ParamType::Array(Box::new(group_type))], terms)?;

    let Some(Token::Array(groups)) = tokens.pop() else {
        return Err(abi::Error::InvalidData.into());
    };

    groups
        .into_iter()
        .map(|group| -> Result<CaveatGroup> {
            let Token::Tuple(mut fields) = group else {
                return Err(abi::Error::InvalidData.into());
            };
            let Some(Token::Array(caveats)) = fields.pop() else {
                return Err(abi::Error::InvalidData.into());
            };
            let caveats = caveats
                .into_iter()
                .map(caveat_from_token)
                .collect::<Result<Vec<_>>>()?;
            Ok(CaveatGroup::new(caveats))
        })
        .collect()
}

fn caveat_token(caveat: &Caveat) -> Token {
    Token::Tuple(vec![
        Token::Address(caveat.enforcer),
        Token::Bytes(caveat.terms.to_vec()),
        Token::Bytes(caveat.args.to_vec()),
    ])
}

fn caveat_from_token(token: Token) -> Result<Caveat> {
    match token {
        Token::Tuple(fields) => match fields.as_slice() {
            [Token::Address(enforcer), Token::Bytes(terms), Token::Bytes(args)] => Ok(Caveat {
                enforcer: *enforcer,
                terms: Bytes::from(terms.clone()),
                args: Bytes::from(args.clone()),
            }),
            _ => Err(abi::Error::InvalidData.into()),
        },
        _ => Err(abi::Error::InvalidData.into()),
    }
}

pub(crate) fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

fn static_address(value: &str) -> Address {
    value.parse().expect("static enforcer address literal")
}
