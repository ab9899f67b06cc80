//! Policy rules
//!
//! This module provides:
//! - The stored rule model (`OnChainRule`) and its type tags
//! - Typed parameter codecs for every rule kind
//! - Stateless (Tier 1) and stateful (Tier 2) evaluators
//! - The dispatch table mapping a rule type to its shared evaluator

pub mod codec;
pub mod stateful;
pub mod stateless;

pub use codec::{
    CooldownParams, MaxValueParams, RuleParams, SelectorListParams, SpendLimitParams,
    TargetListParams,
};

use crate::errors::Result;
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token marker meaning "the native currency" in spend limits
pub const NATIVE_TOKEN: Address = Address::ZERO;

/// Reason reported for rules the engine cannot interpret
pub const UNKNOWN_RULE_REASON: &str = "unknown rule type";

/// Known rule kinds and their stored tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    AllowTargets,
    DenyTargets,
    AllowSelectors,
    DenySelectors,
    MaxValue,
    SpendLimit,
    Cooldown,
}

impl RuleType {
    pub const ALL: [RuleType; 7] = [
        RuleType::AllowTargets,
        RuleType::DenyTargets,
        RuleType::AllowSelectors,
        RuleType::DenySelectors,
        RuleType::MaxValue,
        RuleType::SpendLimit,
        RuleType::Cooldown,
    ];

    pub fn tag(self) -> u8 {
        match self {
            RuleType::AllowTargets => 0,
            RuleType::DenyTargets => 1,
            RuleType::AllowSelectors => 2,
            RuleType::DenySelectors => 3,
            RuleType::MaxValue => 4,
            RuleType::SpendLimit => 5,
            RuleType::Cooldown => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::AllowTargets => "AllowTargets",
            RuleType::DenyTargets => "DenyTargets",
            RuleType::AllowSelectors => "AllowSelectors",
            RuleType::DenySelectors => "DenySelectors",
            RuleType::MaxValue => "MaxValue",
            RuleType::SpendLimit => "SpendLimit",
            RuleType::Cooldown => "Cooldown",
        }
    }

    pub fn tier(self) -> Tier {
        match self {
            RuleType::SpendLimit | RuleType::Cooldown => Tier::Stateful,
            _ => Tier::Stateless,
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluation tier of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    /// Pure predicate over the call parameters
    Stateless = 1,
    /// Predicate over per-account history
    Stateful = 2,
    /// Off-chain predicate, seen only as a signed attestation
    Attested = 3,
}

impl Tier {
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// A rule as stored in a policy
///
/// The raw tag is kept so that rules of a type this build does not know
/// survive storage and deny at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainRule {
    pub rule_type: u8,
    #[serde(with = "hex_bytes")]
    pub params: Vec<u8>,
    pub enabled: bool,
}

impl OnChainRule {
    pub fn new(rule_type: RuleType, params: Vec<u8>) -> Self {
        Self {
            rule_type: rule_type.tag(),
            params,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn kind(&self) -> Option<RuleType> {
        RuleType::from_tag(self.rule_type)
    }

    /// Human-readable label for reports
    pub fn label(&self) -> String {
        match self.kind() {
            Some(kind) => kind.as_str().to_string(),
            None => format!("Unknown({})", self.rule_type),
        }
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self.kind().map(RuleType::tier), Some(Tier::Stateful))
    }
}

/// The call under evaluation
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    /// Account issuing the call (the policy owner)
    pub caller: Address,
    pub target: Address,
    pub value: U256,
    pub data: &'a [u8],
}

impl<'a> CallContext<'a> {
    pub fn new(caller: Address, target: Address, value: U256, data: &'a [u8]) -> Self {
        Self {
            caller,
            target,
            value,
            data,
        }
    }

    /// First four bytes of calldata, if present
    pub fn selector(&self) -> Option<[u8; 4]> {
        if self.data.len() < 4 {
            return None;
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&self.data[..4]);
        Some(selector)
    }
}

/// Outcome of a single rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            passed: false,
            reason: reason.to_string(),
        }
    }

    pub fn check(passed: bool, reason: &str) -> Self {
        if passed {
            Self::pass()
        } else {
            Self::deny(reason)
        }
    }
}

/// History kept for a stateful rule, keyed by (account, rule position)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleState {
    #[serde(rename_all = "camelCase")]
    SpendLimit { spent: U256, window_start: u64 },
    #[serde(rename_all = "camelCase")]
    Cooldown { last_execution: u64 },
}

/// Evaluation contract shared by every rule kind
///
/// `evaluate` must never mutate anything; only `record` advances history, and
/// only after the guarded call actually executed.
pub trait RuleEvaluator: Send + Sync {
    fn rule_type(&self) -> RuleType;

    fn evaluate(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        state: Option<&RuleState>,
        now: u64,
    ) -> Result<Verdict>;

    fn record(
        &self,
        _params: &[u8],
        _call: &CallContext<'_>,
        _state: &mut Option<RuleState>,
        _now: u64,
    ) -> Result<()> {
        Ok(())
    }
}

static ALLOW_TARGETS: stateless::AllowTargets = stateless::AllowTargets;
static DENY_TARGETS: stateless::DenyTargets = stateless::DenyTargets;
static ALLOW_SELECTORS: stateless::AllowSelectors = stateless::AllowSelectors;
static DENY_SELECTORS: stateless::DenySelectors = stateless::DenySelectors;
static MAX_VALUE: stateless::MaxValue = stateless::MaxValue;
static SPEND_LIMIT: stateful::SpendLimit = stateful::SpendLimit;
static COOLDOWN: stateful::Cooldown = stateful::Cooldown;

/// Shared evaluator for a rule type
pub fn evaluator_for(rule_type: RuleType) -> &'static dyn RuleEvaluator {
    match rule_type {
        RuleType::AllowTargets => &ALLOW_TARGETS,
        RuleType::DenyTargets => &DENY_TARGETS,
        RuleType::AllowSelectors => &ALLOW_SELECTORS,
        RuleType::DenySelectors => &DENY_SELECTORS,
        RuleType::MaxValue => &MAX_VALUE,
        RuleType::SpendLimit => &SPEND_LIMIT,
        RuleType::Cooldown => &COOLDOWN,
    }
}

/// Evaluate a stored rule, collapsing unknown tags and undecodable
/// parameters into a denial
pub fn evaluate_rule(
    rule: &OnChainRule,
    call: &CallContext<'_>,
    state: Option<&RuleState>,
    now: u64,
) -> Verdict {
    let Some(kind) = rule.kind() else {
        return Verdict::deny(UNKNOWN_RULE_REASON);
    };

    match evaluator_for(kind).evaluate(&rule.params, call, state, now) {
        Ok(verdict) => verdict,
        Err(e) => {
            tracing::warn!("Stored {} rule failed to decode: {}", kind, e);
            Verdict::deny(UNKNOWN_RULE_REASON)
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}
