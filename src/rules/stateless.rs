//! Tier 1 rules: pure predicates over the call parameters

use crate::errors::Result;
use crate::rules::codec::{MaxValueParams, SelectorListParams, TargetListParams};
use crate::rules::{CallContext, RuleEvaluator, RuleState, RuleType, Verdict};

/// Passes only for targets on the list. An empty list denies everything.
pub struct AllowTargets;

/// Passes for any target not on the list
pub struct DenyTargets;

/// Passes only for selectors on the list; plain transfers always pass
pub struct AllowSelectors;

/// Passes for any selector not on the list; plain transfers always pass
pub struct DenySelectors;

/// Caps the native value of a single call (inclusive)
pub struct MaxValue;

impl RuleEvaluator for AllowTargets {
    fn rule_type(&self) -> RuleType {
        RuleType::AllowTargets
    }

    fn evaluate(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        _state: Option<&RuleState>,
        _now: u64,
    ) -> Result<Verdict> {
        let list = TargetListParams::decode(params)?;
        Ok(Verdict::check(
            list.contains(&call.target),
            "Target address not in allowlist",
        ))
    }
}

impl RuleEvaluator for DenyTargets {
    fn rule_type(&self) -> RuleType {
        RuleType::DenyTargets
    }

    fn evaluate(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        _state: Option<&RuleState>,
        _now: u64,
    ) -> Result<Verdict> {
        let list = TargetListParams::decode(params)?;
        Ok(Verdict::check(
            !list.contains(&call.target),
            "Target address is denylisted",
        ))
    }
}

impl RuleEvaluator for AllowSelectors {
    fn rule_type(&self) -> RuleType {
        RuleType::AllowSelectors
    }

    fn evaluate(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        _state: Option<&RuleState>,
        _now: u64,
    ) -> Result<Verdict> {
        let list = SelectorListParams::decode(params)?;
        let Some(selector) = call.selector() else {
            return Ok(Verdict::pass());
        };
        Ok(Verdict::check(
            list.contains(&selector),
            "Function selector not in allowlist",
        ))
    }
}

impl RuleEvaluator for DenySelectors {
    fn rule_type(&self) -> RuleType {
        RuleType::DenySelectors
    }

    fn evaluate(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        _state: Option<&RuleState>,
        _now: u64,
    ) -> Result<Verdict> {
        let list = SelectorListParams::decode(params)?;
        let Some(selector) = call.selector() else {
            return Ok(Verdict::pass());
        };
        Ok(Verdict::check(
            !list.contains(&selector),
            "Function selector is denylisted",
        ))
    }
}

impl RuleEvaluator for MaxValue {
    fn rule_type(&self) -> RuleType {
        RuleType::MaxValue
    }

    fn evaluate(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        _state: Option<&RuleState>,
        _now: u64,
    ) -> Result<Verdict> {
        let limit = MaxValueParams::decode(params)?;
        Ok(Verdict::check(
            call.value <= limit.max_value,
            "ETH value exceeds maximum",
        ))
    }
}
