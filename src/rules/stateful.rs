//! Tier 2 rules: predicates over per-account history
//!
//! `evaluate` reads history and never writes it, so repeated evaluation inside
//! one window is stable. `record` is the only place a window is advanced.

use crate::errors::Result;
use crate::rules::codec::{CooldownParams, SpendLimitParams};
use crate::rules::{CallContext, RuleEvaluator, RuleState, RuleType, Verdict, NATIVE_TOKEN};
use alloy_primitives::U256;

/// ERC-20 `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// ERC-20 `approve(address,uint256)`
pub const APPROVE_SELECTOR: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];

/// Cumulative spend cap per rolling window
pub struct SpendLimit;

/// Minimum delay between recorded executions
pub struct Cooldown;

/// Amount a call spends against a spend limit
///
/// Native-token limits count the call value. Token limits count the amount
/// argument of `transfer`/`approve` calls made to the token contract.
pub fn spend_amount(params: &SpendLimitParams, call: &CallContext<'_>) -> U256 {
    if params.token == NATIVE_TOKEN {
        return call.value;
    }
    if call.target != params.token {
        return U256::ZERO;
    }

    match call.selector() {
        Some(TRANSFER_SELECTOR) | Some(APPROVE_SELECTOR) if call.data.len() >= 68 => {
            U256::from_be_slice(&call.data[36..68])
        }
        _ => U256::ZERO,
    }
}

/// Spend already counted in the window that is live at `now`
fn spent_in_window(params: &SpendLimitParams, state: Option<&RuleState>, now: u64) -> U256 {
    match state {
        Some(RuleState::SpendLimit {
            spent,
            window_start,
        }) if now < window_start.saturating_add(params.window_seconds) => *spent,
        _ => U256::ZERO,
    }
}

impl RuleEvaluator for SpendLimit {
    fn rule_type(&self) -> RuleType {
        RuleType::SpendLimit
    }

    fn evaluate(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        state: Option<&RuleState>,
        now: u64,
    ) -> Result<Verdict> {
        let limit = SpendLimitParams::decode(params)?;
        let current = spent_in_window(&limit, state, now);
        let total = current.saturating_add(spend_amount(&limit, call));
        Ok(Verdict::check(
            total <= limit.max_amount,
            "Spend limit exceeded",
        ))
    }

    fn record(
        &self,
        params: &[u8],
        call: &CallContext<'_>,
        state: &mut Option<RuleState>,
        now: u64,
    ) -> Result<()> {
        let limit = SpendLimitParams::decode(params)?;
        let amount = spend_amount(&limit, call);

        let (mut spent, mut window_start) = match state {
            Some(RuleState::SpendLimit {
                spent,
                window_start,
            }) => (*spent, *window_start),
            _ => (U256::ZERO, 0),
        };

        if now >= window_start.saturating_add(limit.window_seconds) {
            spent = U256::ZERO;
            window_start = now;
        }

        *state = Some(RuleState::SpendLimit {
            spent: spent.saturating_add(amount),
            window_start,
        });
        Ok(())
    }
}

impl RuleEvaluator for Cooldown {
    fn rule_type(&self) -> RuleType {
        RuleType::Cooldown
    }

    fn evaluate(
        &self,
        params: &[u8],
        _call: &CallContext<'_>,
        state: Option<&RuleState>,
        now: u64,
    ) -> Result<Verdict> {
        let cooldown = CooldownParams::decode(params)?;
        let ready = match state {
            Some(RuleState::Cooldown { last_execution }) => {
                now >= last_execution.saturating_add(cooldown.cooldown_seconds)
            }
            _ => true,
        };
        Ok(Verdict::check(ready, "Cooldown period not elapsed"))
    }

    fn record(
        &self,
        params: &[u8],
        _call: &CallContext<'_>,
        state: &mut Option<RuleState>,
        now: u64,
    ) -> Result<()> {
        CooldownParams::decode(params)?;
        *state = Some(RuleState::Cooldown {
            last_execution: now,
        });
        Ok(())
    }
}
