//! Execution guards
//!
//! Adapters that put the policy engine in front of an executor:
//! - `DirectGuard` for callers that execute calls themselves
//! - `AccountHook` for smart accounts with separate pre and post hooks
//! - `Simulator` for dry runs with no side effects
//!
//! Every guard follows the same order: check, execute, record. History only
//! advances after a call actually succeeded.

use crate::errors::{PolicyGuardError, Result};
use crate::policy::{Decision, EvaluationReport, PolicyEngine};
use alloy_primitives::{Address, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// A call proposed on behalf of an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedCall {
    pub account: Address,
    pub target: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub attestation: Option<Vec<u8>>,
}

impl GuardedCall {
    pub fn new(account: Address, target: Address, value: U256, data: Vec<u8>) -> Self {
        Self {
            account,
            target,
            value,
            data,
            attestation: None,
        }
    }

    pub fn with_attestation(mut self, attestation: Vec<u8>) -> Self {
        self.attestation = Some(attestation);
        self
    }

    /// Same account, target, value and calldata; the attestation is ignored
    pub fn same_call(&self, other: &GuardedCall) -> bool {
        self.account == other.account
            && self.target == other.target
            && self.value == other.value
            && self.data == other.data
    }
}

/// Pre and post execution hooks around a guarded call
pub trait ExecutionGuard: Send + Sync {
    /// Reject the call with `PolicyViolation` if policy denies it
    fn before_execution(&self, call: &GuardedCall) -> Result<()>;

    /// Report the outcome of a call that passed `before_execution`
    fn after_execution(&self, call: &GuardedCall, success: bool) -> Result<()>;

    /// Check, run `execute`, and report its outcome
    ///
    /// Once `execute` has run its result is returned as-is. A failure to
    /// record afterwards is logged, not surfaced in place of that result.
    fn execute<T>(
        &self,
        call: &GuardedCall,
        execute: impl FnOnce(&GuardedCall) -> Result<T>,
    ) -> Result<T>
    where
        Self: Sized,
    {
        self.before_execution(call)?;
        let outcome = execute(call);
        if let Err(e) = self.after_execution(call, outcome.is_ok()) {
            error!(
                "Call from {} to {} executed but was not recorded: {}",
                call.account, call.target, e
            );
        }
        outcome
    }
}

fn gate(engine: &PolicyEngine, call: &GuardedCall) -> Result<()> {
    let decision = engine.check(
        call.account,
        call.target,
        call.value,
        &call.data,
        call.attestation.as_deref(),
    )?;

    match decision {
        Decision::Allow => Ok(()),
        Decision::Denied(reason) => {
            info!(
                "Blocked call from {} to {}: {}",
                call.account, call.target, reason
            );
            Err(PolicyGuardError::PolicyViolation(reason))
        }
    }
}

fn record(engine: &PolicyEngine, call: &GuardedCall) -> Result<()> {
    engine.record_execution(call.account, call.target, call.value, &call.data)
}

/// Guard for callers that execute the call themselves
pub struct DirectGuard {
    engine: Arc<PolicyEngine>,
}

impl DirectGuard {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }
}

impl ExecutionGuard for DirectGuard {
    fn before_execution(&self, call: &GuardedCall) -> Result<()> {
        gate(&self.engine, call)
    }

    fn after_execution(&self, call: &GuardedCall, success: bool) -> Result<()> {
        if !success {
            debug!("Call from {} failed; nothing recorded", call.account);
            return Ok(());
        }
        record(&self.engine, call)
    }
}

/// Smart-account hook
///
/// The pre-hook checks the call and remembers it; the post-hook only records
/// when it reports success for that same call. One call per account may be
/// between the two hooks at a time.
pub struct AccountHook {
    engine: Arc<PolicyEngine>,
    pending: Mutex<HashMap<Address, GuardedCall>>,
}

impl AccountHook {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self {
            engine,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Address, GuardedCall>>> {
        self.pending
            .lock()
            .map_err(|_| PolicyGuardError::InternalError("hook state poisoned".to_string()))
    }

    /// Whether a pre-checked call is waiting for its post-hook
    pub fn is_pending(&self, account: Address) -> Result<bool> {
        Ok(self.pending()?.contains_key(&account))
    }
}

impl ExecutionGuard for AccountHook {
    fn before_execution(&self, call: &GuardedCall) -> Result<()> {
        if self.pending()?.contains_key(&call.account) {
            warn!("Pre-hook re-entered for {}", call.account);
            return Err(PolicyGuardError::ReentrantCall(call.account));
        }

        gate(&self.engine, call)?;

        let mut pending = self.pending()?;
        if pending.contains_key(&call.account) {
            return Err(PolicyGuardError::ReentrantCall(call.account));
        }
        pending.insert(call.account, call.clone());
        Ok(())
    }

    fn after_execution(&self, call: &GuardedCall, success: bool) -> Result<()> {
        let checked = self.pending()?.remove(&call.account).ok_or_else(|| {
            PolicyGuardError::PolicyViolation(format!(
                "no pre-checked call for {}",
                call.account
            ))
        })?;

        if !checked.same_call(call) {
            warn!(
                "Post-hook for {} does not match the pre-checked call",
                call.account
            );
            return Err(PolicyGuardError::PolicyViolation(
                "post-hook call differs from pre-checked call".to_string(),
            ));
        }

        if !success {
            debug!("Call from {} reverted; nothing recorded", call.account);
            return Ok(());
        }
        record(&self.engine, call)
    }
}

/// Dry-run evaluation with no side effects
pub struct Simulator {
    engine: Arc<PolicyEngine>,
}

impl Simulator {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }

    /// Every enabled rule's result for `call`
    pub fn simulate(&self, call: &GuardedCall) -> Result<EvaluationReport> {
        self.engine.evaluate_detailed(
            call.account,
            call.target,
            call.value,
            &call.data,
            call.attestation.as_deref(),
        )
    }

    /// The gating decision `call` would get right now
    pub fn decide(&self, call: &GuardedCall) -> Result<Decision> {
        self.engine.check(
            call.account,
            call.target,
            call.value,
            &call.data,
            call.attestation.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{ApprovalDomain, AttestationVerifier};
    use crate::policy::{ManualClock, Policy};
    use crate::rules::{
        CooldownParams, MaxValueParams, RuleParams, RuleState, SpendLimitParams, NATIVE_TOKEN,
    };
    use alloy_primitives::B256;

    const START: u64 = 1_700_000_000;

    fn account() -> Address {
        Address::repeat_byte(0xa1)
    }

    fn target() -> Address {
        Address::repeat_byte(0x55)
    }

    fn engine_with(rules: Vec<crate::rules::OnChainRule>) -> Arc<PolicyEngine> {
        let engine = PolicyEngine::new(
            AttestationVerifier::new(ApprovalDomain::new(1, Address::ZERO)),
            Arc::new(ManualClock::new(START)),
        );
        engine
            .set_policy(account(), Policy::new(B256::ZERO, rules))
            .unwrap();
        Arc::new(engine)
    }

    fn cooldown_engine() -> Arc<PolicyEngine> {
        engine_with(vec![
            RuleParams::Cooldown(CooldownParams::new(60)).into_rule(true)
        ])
    }

    fn call(value: u64) -> GuardedCall {
        GuardedCall::new(account(), target(), U256::from(value), vec![])
    }

    #[test]
    fn test_direct_guard_blocks_with_violation() {
        let engine = engine_with(vec![
            RuleParams::MaxValue(MaxValueParams::new(U256::from(10u64))).into_rule(true),
        ]);
        let guard = DirectGuard::new(engine);

        guard.before_execution(&call(10)).unwrap();
        let err = guard.before_execution(&call(11)).unwrap_err();
        assert!(matches!(
            err,
            PolicyGuardError::PolicyViolation(ref reason) if reason == "ETH value exceeds maximum"
        ));
    }

    #[test]
    fn test_direct_guard_records_only_on_success() {
        let engine = cooldown_engine();
        let guard = DirectGuard::new(engine.clone());

        let failed: Result<()> = guard.execute(&call(0), |_| {
            Err(PolicyGuardError::InternalError("reverted".to_string()))
        });
        assert!(failed.is_err());
        assert_eq!(engine.rule_state(account(), 0).unwrap(), None);

        let value = guard.execute(&call(0), |_| Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(
            engine.rule_state(account(), 0).unwrap(),
            Some(RuleState::Cooldown {
                last_execution: START
            })
        );

        // now inside the cooldown
        let mut ran = false;
        let blocked = guard.execute(&call(0), |_| {
            ran = true;
            Ok(())
        });
        assert!(matches!(blocked, Err(PolicyGuardError::PolicyViolation(_))));
        assert!(!ran);
    }

    /// Guard whose recording step always fails
    struct UnrecordedGuard;

    impl ExecutionGuard for UnrecordedGuard {
        fn before_execution(&self, _call: &GuardedCall) -> Result<()> {
            Ok(())
        }

        fn after_execution(&self, _call: &GuardedCall, _success: bool) -> Result<()> {
            Err(PolicyGuardError::InternalError("store unavailable".to_string()))
        }
    }

    #[test]
    fn test_execute_keeps_outcome_when_record_fails() {
        let guard = UnrecordedGuard;
        assert_eq!(guard.execute(&call(0), |_| Ok(42)).unwrap(), 42);

        let failed: Result<()> = guard.execute(&call(0), |_| {
            Err(PolicyGuardError::PolicyViolation("reverted".to_string()))
        });
        assert!(matches!(failed, Err(PolicyGuardError::PolicyViolation(_))));
    }

    #[test]
    fn test_hook_execute_records_same_call() {
        let engine = cooldown_engine();
        let hook = AccountHook::new(engine.clone());

        hook.execute(&call(0), |_| Ok(())).unwrap();
        assert!(!hook.is_pending(account()).unwrap());
        assert_eq!(
            engine.rule_state(account(), 0).unwrap(),
            Some(RuleState::Cooldown {
                last_execution: START
            })
        );
    }

    #[test]
    fn test_hook_records_after_successful_post_check() {
        let engine = engine_with(vec![RuleParams::SpendLimit(SpendLimitParams::new(
            NATIVE_TOKEN,
            U256::from(100u64),
            3_600,
        ))
        .into_rule(true)]);
        let hook = AccountHook::new(engine.clone());

        hook.before_execution(&call(60)).unwrap();
        assert!(hook.is_pending(account()).unwrap());
        assert_eq!(engine.rule_state(account(), 0).unwrap(), None);

        hook.after_execution(&call(60), true).unwrap();
        assert!(!hook.is_pending(account()).unwrap());
        assert_eq!(
            engine.rule_state(account(), 0).unwrap(),
            Some(RuleState::SpendLimit {
                spent: U256::from(60u64),
                window_start: START,
            })
        );

        assert!(hook.before_execution(&call(50)).is_err());
        assert!(!hook.is_pending(account()).unwrap());
    }

    #[test]
    fn test_hook_skips_record_on_revert() {
        let engine = cooldown_engine();
        let hook = AccountHook::new(engine.clone());

        hook.before_execution(&call(0)).unwrap();
        hook.after_execution(&call(0), false).unwrap();
        assert_eq!(engine.rule_state(account(), 0).unwrap(), None);
        hook.before_execution(&call(0)).unwrap();
    }

    #[test]
    fn test_hook_rejects_mismatched_post_check() {
        let engine = cooldown_engine();
        let hook = AccountHook::new(engine.clone());

        hook.before_execution(&call(0)).unwrap();
        let err = hook.after_execution(&call(1), true).unwrap_err();
        assert!(matches!(err, PolicyGuardError::PolicyViolation(_)));
        assert_eq!(engine.rule_state(account(), 0).unwrap(), None);

        // the post-hook without any pre-check
        assert!(hook.after_execution(&call(0), true).is_err());
    }

    #[test]
    fn test_hook_rejects_nested_pre_check() {
        let hook = AccountHook::new(cooldown_engine());
        hook.before_execution(&call(0)).unwrap();
        assert!(matches!(
            hook.before_execution(&call(0)),
            Err(PolicyGuardError::ReentrantCall(_))
        ));
    }

    #[test]
    fn test_simulator_has_no_side_effects() {
        let engine = cooldown_engine();
        let simulator = Simulator::new(engine.clone());

        for _ in 0..3 {
            let report = simulator.simulate(&call(0)).unwrap();
            assert!(report.passed);
            assert_eq!(simulator.decide(&call(0)).unwrap(), Decision::Allow);
        }
        assert_eq!(engine.rule_state(account(), 0).unwrap(), None);
    }

    #[test]
    fn test_same_call_ignores_attestation() {
        let plain = call(5);
        let attested = call(5).with_attestation(vec![1, 2, 3]);
        assert!(plain.same_call(&attested));
        assert!(!plain.same_call(&call(6)));
    }
}
