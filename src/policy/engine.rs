//! Policy engine
//!
//! Evaluates proposed calls against the calling account's policy.
//!
//! # Lifecycle
//!
//! 1. `check` (gating) or `evaluate_detailed` (diagnostics) run the rules in
//!    order, then the attestation phase when the policy requires one. Neither
//!    touches rule history.
//! 2. The caller executes the call.
//! 3. `record_execution` advances history for the enabled stateful rules.
//!
//! An account without a policy is allowed everything.

use crate::attestation::{Attestation, AttestationFailure, AttestationVerifier};
use crate::config::EngineConfig;
use crate::errors::{PolicyGuardError, Result};
use crate::policy::clock::{Clock, SystemClock};
use crate::policy::store::{FailMode, Policy, PolicyStore, PolicyView};
use crate::rules::{
    evaluate_rule, evaluator_for, CallContext, OnChainRule, RuleState, Tier,
};
use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

const ATTESTATION_LABEL: &str = "Attestation";
const ATTESTATION_REQUIRED: &str = "Attestation required";
const ATTESTATION_WAIVED: &str = "Attestation not provided (fail-open)";
const ATTESTATION_INVALID: &str = "Invalid attestation";

/// Gating outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Allow => None,
            Decision::Denied(reason) => Some(reason.as_str()),
        }
    }
}

/// One line of a detailed evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleReport {
    /// Position in the policy; `None` for the attestation entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub label: String,
    pub tier: u8,
    pub passed: bool,
    pub reason: String,
}

/// Result of `evaluate_detailed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    pub passed: bool,
    pub rules: Vec<RuleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<RuleReport>,
}

impl EvaluationReport {
    fn allow_all() -> Self {
        Self {
            passed: true,
            rules: vec![],
            attestation: None,
        }
    }

    fn push(&mut self, entry: RuleReport) {
        self.passed &= entry.passed;
        self.rules.push(entry);
    }

    fn set_attestation(&mut self, entry: RuleReport) {
        self.passed &= entry.passed;
        self.attestation = Some(entry);
    }

    /// All entries in order, the attestation entry last
    pub fn entries(&self) -> impl Iterator<Item = &RuleReport> {
        self.rules.iter().chain(self.attestation.iter())
    }

    /// Flatten into `(passed, per-entry results, per-entry reasons)`
    pub fn into_parts(self) -> (bool, Vec<bool>, Vec<String>) {
        let passed = self.passed;
        let (results, reasons) = self
            .rules
            .into_iter()
            .chain(self.attestation)
            .map(|e| (e.passed, e.reason))
            .unzip();
        (passed, results, reasons)
    }
}

enum AttestationOutcome {
    Valid,
    Unbound(&'static str),
    Invalid(AttestationFailure),
}

/// Accounts with an evaluation or update in progress, and the thread
/// running it
#[derive(Default)]
struct InFlight {
    accounts: Mutex<HashMap<Address, ThreadId>>,
    released: Condvar,
}

struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    account: Address,
}

impl InFlight {
    /// Claim `account` for the current thread
    ///
    /// A nested claim from the same thread is a reentrant call and fails.
    /// Claims from other threads wait, so calls for one account are applied
    /// one at a time.
    fn enter(&self, account: Address) -> Result<InFlightGuard<'_>> {
        let me = thread::current().id();
        let mut accounts = self.accounts.lock().map_err(poisoned)?;
        loop {
            match accounts.get(&account) {
                Some(owner) if *owner == me => {
                    warn!("Rejected reentrant policy call for {}", account);
                    return Err(PolicyGuardError::ReentrantCall(account));
                }
                Some(_) => {
                    accounts = self.released.wait(accounts).map_err(poisoned)?;
                }
                None => {
                    accounts.insert(account, me);
                    return Ok(InFlightGuard {
                        in_flight: self,
                        account,
                    });
                }
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut accounts) = self.in_flight.accounts.lock() {
            accounts.remove(&self.account);
        }
        self.in_flight.released.notify_all();
    }
}

fn poisoned<T>(_: T) -> PolicyGuardError {
    PolicyGuardError::InternalError("in-flight lock poisoned".to_string())
}

/// Policy engine for evaluating guarded calls
pub struct PolicyEngine {
    /// Whether policy enforcement is enabled
    enabled: bool,
    store: PolicyStore,
    verifier: AttestationVerifier,
    clock: Arc<dyn Clock>,
    in_flight: InFlight,
}

impl PolicyEngine {
    /// Create a new policy engine
    pub fn new(verifier: AttestationVerifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: true,
            store: PolicyStore::new(),
            verifier,
            clock,
            in_flight: InFlight::default(),
        }
    }

    /// Create an engine on the wall clock from configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let domain = config.approval_domain()?;
        Ok(Self::new(AttestationVerifier::new(domain), Arc::new(SystemClock))
            .with_enabled(config.enabled))
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check if policy enforcement is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn verifier(&self) -> &AttestationVerifier {
        &self.verifier
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Install or wholesale replace the owner's policy
    ///
    /// The owner is the authenticated sender: an account can only ever write
    /// its own entry. Rule history for the previous policy is discarded.
    pub fn set_policy(&self, owner: Address, policy: Policy) -> Result<()> {
        let policy = policy.validate()?;
        let _guard = self.in_flight.enter(owner)?;

        info!(
            "Setting policy for {}: locator={}, rules={}, attester={:?}, require_attestation={}, fail_mode={:?}",
            owner,
            policy.locator,
            policy.rules.len(),
            policy.attester,
            policy.require_attestation,
            policy.fail_mode
        );
        self.store.put(owner, policy)
    }

    /// Remove the owner's policy and its history
    pub fn remove_policy(&self, owner: Address) -> Result<()> {
        let _guard = self.in_flight.enter(owner)?;
        if self.store.remove(&owner)? {
            info!("Removed policy for {}", owner);
        }
        Ok(())
    }

    pub fn get_policy(&self, account: Address) -> Result<PolicyView> {
        self.store.view(&account)
    }

    pub fn has_policy(&self, account: Address) -> Result<bool> {
        self.store.contains(&account)
    }

    pub fn get_rule(&self, account: Address, index: usize) -> Result<Option<OnChainRule>> {
        self.store.rule(&account, index)
    }

    /// Recorded history of the rule at `index`, if any
    pub fn rule_state(&self, account: Address, index: usize) -> Result<Option<RuleState>> {
        self.store.rule_state(&account, index)
    }

    /// Gating check as a plain boolean
    pub fn check_policy(
        &self,
        account: Address,
        target: Address,
        value: U256,
        data: &[u8],
        attestation: Option<&[u8]>,
    ) -> Result<bool> {
        Ok(self
            .check(account, target, value, data, attestation)?
            .is_allowed())
    }

    /// Gating check
    ///
    /// Stops at the first enabled rule that fails. Malformed attestation
    /// bytes are an error, not a denial.
    pub fn check(
        &self,
        account: Address,
        target: Address,
        value: U256,
        data: &[u8],
        attestation: Option<&[u8]>,
    ) -> Result<Decision> {
        if !self.enabled {
            return Ok(Decision::Allow);
        }

        let _guard = self.in_flight.enter(account)?;
        let now = self.clock.now();
        let call = CallContext::new(account, target, value, data);

        self.store.read(&account, |record| -> Result<Decision> {
            let Some(record) = record else {
                return Ok(Decision::Allow);
            };

            for (index, rule) in record.policy.rules.iter().enumerate() {
                if !rule.enabled {
                    continue;
                }
                let verdict = evaluate_rule(rule, &call, record.state(index), now);
                if !verdict.passed {
                    debug!(
                        "Policy denied call from {} to {}: rule {} ({}) {}",
                        account,
                        target,
                        index,
                        rule.label(),
                        verdict.reason
                    );
                    return Ok(Decision::Denied(verdict.reason));
                }
            }

            self.gate_attestation(&record.policy, &call, attestation, now)
        })?
    }

    fn gate_attestation(
        &self,
        policy: &Policy,
        call: &CallContext<'_>,
        attestation: Option<&[u8]>,
        now: u64,
    ) -> Result<Decision> {
        if !policy.require_attestation {
            return Ok(Decision::Allow);
        }

        let Some(bytes) = attestation.filter(|b| !b.is_empty()) else {
            return Ok(match policy.fail_mode {
                FailMode::Closed => {
                    debug!("Attestation missing for {}, failing closed", call.caller);
                    Decision::Denied(ATTESTATION_REQUIRED.to_string())
                }
                FailMode::Open => {
                    debug!("Attestation missing for {}, failing open", call.caller);
                    Decision::Allow
                }
            });
        };

        Ok(match self.check_attestation(policy, call, bytes, now)? {
            AttestationOutcome::Valid => Decision::Allow,
            AttestationOutcome::Unbound(reason) => Decision::Denied(reason.to_string()),
            AttestationOutcome::Invalid(failure) => {
                debug!("Attestation rejected for {}: {}", call.caller, failure);
                Decision::Denied(ATTESTATION_INVALID.to_string())
            }
        })
    }

    fn check_attestation(
        &self,
        policy: &Policy,
        call: &CallContext<'_>,
        bytes: &[u8],
        now: u64,
    ) -> Result<AttestationOutcome> {
        let attester = policy.attester.ok_or_else(|| {
            PolicyGuardError::ConfigurationError(
                "policy requires attestation but has no attester".to_string(),
            )
        })?;
        let attestation = Attestation::decode(bytes)?;

        if let Some(reason) = attestation.approval.binding_mismatch(call, policy.locator) {
            return Ok(AttestationOutcome::Unbound(reason));
        }

        Ok(
            match self.verifier.verify_detailed(
                &attestation.approval,
                &attestation.signature,
                attester,
                now,
            ) {
                Ok(()) => AttestationOutcome::Valid,
                Err(failure) => AttestationOutcome::Invalid(failure),
            },
        )
    }

    /// Evaluate every enabled rule without short-circuiting
    ///
    /// For simulation and diagnostics only; gate on `check`.
    pub fn evaluate_detailed(
        &self,
        account: Address,
        target: Address,
        value: U256,
        data: &[u8],
        attestation: Option<&[u8]>,
    ) -> Result<EvaluationReport> {
        if !self.enabled {
            return Ok(EvaluationReport::allow_all());
        }

        let _guard = self.in_flight.enter(account)?;
        let now = self.clock.now();
        let call = CallContext::new(account, target, value, data);

        self.store.read(&account, |record| -> Result<EvaluationReport> {
            let Some(record) = record else {
                return Ok(EvaluationReport::allow_all());
            };

            let mut report = EvaluationReport::allow_all();
            for (index, rule) in record.policy.rules.iter().enumerate() {
                if !rule.enabled {
                    continue;
                }
                let verdict = evaluate_rule(rule, &call, record.state(index), now);
                report.push(RuleReport {
                    index: Some(index),
                    label: rule.label(),
                    tier: rule.kind().map_or(Tier::Stateless, |k| k.tier()).number(),
                    passed: verdict.passed,
                    reason: verdict.reason,
                });
            }

            let policy = &record.policy;
            if policy.require_attestation {
                let (passed, reason) = match attestation.filter(|b| !b.is_empty()) {
                    None => match policy.fail_mode {
                        FailMode::Closed => (false, ATTESTATION_REQUIRED.to_string()),
                        FailMode::Open => (true, ATTESTATION_WAIVED.to_string()),
                    },
                    Some(bytes) => match self.check_attestation(policy, &call, bytes, now)? {
                        AttestationOutcome::Valid => (true, String::new()),
                        AttestationOutcome::Unbound(reason) => (false, reason.to_string()),
                        AttestationOutcome::Invalid(failure) => {
                            (false, failure.reason().to_string())
                        }
                    },
                };
                report.set_attestation(RuleReport {
                    index: None,
                    label: ATTESTATION_LABEL.to_string(),
                    tier: Tier::Attested.number(),
                    passed,
                    reason,
                });
            }

            Ok(report)
        })?
    }

    /// Advance history after the guarded call executed
    ///
    /// Does not re-run evaluation. Only enabled stateful rules record, in
    /// list order.
    pub fn record_execution(
        &self,
        account: Address,
        target: Address,
        value: U256,
        data: &[u8],
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let _guard = self.in_flight.enter(account)?;
        let now = self.clock.now();
        let call = CallContext::new(account, target, value, data);

        self.store.update(&account, |record| {
            let Some(record) = record else {
                return;
            };

            for (index, rule) in record.policy.rules.iter().enumerate() {
                if !rule.enabled {
                    continue;
                }
                let Some(kind) = rule.kind() else {
                    continue;
                };
                if kind.tier() != Tier::Stateful {
                    continue;
                }

                let Some(slot) = record.states.get_mut(index) else {
                    continue;
                };
                match evaluator_for(kind).record(&rule.params, &call, slot, now) {
                    Ok(()) => debug!("Recorded {} rule {} for {}", kind, index, account),
                    Err(e) => warn!("Could not record {} rule {} for {}: {}", kind, index, account, e),
                }
            }
        })
    }
}
