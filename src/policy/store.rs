//! Per-account policy storage
//!
//! Each account owns at most one policy: its metadata, the ordered rule list,
//! and a parallel list of optional rule history indexed by rule position.
//! Replacing or removing a policy drops its history with it.

use crate::errors::{PolicyGuardError, Result};
use crate::rules::{OnChainRule, RuleParams, RuleState};
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Behaviour when a required attestation is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailMode {
    #[default]
    Closed,
    Open,
}

/// A policy as installed by its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Content locator of the full policy document (advisory)
    pub locator: B256,
    /// Attester whose signatures satisfy Tier 3; `None` disables Tier 3
    pub attester: Option<Address>,
    pub require_attestation: bool,
    pub fail_mode: FailMode,
    pub rules: Vec<OnChainRule>,
}

impl Policy {
    pub fn new(locator: B256, rules: Vec<OnChainRule>) -> Self {
        Self {
            locator,
            attester: None,
            require_attestation: false,
            fail_mode: FailMode::Closed,
            rules,
        }
    }

    pub fn with_attester(mut self, attester: Address, require: bool) -> Self {
        self.attester = Some(attester);
        self.require_attestation = require;
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Check the policy before it is stored
    ///
    /// A zero attester is treated as no attester. Parameters of known rule
    /// kinds must decode; unknown kinds are kept and deny at evaluation.
    pub fn validate(mut self) -> Result<Self> {
        if self.attester == Some(Address::ZERO) {
            self.attester = None;
        }

        if self.require_attestation && self.attester.is_none() {
            return Err(PolicyGuardError::ConfigurationError(
                "requireAttestation set without an attester".to_string(),
            ));
        }

        for (index, rule) in self.rules.iter().enumerate() {
            match rule.kind() {
                Some(kind) => {
                    RuleParams::decode(kind, &rule.params).map_err(|e| {
                        PolicyGuardError::MalformedInput(format!(
                            "rule {} ({}): {}",
                            index, kind, e
                        ))
                    })?;
                }
                None => warn!(
                    "Rule {} has unknown type {}; it will deny when enabled",
                    index, rule.rule_type
                ),
            }
        }

        Ok(self)
    }
}

/// Read-only summary returned by `get_policy`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    pub locator: B256,
    pub attester: Option<Address>,
    pub require_attestation: bool,
    pub fail_mode: FailMode,
    pub rule_count: usize,
    pub exists: bool,
}

/// Stored record for one account
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub policy: Policy,
    pub states: Vec<Option<RuleState>>,
}

impl AccountRecord {
    fn new(policy: Policy) -> Self {
        let states = vec![None; policy.rules.len()];
        Self { policy, states }
    }

    pub fn state(&self, index: usize) -> Option<&RuleState> {
        self.states.get(index).and_then(Option::as_ref)
    }

    fn view(&self) -> PolicyView {
        PolicyView {
            locator: self.policy.locator,
            attester: self.policy.attester,
            require_attestation: self.policy.require_attestation,
            fail_mode: self.policy.fail_mode,
            rule_count: self.policy.rules.len(),
            exists: true,
        }
    }
}

/// In-memory policy store
#[derive(Debug, Default)]
pub struct PolicyStore {
    accounts: RwLock<HashMap<Address, AccountRecord>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, HashMap<Address, AccountRecord>>> {
        self.accounts
            .read()
            .map_err(|_| PolicyGuardError::InternalError("policy store lock poisoned".to_string()))
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, HashMap<Address, AccountRecord>>> {
        self.accounts
            .write()
            .map_err(|_| PolicyGuardError::InternalError("policy store lock poisoned".to_string()))
    }

    /// Replace the owner's policy and clear its history
    pub fn put(&self, owner: Address, policy: Policy) -> Result<()> {
        let record = AccountRecord::new(policy);
        self.write_guard()?.insert(owner, record);
        Ok(())
    }

    /// Remove the owner's policy; returns whether one existed
    pub fn remove(&self, owner: &Address) -> Result<bool> {
        Ok(self.write_guard()?.remove(owner).is_some())
    }

    pub fn contains(&self, account: &Address) -> Result<bool> {
        Ok(self.read_guard()?.contains_key(account))
    }

    pub fn view(&self, account: &Address) -> Result<PolicyView> {
        Ok(self
            .read_guard()?
            .get(account)
            .map(AccountRecord::view)
            .unwrap_or_default())
    }

    pub fn rule(&self, account: &Address, index: usize) -> Result<Option<OnChainRule>> {
        Ok(self
            .read_guard()?
            .get(account)
            .and_then(|r| r.policy.rules.get(index).cloned()))
    }

    pub fn rule_state(&self, account: &Address, index: usize) -> Result<Option<RuleState>> {
        Ok(self
            .read_guard()?
            .get(account)
            .and_then(|r| r.state(index).cloned()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_guard()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Run `f` against one consistent snapshot of the account's record
    pub fn read<R>(
        &self,
        account: &Address,
        f: impl FnOnce(Option<&AccountRecord>) -> R,
    ) -> Result<R> {
        let accounts = self.read_guard()?;
        Ok(f(accounts.get(account)))
    }

    /// Run `f` with exclusive access to the account's record
    pub fn update<R>(
        &self,
        account: &Address,
        f: impl FnOnce(Option<&mut AccountRecord>) -> R,
    ) -> Result<R> {
        let mut accounts = self.write_guard()?;
        Ok(f(accounts.get_mut(account)))
    }
}
