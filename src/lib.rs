//! policyguard - transaction policy enforcement for delegated signers
//!
//! Before an account's outgoing call executes, an ordered list of rules
//! decides whether the `(target, value, calldata)` triple is permitted,
//! optionally backed by a signed off-chain attestation.

pub mod attestation;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod guard;
pub mod policy;
pub mod rules;

pub use errors::{PolicyGuardError, Result};
pub use guard::{AccountHook, DirectGuard, ExecutionGuard, GuardedCall, Simulator};
pub use policy::{Decision, EvaluationReport, Policy, PolicyEngine};
