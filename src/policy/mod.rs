//! Policy enforcement for guarded calls
//!
//! This module provides:
//! - Per-account policy storage with rule history
//! - Policy engine for evaluation and recording
//! - Policy documents and the startup policy file

pub mod clock;
pub mod document;
pub mod engine;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{DocumentRule, PolicyDocument, PolicyEntry, PolicyFile, RuleDefinition};
pub use engine::{Decision, EvaluationReport, PolicyEngine, RuleReport};
pub use store::{FailMode, Policy, PolicyStore, PolicyView};
