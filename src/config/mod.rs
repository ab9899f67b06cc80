//! Configuration management for policyguard
//!
//! Supports loading configuration from:
//! - Environment variables (POLICYGUARD_*)
//! - Config file (config.toml)
//! - Command line (`--config <path>`)

use crate::attestation::ApprovalDomain;
use crate::crypto::parse_address;
use crate::errors::{PolicyGuardError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine configuration
    pub engine: EngineConfig,

    /// Policy source configuration
    pub policy: PolicyConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Enable policy enforcement
    pub enabled: bool,

    /// Chain attestations must be issued for
    pub chain_id: u64,

    /// Contract address the attestation domain is bound to
    pub verifying_contract: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chain_id: 1,
            verifying_contract: "0x0000000000000000000000000000000000000000".to_string(),
        }
    }
}

impl EngineConfig {
    /// Attestation domain for this chain and contract
    pub fn approval_domain(&self) -> Result<ApprovalDomain> {
        let contract = parse_address(&self.verifying_contract)?;
        Ok(ApprovalDomain::new(self.chain_id, contract))
    }
}

/// Policy source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Path to the policy file installed at startup
    pub policies_path: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policies_path: Some(PathBuf::from("./config/policies.json")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| PolicyGuardError::ConfigError(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        } else {
            // Try default locations
            builder = builder
                .add_source(config::File::with_name("config").required(false))
                .add_source(config::File::with_name("/etc/policyguard/config").required(false));
        }

        // Load from environment (POLICYGUARD_ENGINE__CHAIN_ID, etc.)
        builder = builder.add_source(
            config::Environment::with_prefix("POLICYGUARD")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| PolicyGuardError::ConfigError(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| PolicyGuardError::ConfigError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.chain_id == 0 {
            return Err(PolicyGuardError::ConfigError(
                "engine.chain_id must be non-zero".to_string(),
            ));
        }

        self.engine
            .approval_domain()
            .map_err(|e| PolicyGuardError::ConfigError(format!("engine.verifying_contract: {}", e)))?;

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(PolicyGuardError::ConfigError(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }

        if let Some(path) = &self.policy.policies_path {
            if !path.exists() {
                info!("Policy file does not exist, starting without policies: {:?}", path);
            }
        }

        Ok(())
    }
}
