//! policyguard - dry-run a call against the configured policies
//!
//! Loads the configuration and the policy file, installs every policy, then
//! evaluates one proposed call and prints the detailed report as JSON. The
//! exit status is the gating decision: 0 allowed, 1 denied, 2 error.
//!
//! # Usage
//!
//! ```bash
//! policyguard [--config <path>] <account> <target> <value-wei> [calldata-hex] [attestation-hex]
//!
//! # Override the chain from the environment
//! POLICYGUARD_ENGINE__CHAIN_ID=8453 policyguard 0xa1.. 0x55.. 1000000000000000000
//! ```

use alloy_primitives::U256;
use policyguard::config::{Config, LoggingConfig};
use policyguard::crypto::parse_address;
use policyguard::errors::{PolicyGuardError, Result};
use policyguard::guard::{GuardedCall, Simulator};
use policyguard::policy::{PolicyEngine, PolicyFile};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: policyguard [--config <path>] <account> <target> <value-wei> [calldata-hex] [attestation-hex]";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let (config_path, positional) = match split_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };

    let config = match Config::load(config_path.as_deref()).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    init_logging(&config.logging);
    info!("Starting policyguard v{}", VERSION);

    match run(&config, &positional) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn run(config: &Config, positional: &[String]) -> Result<bool> {
    let call = parse_call(positional)?;

    let engine = Arc::new(PolicyEngine::from_config(&config.engine)?);
    if let Some(path) = &config.policy.policies_path {
        let file = PolicyFile::load(path)?;
        file.install(&engine)?;
        info!("Loaded policies from {:?}", path);
    }

    let simulator = Simulator::new(engine);
    let report = simulator.simulate(&call)?;
    let decision = simulator.decide(&call)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match decision.reason() {
        None => info!("Call allowed"),
        Some(reason) => info!("Call denied: {}", reason),
    }
    Ok(decision.is_allowed())
}

/// Separate `--config <path>` from the positional arguments
fn split_args(args: &[String]) -> Result<(Option<String>, Vec<String>)> {
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().ok_or_else(|| {
                PolicyGuardError::ConfigError("--config requires a path".to_string())
            })?;
            config_path = Some(path.clone());
        } else {
            positional.push(arg.clone());
        }
    }

    Ok((config_path, positional))
}

fn parse_call(positional: &[String]) -> Result<GuardedCall> {
    let [account, target, value, rest @ ..] = positional else {
        return Err(PolicyGuardError::MalformedInput(
            "expected <account> <target> <value-wei>".to_string(),
        ));
    };
    if rest.len() > 2 {
        return Err(PolicyGuardError::MalformedInput(
            "too many arguments".to_string(),
        ));
    }

    let value = U256::from_str_radix(value, 10)
        .map_err(|e| PolicyGuardError::MalformedInput(format!("value {}: {}", value, e)))?;
    let data = match rest.first() {
        Some(hex_data) => decode_hex(hex_data)?,
        None => vec![],
    };

    let mut call = GuardedCall::new(parse_address(account)?, parse_address(target)?, value, data);
    if let Some(attestation) = rest.get(1) {
        call = call.with_attestation(decode_hex(attestation)?);
    }
    Ok(call)
}

fn decode_hex(input: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(input.strip_prefix("0x").unwrap_or(input))?)
}

/// Initialize logging
///
/// Logs go to stderr; stdout carries the report.
fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let json = logging.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}
