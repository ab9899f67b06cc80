//! Policy documents
//!
//! The authoring format for policies: JSON with naturally typed rule
//! parameters. A document compiles into the encoded on-chain rule list and
//! hashes to the locator that attestations bind to.
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "id": "treasury-bot",
//!   "createdAt": "2024-05-01T00:00:00Z",
//!   "failMode": "CLOSED",
//!   "rules": {
//!     "onChain": [
//!       { "type": "allowTargets", "targets": ["0x5555555555555555555555555555555555555555"] },
//!       { "type": "maxValue", "maxValue": "1000000000000000000" }
//!     ],
//!     "offChain": []
//!   }
//! }
//! ```

use crate::crypto::keccak256;
use crate::errors::{PolicyGuardError, Result};
use crate::policy::engine::PolicyEngine;
use crate::policy::store::{FailMode, Policy};
use crate::rules::codec::MAX_LIST_ENTRIES;
use crate::rules::{
    CooldownParams, MaxValueParams, OnChainRule, RuleParams, SelectorListParams,
    SpendLimitParams, TargetListParams,
};
use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// One on-chain rule with its typed parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RuleDefinition {
    AllowTargets {
        targets: Vec<Address>,
    },
    DenyTargets {
        targets: Vec<Address>,
    },
    AllowSelectors {
        #[serde(with = "selector_list")]
        selectors: Vec<[u8; 4]>,
    },
    DenySelectors {
        #[serde(with = "selector_list")]
        selectors: Vec<[u8; 4]>,
    },
    MaxValue {
        #[serde(with = "decimal")]
        max_value: U256,
    },
    SpendLimit {
        token: Address,
        #[serde(with = "decimal")]
        max_amount: U256,
        window_seconds: u64,
    },
    Cooldown {
        cooldown_seconds: u64,
    },
}

impl RuleDefinition {
    fn to_params(&self) -> Result<RuleParams> {
        Ok(match self {
            RuleDefinition::AllowTargets { targets } => {
                RuleParams::AllowTargets(TargetListParams::new(bounded(targets)?))
            }
            RuleDefinition::DenyTargets { targets } => {
                RuleParams::DenyTargets(TargetListParams::new(bounded(targets)?))
            }
            RuleDefinition::AllowSelectors { selectors } => {
                RuleParams::AllowSelectors(SelectorListParams::new(bounded(selectors)?))
            }
            RuleDefinition::DenySelectors { selectors } => {
                RuleParams::DenySelectors(SelectorListParams::new(bounded(selectors)?))
            }
            RuleDefinition::MaxValue { max_value } => {
                RuleParams::MaxValue(MaxValueParams::new(*max_value))
            }
            RuleDefinition::SpendLimit {
                token,
                max_amount,
                window_seconds,
            } => RuleParams::SpendLimit(SpendLimitParams::new(
                *token,
                *max_amount,
                *window_seconds,
            )),
            RuleDefinition::Cooldown { cooldown_seconds } => {
                RuleParams::Cooldown(CooldownParams::new(*cooldown_seconds))
            }
        })
    }
}

fn bounded<T: Clone>(entries: &[T]) -> Result<Vec<T>> {
    if entries.len() > MAX_LIST_ENTRIES {
        return Err(PolicyGuardError::MalformedInput(format!(
            "List has {} entries, at most {} allowed",
            entries.len(),
            MAX_LIST_ENTRIES
        )));
    }
    Ok(entries.to_vec())
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRule {
    #[serde(flatten)]
    pub definition: RuleDefinition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl From<RuleDefinition> for DocumentRule {
    fn from(definition: RuleDefinition) -> Self {
        Self {
            definition,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRules {
    #[serde(default)]
    pub on_chain: Vec<DocumentRule>,
    /// Rules evaluated by the attestation network; carried as-is
    #[serde(default)]
    pub off_chain: Vec<serde_json::Value>,
}

/// A full policy document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub version: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub fail_mode: FailMode,
    #[serde(default)]
    pub rules: DocumentRules,
}

impl PolicyDocument {
    pub fn new(id: impl Into<String>, on_chain: Vec<DocumentRule>) -> Self {
        Self {
            version: "1.0".to_string(),
            id: id.into(),
            created_at: Utc::now(),
            fail_mode: FailMode::Closed,
            rules: DocumentRules {
                on_chain,
                off_chain: vec![],
            },
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encode the on-chain rules in document order
    pub fn compile(&self) -> Result<Vec<OnChainRule>> {
        self.rules
            .on_chain
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let params = rule.definition.to_params().map_err(|e| {
                    PolicyGuardError::MalformedInput(format!("onChain[{}]: {}", index, e))
                })?;
                Ok(params.into_rule(rule.enabled))
            })
            .collect()
    }

    /// Content locator: keccak256 of the document's JSON encoding
    pub fn locator(&self) -> Result<B256> {
        let bytes = serde_json::to_vec(self)?;
        Ok(B256::from(keccak256(&bytes)))
    }
}

/// A policy document assigned to an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEntry {
    pub account: Address,
    #[serde(default)]
    pub attester: Option<Address>,
    #[serde(default)]
    pub require_attestation: bool,
    pub document: PolicyDocument,
}

impl PolicyEntry {
    pub fn to_policy(&self) -> Result<Policy> {
        Ok(Policy {
            locator: self.document.locator()?,
            attester: self.attester,
            require_attestation: self.require_attestation,
            fail_mode: self.document.fail_mode,
            rules: self.document.compile()?,
        })
    }
}

/// Policies loaded at startup
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
}

impl PolicyFile {
    /// Load from file; a missing file is an empty set
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| PolicyGuardError::ConfigError(e.to_string()))
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Install every entry as its account's policy
    ///
    /// All entries are compiled and validated first; if any is rejected
    /// nothing is installed.
    pub fn install(&self, engine: &PolicyEngine) -> Result<usize> {
        let mut compiled = Vec::with_capacity(self.policies.len());
        for (index, entry) in self.policies.iter().enumerate() {
            let policy = entry.to_policy().and_then(Policy::validate).map_err(|e| {
                warn!("Policy entry {} for {} rejected: {}", index, entry.account, e);
                e
            })?;
            compiled.push((entry.account, policy));
        }

        for (account, policy) in compiled {
            engine.set_policy(account, policy)?;
        }
        info!("Installed {} policies", self.policies.len());
        Ok(self.policies.len())
    }
}

mod selector_list {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(selectors: &[[u8; 4]], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(selectors.iter().map(|s| format!("0x{}", hex::encode(s))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<[u8; 4]>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|raw| parse(raw).map_err(D::Error::custom))
            .collect()
    }

    fn parse(raw: &str) -> Result<[u8; 4], String> {
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(digits).map_err(|e| format!("selector {}: {}", raw, e))?;
        <[u8; 4]>::try_from(bytes.as_slice())
            .map_err(|_| format!("selector {} is not 4 bytes", raw))
    }
}

/// Amounts as decimal strings, so values beyond 2^53 survive JSON tooling
mod decimal {
    use alloy_primitives::U256;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_str_radix(&raw, 10)
            .map_err(|e| D::Error::custom(format!("amount {}: {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{ApprovalDomain, AttestationVerifier};
    use crate::policy::clock::ManualClock;
    use crate::policy::engine::Decision;
    use crate::rules::RuleType;
    use std::sync::Arc;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "version": "1.0",
        "id": "treasury-bot",
        "createdAt": "2024-05-01T00:00:00Z",
        "failMode": "OPEN",
        "rules": {
            "onChain": [
                { "type": "allowTargets", "targets": ["0x5555555555555555555555555555555555555555"] },
                { "type": "denySelectors", "selectors": ["0x095ea7b3"] },
                { "type": "maxValue", "maxValue": "1000000000000000000" },
                { "type": "spendLimit", "token": "0x0000000000000000000000000000000000000000",
                  "maxAmount": "5000000000000000000", "windowSeconds": 86400 },
                { "type": "cooldown", "cooldownSeconds": 60, "enabled": false }
            ],
            "offChain": [ { "type": "riskScore", "max": 40 } ]
        }
    }"#;

    fn one_eth() -> U256 {
        U256::from(1_000_000_000_000_000_000u64)
    }

    #[test]
    fn test_parse_document() {
        let doc = PolicyDocument::from_json(SAMPLE).unwrap();
        assert_eq!(doc.id, "treasury-bot");
        assert_eq!(doc.fail_mode, FailMode::Open);
        assert_eq!(doc.rules.on_chain.len(), 5);
        assert_eq!(doc.rules.off_chain.len(), 1);
        assert!(doc.rules.on_chain[0].enabled);
        assert!(!doc.rules.on_chain[4].enabled);
        assert_eq!(
            doc.rules.on_chain[1].definition,
            RuleDefinition::DenySelectors {
                selectors: vec![[0x09, 0x5e, 0xa7, 0xb3]]
            }
        );
        assert_eq!(
            doc.rules.on_chain[2].definition,
            RuleDefinition::MaxValue {
                max_value: one_eth()
            }
        );
    }

    #[test]
    fn test_compile_preserves_order_and_flags() {
        let doc = PolicyDocument::from_json(SAMPLE).unwrap();
        let rules = doc.compile().unwrap();

        let kinds: Vec<_> = rules.iter().map(|r| r.kind().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                RuleType::AllowTargets,
                RuleType::DenySelectors,
                RuleType::MaxValue,
                RuleType::SpendLimit,
                RuleType::Cooldown,
            ]
        );
        assert!(!rules[4].enabled);
        assert_eq!(
            RuleParams::decode(RuleType::MaxValue, &rules[2].params).unwrap(),
            RuleParams::MaxValue(MaxValueParams::new(one_eth()))
        );
    }

    #[test]
    fn test_locator_tracks_content() {
        let doc = PolicyDocument::from_json(SAMPLE).unwrap();
        let again = PolicyDocument::from_json(SAMPLE).unwrap();
        assert_eq!(doc.locator().unwrap(), again.locator().unwrap());

        let mut changed = doc.clone();
        changed.rules.on_chain[2].enabled = false;
        assert_ne!(doc.locator().unwrap(), changed.locator().unwrap());
    }

    #[test]
    fn test_bad_parameters_rejected() {
        let bad_selector = SAMPLE.replace("0x095ea7b3", "0x095ea7");
        assert!(PolicyDocument::from_json(&bad_selector).is_err());

        let bad_amount = SAMPLE.replace("\"1000000000000000000\"", "\"1e18\"");
        assert!(PolicyDocument::from_json(&bad_amount).is_err());

        let unknown_type = SAMPLE.replace("\"cooldown\"", "\"velocity\"");
        assert!(PolicyDocument::from_json(&unknown_type).is_err());
    }

    #[test]
    fn test_compile_rejects_oversized_list() {
        let targets = vec![Address::repeat_byte(1); MAX_LIST_ENTRIES + 1];
        let doc = PolicyDocument::new(
            "too-many",
            vec![RuleDefinition::AllowTargets { targets }.into()],
        );
        assert!(matches!(
            doc.compile(),
            Err(PolicyGuardError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_serialize_uses_readable_params() {
        let doc = PolicyDocument::new(
            "readable",
            vec![
                RuleDefinition::AllowSelectors {
                    selectors: vec![[0xa9, 0x05, 0x9c, 0xbb]],
                }
                .into(),
                RuleDefinition::MaxValue {
                    max_value: one_eth(),
                }
                .into(),
            ],
        );
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"allowSelectors\""));
        assert!(json.contains("\"0xa9059cbb\""));
        assert!(json.contains("\"maxValue\":\"1000000000000000000\""));
    }

    #[test]
    fn test_policy_file_roundtrip_and_install() {
        let account = Address::repeat_byte(0xa1);
        let file = PolicyFile {
            policies: vec![PolicyEntry {
                account,
                attester: None,
                require_attestation: false,
                document: PolicyDocument::from_json(SAMPLE).unwrap(),
            }],
        };

        let dir = tempdir().unwrap();
        let path = dir.path().join("policies.json");
        file.save(&path).unwrap();
        let loaded = PolicyFile::load(&path).unwrap();
        assert_eq!(loaded, file);

        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let engine = PolicyEngine::new(
            AttestationVerifier::new(ApprovalDomain::new(1, Address::ZERO)),
            clock,
        );
        assert_eq!(loaded.install(&engine).unwrap(), 1);

        let view = engine.get_policy(account).unwrap();
        assert_eq!(view.rule_count, 5);
        assert_eq!(view.fail_mode, FailMode::Open);
        assert_eq!(view.locator, file.policies[0].document.locator().unwrap());

        let uniswap = Address::repeat_byte(0x55);
        assert_eq!(
            engine
                .check(account, uniswap, one_eth() * U256::from(2u64), &[], None)
                .unwrap(),
            Decision::Denied("ETH value exceeds maximum".to_string())
        );
        assert_eq!(
            engine
                .check(account, uniswap, U256::ZERO, &[0x09, 0x5e, 0xa7, 0xb3], None)
                .unwrap(),
            Decision::Denied("Function selector is denylisted".to_string())
        );
    }

    #[test]
    fn test_install_is_all_or_nothing() {
        let first = Address::repeat_byte(0xa1);
        let second = Address::repeat_byte(0xa2);
        let document = PolicyDocument::from_json(SAMPLE).unwrap();
        let file = PolicyFile {
            policies: vec![
                PolicyEntry {
                    account: first,
                    attester: None,
                    require_attestation: false,
                    document: document.clone(),
                },
                PolicyEntry {
                    account: second,
                    attester: None,
                    require_attestation: true,
                    document,
                },
            ],
        };

        let engine = PolicyEngine::new(
            AttestationVerifier::new(ApprovalDomain::new(1, Address::ZERO)),
            Arc::new(ManualClock::new(1_700_000_000)),
        );
        assert!(matches!(
            file.install(&engine),
            Err(PolicyGuardError::ConfigurationError(_))
        ));
        assert!(!engine.has_policy(first).unwrap());
        assert!(!engine.has_policy(second).unwrap());
    }

    #[test]
    fn test_missing_policy_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert_eq!(PolicyFile::load(&path).unwrap(), PolicyFile::default());
    }
}
