//! Off-chain attestations
//!
//! An attestation is a `PolicyApproval` signed by the policy's attester. It is
//! bound to one exact call (caller, target, value, calldata hash), to one
//! policy document (locator), to one chain, and it expires.
//!
//! Wire layout: seven 32-byte words followed by a 65-byte `r || s || v`
//! signature.
//!
//! | word | field |
//! |------|-------|
//! | 0 | caller (address, left padded) |
//! | 1 | target (address, left padded) |
//! | 2 | value (uint256) |
//! | 3 | calldata hash (bytes32) |
//! | 4 | expiry (uint256, unix seconds) |
//! | 5 | policy locator (bytes32) |
//! | 6 | chain id (uint256) |

pub mod verifier;

pub use verifier::{ApprovalDomain, AttestationFailure, AttestationVerifier};

use crate::crypto::{keccak256, EthSignature};
use crate::errors::{PolicyGuardError, Result};
use crate::rules::CallContext;
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

const WORD: usize = 32;
const APPROVAL_WORDS: usize = 7;
const SIGNATURE_LEN: usize = 65;

/// Encoded attestation length in bytes
pub const ATTESTATION_LEN: usize = APPROVAL_WORDS * WORD + SIGNATURE_LEN;

/// Off-chain approval of a single call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyApproval {
    pub caller: Address,
    pub target: Address,
    pub value: U256,
    pub calldata_hash: B256,
    pub expiry: u64,
    pub policy_locator: B256,
    pub chain_id: u64,
}

impl PolicyApproval {
    /// Build an approval covering exactly this call
    pub fn for_call(
        call: &CallContext<'_>,
        policy_locator: B256,
        expiry: u64,
        chain_id: u64,
    ) -> Self {
        Self {
            caller: call.caller,
            target: call.target,
            value: call.value,
            calldata_hash: B256::from(keccak256(call.data)),
            expiry,
            policy_locator,
            chain_id,
        }
    }

    /// First call field that does not match, as a denial reason
    ///
    /// Checked before any signature work so a mismatched approval is rejected
    /// without paying for recovery.
    pub fn binding_mismatch(
        &self,
        call: &CallContext<'_>,
        policy_locator: B256,
    ) -> Option<&'static str> {
        if self.caller != call.caller {
            return Some("Attestation caller mismatch");
        }
        if self.target != call.target {
            return Some("Attestation target mismatch");
        }
        if self.value != call.value {
            return Some("Attestation value mismatch");
        }
        if self.calldata_hash != B256::from(keccak256(call.data)) {
            return Some("Attestation calldata mismatch");
        }
        if self.policy_locator != policy_locator {
            return Some("Attestation policy mismatch");
        }
        None
    }

    fn encode_words(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(APPROVAL_WORDS * WORD);
        out.extend_from_slice(self.caller.into_word().as_slice());
        out.extend_from_slice(self.target.into_word().as_slice());
        out.extend_from_slice(&self.value.to_be_bytes::<WORD>());
        out.extend_from_slice(self.calldata_hash.as_slice());
        out.extend_from_slice(&U256::from(self.expiry).to_be_bytes::<WORD>());
        out.extend_from_slice(self.policy_locator.as_slice());
        out.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<WORD>());
        out
    }

    fn decode_words(data: &[u8]) -> Result<Self> {
        let words: Vec<&[u8]> = data.chunks_exact(WORD).collect();
        if words.len() != APPROVAL_WORDS {
            return Err(PolicyGuardError::MalformedInput(format!(
                "Expected {} approval words, got {}",
                APPROVAL_WORDS,
                words.len()
            )));
        }

        Ok(Self {
            caller: word_address(words[0], "caller")?,
            target: word_address(words[1], "target")?,
            value: U256::from_be_slice(words[2]),
            calldata_hash: B256::from_slice(words[3]),
            expiry: word_u64(words[4], "expiry")?,
            policy_locator: B256::from_slice(words[5]),
            chain_id: word_u64(words[6], "chain id")?,
        })
    }
}

/// A signed approval as carried alongside a guarded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub approval: PolicyApproval,
    pub signature: EthSignature,
}

impl Attestation {
    pub fn new(approval: PolicyApproval, signature: EthSignature) -> Self {
        Self {
            approval,
            signature,
        }
    }

    /// Decode attestation bytes
    ///
    /// Truncated or padded input is a `MalformedInput` error, which callers
    /// must keep distinct from an attestation that decodes but fails
    /// verification.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != ATTESTATION_LEN {
            return Err(PolicyGuardError::MalformedInput(format!(
                "Attestation must be {} bytes, got {}",
                ATTESTATION_LEN,
                data.len()
            )));
        }

        let split = APPROVAL_WORDS * WORD;
        let approval = PolicyApproval::decode_words(&data[..split])?;
        let signature = EthSignature::from_bytes(&data[split..])?;
        Ok(Self {
            approval,
            signature,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.approval.encode_words();
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }
}

fn word_address(word: &[u8], field: &str) -> Result<Address> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(PolicyGuardError::MalformedInput(format!(
            "Attestation {} has dirty address padding",
            field
        )));
    }
    Ok(Address::from_slice(&word[12..]))
}

fn word_u64(word: &[u8], field: &str) -> Result<u64> {
    u64::try_from(U256::from_be_slice(word)).map_err(|_| {
        PolicyGuardError::MalformedInput(format!("Attestation {} exceeds u64", field))
    })
}
