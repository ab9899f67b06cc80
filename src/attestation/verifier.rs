//! Attestation verification
//!
//! Checks, in order: expiry, chain id, and that the signature over the
//! domain-separated approval digest recovers to the expected attester.

use crate::attestation::PolicyApproval;
use crate::crypto::{keccak256, recover_address, EthKeyPair, EthSignature};
use crate::errors::Result;
use alloy_primitives::{Address, U256};
use thiserror::Error;
use tracing::debug;

const DOMAIN_NAME: &str = "PolicyGuard";
const DOMAIN_VERSION: &str = "1";

const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

const APPROVAL_TYPE: &str = "PolicyApproval(address caller,address target,uint256 value,bytes32 calldataHash,uint256 expiry,bytes32 policyCID,uint256 chainId)";

/// Why an attestation failed verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationFailure {
    #[error("Attestation expired at {expiry} (now {now})")]
    Expired { expiry: u64, now: u64 },

    #[error("Attestation is for chain {actual}, expected {expected}")]
    WrongChain { expected: u64, actual: u64 },

    #[error("Attestation signature could not be recovered")]
    BadSignature,

    #[error("Attestation signed by {recovered}, expected {expected}")]
    SignerMismatch { expected: Address, recovered: Address },
}

impl AttestationFailure {
    /// Stable denial reason for reports
    pub fn reason(&self) -> &'static str {
        match self {
            AttestationFailure::Expired { .. } => "Attestation expired",
            AttestationFailure::WrongChain { .. } => "Attestation chain mismatch",
            AttestationFailure::BadSignature => "Attestation signature invalid",
            AttestationFailure::SignerMismatch { .. } => "Attestation signer mismatch",
        }
    }
}

/// EIP-712 style domain the approval digest is separated by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalDomain {
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl ApprovalDomain {
    pub fn new(chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            chain_id,
            verifying_contract,
        }
    }

    pub fn separator(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(5 * 32);
        buf.extend_from_slice(&keccak256(DOMAIN_TYPE.as_bytes()));
        buf.extend_from_slice(&keccak256(DOMAIN_NAME.as_bytes()));
        buf.extend_from_slice(&keccak256(DOMAIN_VERSION.as_bytes()));
        buf.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<32>());
        buf.extend_from_slice(self.verifying_contract.into_word().as_slice());
        keccak256(&buf)
    }

    /// Digest an attester signs for `approval`
    pub fn digest(&self, approval: &PolicyApproval) -> [u8; 32] {
        let mut buf = Vec::with_capacity(2 + 2 * 32);
        buf.extend_from_slice(&[0x19, 0x01]);
        buf.extend_from_slice(&self.separator());
        buf.extend_from_slice(&struct_hash(approval));
        keccak256(&buf)
    }
}

fn struct_hash(approval: &PolicyApproval) -> [u8; 32] {
    let mut buf = Vec::with_capacity(8 * 32);
    buf.extend_from_slice(&keccak256(APPROVAL_TYPE.as_bytes()));
    buf.extend_from_slice(approval.caller.into_word().as_slice());
    buf.extend_from_slice(approval.target.into_word().as_slice());
    buf.extend_from_slice(&approval.value.to_be_bytes::<32>());
    buf.extend_from_slice(approval.calldata_hash.as_slice());
    buf.extend_from_slice(&U256::from(approval.expiry).to_be_bytes::<32>());
    buf.extend_from_slice(approval.policy_locator.as_slice());
    buf.extend_from_slice(&U256::from(approval.chain_id).to_be_bytes::<32>());
    keccak256(&buf)
}

/// Verifies attestations for the chain the engine runs on
#[derive(Debug, Clone)]
pub struct AttestationVerifier {
    domain: ApprovalDomain,
}

impl AttestationVerifier {
    pub fn new(domain: ApprovalDomain) -> Self {
        Self { domain }
    }

    pub fn domain(&self) -> &ApprovalDomain {
        &self.domain
    }

    pub fn chain_id(&self) -> u64 {
        self.domain.chain_id
    }

    /// Gating check: any failure is simply "invalid"
    pub fn verify(
        &self,
        approval: &PolicyApproval,
        signature: &EthSignature,
        expected_signer: Address,
        now: u64,
    ) -> bool {
        self.verify_detailed(approval, signature, expected_signer, now)
            .is_ok()
    }

    /// Diagnostic check that reports which step failed
    pub fn verify_detailed(
        &self,
        approval: &PolicyApproval,
        signature: &EthSignature,
        expected_signer: Address,
        now: u64,
    ) -> std::result::Result<(), AttestationFailure> {
        if now > approval.expiry {
            return Err(AttestationFailure::Expired {
                expiry: approval.expiry,
                now,
            });
        }

        if approval.chain_id != self.domain.chain_id {
            return Err(AttestationFailure::WrongChain {
                expected: self.domain.chain_id,
                actual: approval.chain_id,
            });
        }

        let digest = self.domain.digest(approval);
        let recovered = recover_address(&digest, signature).map_err(|e| {
            debug!("Attestation recovery failed: {}", e);
            AttestationFailure::BadSignature
        })?;

        if recovered != expected_signer {
            return Err(AttestationFailure::SignerMismatch {
                expected: expected_signer,
                recovered,
            });
        }

        Ok(())
    }

    /// Sign an approval for this domain (attestation producers, dry runs)
    pub fn sign(&self, approval: &PolicyApproval, key: &EthKeyPair) -> Result<EthSignature> {
        key.sign_hash(&self.domain.digest(approval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::CallContext;
    use alloy_primitives::B256;

    const NOW: u64 = 1_700_000_000;

    fn verifier() -> AttestationVerifier {
        AttestationVerifier::new(ApprovalDomain::new(8453, Address::repeat_byte(0xcc)))
    }

    fn approval_for(target: Address) -> PolicyApproval {
        let call = CallContext::new(Address::repeat_byte(0xaa), target, U256::ZERO, &[]);
        PolicyApproval::for_call(&call, B256::repeat_byte(7), NOW + 300, 8453)
    }

    #[test]
    fn test_valid_attestation() {
        let verifier = verifier();
        let key = EthKeyPair::generate().unwrap();
        let approval = approval_for(Address::repeat_byte(1));
        let sig = verifier.sign(&approval, &key).unwrap();

        assert!(verifier.verify(&approval, &sig, key.address(), NOW));
        // expiry is inclusive
        assert!(verifier.verify(&approval, &sig, key.address(), NOW + 300));
    }

    #[test]
    fn test_expired_rejected_regardless_of_signature() {
        let verifier = verifier();
        let key = EthKeyPair::generate().unwrap();
        let approval = approval_for(Address::repeat_byte(1));
        let sig = verifier.sign(&approval, &key).unwrap();

        assert!(!verifier.verify(&approval, &sig, key.address(), NOW + 301));
        assert_eq!(
            verifier
                .verify_detailed(&approval, &sig, key.address(), NOW + 301)
                .unwrap_err()
                .reason(),
            "Attestation expired"
        );
    }

    #[test]
    fn test_wrong_chain() {
        let verifier = verifier();
        let key = EthKeyPair::generate().unwrap();
        let mut approval = approval_for(Address::repeat_byte(1));
        approval.chain_id = 1;
        let sig = verifier.sign(&approval, &key).unwrap();

        assert_eq!(
            verifier.verify_detailed(&approval, &sig, key.address(), NOW),
            Err(AttestationFailure::WrongChain {
                expected: 8453,
                actual: 1
            })
        );
    }

    #[test]
    fn test_signature_for_other_target_fails() {
        let verifier = verifier();
        let key = EthKeyPair::generate().unwrap();
        let signed = approval_for(Address::repeat_byte(0xa0));
        let sig = verifier.sign(&signed, &key).unwrap();

        // same signature presented with a different target
        let presented = approval_for(Address::repeat_byte(0xb0));
        assert!(!verifier.verify(&presented, &sig, key.address(), NOW));
    }

    #[test]
    fn test_wrong_signer() {
        let verifier = verifier();
        let key = EthKeyPair::generate().unwrap();
        let other = EthKeyPair::generate().unwrap();
        let approval = approval_for(Address::repeat_byte(1));
        let sig = verifier.sign(&approval, &other).unwrap();

        let err = verifier
            .verify_detailed(&approval, &sig, key.address(), NOW)
            .unwrap_err();
        assert_eq!(err.reason(), "Attestation signer mismatch");
    }

    #[test]
    fn test_domain_separates_contracts() {
        let approval = approval_for(Address::repeat_byte(1));
        let a = ApprovalDomain::new(8453, Address::repeat_byte(1));
        let b = ApprovalDomain::new(8453, Address::repeat_byte(2));
        assert_ne!(a.digest(&approval), b.digest(&approval));
    }

    #[test]
    fn test_garbage_signature() {
        let verifier = verifier();
        let approval = approval_for(Address::repeat_byte(1));
        let sig = EthSignature {
            r: [0u8; 32],
            s: [0u8; 32],
            v: 0,
        };
        assert_eq!(
            verifier.verify_detailed(&approval, &sig, Address::repeat_byte(9), NOW),
            Err(AttestationFailure::BadSignature)
        );
    }

    #[test]
    fn test_out_of_range_signature_is_invalid_not_fatal() {
        let verifier = verifier();
        let key = EthKeyPair::generate().unwrap();
        let approval = approval_for(Address::repeat_byte(1));

        // r above the curve order, bad recovery id
        for (r, v) in [([0xffu8; 32], 0u8), ([1u8; 32], 9u8)] {
            let sig = EthSignature { r, s: [1u8; 32], v };
            assert!(!verifier.verify(&approval, &sig, key.address(), NOW));
            assert_eq!(
                verifier.verify_detailed(&approval, &sig, key.address(), NOW),
                Err(AttestationFailure::BadSignature)
            );
        }
    }
}
