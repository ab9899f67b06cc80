//! Ethereum cryptographic utilities
//!
//! Provides:
//! - Keccak-256 hashing
//! - secp256k1 prehash signing (attestation producers, simulation)
//! - Signer recovery from 65-byte `r || s || v` signatures
//! - Address derivation and parsing

use crate::errors::{PolicyGuardError, Result};
use alloy_primitives::Address;
use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use sha3::{Digest, Keccak256};

/// secp256k1 key pair used to sign policy approvals
///
/// The engine itself never holds keys; this type exists for attestation
/// producers and for dry-run tooling that needs to mint approvals locally.
pub struct EthKeyPair {
    signing_key: SigningKey,
}

impl EthKeyPair {
    /// Create a new random key pair
    pub fn generate() -> Result<Self> {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        Ok(Self { signing_key })
    }

    /// Create from raw private key bytes (32 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(PolicyGuardError::MalformedInput(format!(
                "Expected 32 byte private key, got {}",
                bytes.len()
            )));
        }

        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| PolicyGuardError::MalformedInput(e.to_string()))?;

        let signing_key = SigningKey::from(secret_key);
        Ok(Self { signing_key })
    }

    /// Get the Ethereum address of this key
    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key())
    }

    /// Sign a 32-byte digest
    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<EthSignature> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(hash)
            .map_err(|e| PolicyGuardError::InvalidSignature(e.to_string()))?;

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&signature.r().to_bytes());
        s.copy_from_slice(&signature.s().to_bytes());

        Ok(EthSignature {
            r,
            s,
            v: recovery_id.to_byte(),
        })
    }
}

/// Ethereum signature with recovery id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// Recovery id normalised to 0 or 1
    pub v: u8,
}

impl EthSignature {
    /// Parse a 65-byte `r || s || v` signature. `v` may be 0/1 or 27/28.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(PolicyGuardError::MalformedInput(format!(
                "Expected 65 byte signature, got {}",
                bytes.len()
            )));
        }

        let v = match bytes[64] {
            0 | 1 => bytes[64],
            27 | 28 => bytes[64] - 27,
            other => {
                return Err(PolicyGuardError::MalformedInput(format!(
                    "Invalid recovery id: {}",
                    other
                )))
            }
        };

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[0..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self { r, s, v })
    }

    /// Get the full signature bytes (65 bytes: r || s || v)
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut sig = [0u8; 65];
        sig[0..32].copy_from_slice(&self.r);
        sig[32..64].copy_from_slice(&self.s);
        sig[64] = self.v;
        sig
    }

    /// Get v in the 27/28 form expected by on-chain `ecrecover`
    pub fn v_legacy(&self) -> u8 {
        self.v + 27
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Recover the signing address of a 32-byte digest
pub fn recover_address(hash: &[u8; 32], signature: &EthSignature) -> Result<Address> {
    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(&signature.r);
    rs[32..].copy_from_slice(&signature.s);

    let sig = Signature::from_slice(&rs)
        .map_err(|e| PolicyGuardError::InvalidSignature(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(signature.v).ok_or_else(|| {
        PolicyGuardError::InvalidSignature(format!("Invalid recovery id: {}", signature.v))
    })?;

    let key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id)
        .map_err(|e| PolicyGuardError::InvalidSignature(e.to_string()))?;

    Ok(address_of(&key))
}

/// Compute keccak256 hash
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Parse a hex address string (with or without `0x`)
pub fn parse_address(addr: &str) -> Result<Address> {
    let trimmed = addr.strip_prefix("0x").unwrap_or(addr);

    if trimmed.len() != 40 {
        return Err(PolicyGuardError::InvalidAddress(format!(
            "Address must be 40 hex chars: {}",
            addr
        )));
    }

    let bytes = hex::decode(trimmed)
        .map_err(|e| PolicyGuardError::InvalidAddress(format!("{}: {}", addr, e)))?;
    Ok(Address::from_slice(&bytes))
}

fn address_of(key: &VerifyingKey) -> Address {
    let pubkey = key.to_encoded_point(false);
    // Skip the 0x04 prefix and hash the remaining 64 bytes
    let hash = Keccak256::digest(&pubkey.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}
