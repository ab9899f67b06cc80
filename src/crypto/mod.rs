//! Cryptographic utilities for attestation signing and recovery

pub mod eth;

pub use eth::{keccak256, parse_address, recover_address, EthKeyPair, EthSignature};
