// src/nonce.rs
//! Two-dimensional nonces: the upper 192 bits select a key, the lower 64 bits
//! are a strictly increasing sequence under that key.

use std::collections::HashMap;

use ethers::types::{Address, U256};
use parking_lot::RwLock;

use crate::error::ValidationFailure;

const SEQUENCE_BITS: usize = 64;

#[derive(Debug, Default)]
pub struct NonceManager {
    sequences: RwLock<HashMap<(Address, U256), u64>>,
}

pub fn split_nonce(nonce: U256) -> (U256, u64) {
    (nonce >> SEQUENCE_BITS, nonce.low_u64())
}

pub fn join_nonce(key: U256, sequence: u64) -> U256 {
    (key << SEQUENCE_BITS) | U256::from(sequence)
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next valid full nonce for `sender` under `key`.
    pub fn get_nonce(&self, sender: Address, key: U256) -> U256 {
        let sequence = self
            .sequences
            .read()
            .get(&(sender, key))
            .copied()
            .unwrap_or_default();
        join_nonce(key, sequence)
    }

    /// Fails unless `nonce` is exactly the next one for its key.
    pub fn check(&self, sender: Address, nonce: U256) -> Result<(), ValidationFailure> {
        let (key, _) = split_nonce(nonce);
        let expected = self.get_nonce(sender, key);
        if expected != nonce {
            return Err(ValidationFailure::InvalidNonce {
                expected,
                actual: nonce,
            });
        }
        Ok(())
    }

    pub fn validate_and_consume(
        &self,
        sender: Address,
        nonce: U256,
    ) -> Result<(), ValidationFailure> {
        let (key, sequence) = split_nonce(nonce);
        let mut sequences = self.sequences.write();
        let current = sequences.entry((sender, key)).or_default();
        if *current != sequence {
            return Err(ValidationFailure::InvalidNonce {
                expected: join_nonce(key, *current),
                actual: nonce,
            });
        }
        *current += 1;
        Ok(())
    }

    /// Skips the current sequence under `key`, invalidating any operation
    /// already signed with it.
    pub fn increment_nonce(&self, sender: Address, key: U256) -> U256 {
        let mut sequences = self.sequences.write();
        let current = sequences.entry((sender, key)).or_default();
        *current += 1;
        join_nonce(key, *current)
    }
}
