// src/verifier.rs
//! Batch authorization: the commitment that ties public inputs to an ordered
//! batch, and the opaque oracle that checks a proof against them.

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use crate::types::UserOperation;

/// Scalar field modulus of BN254, the field circuit public inputs live in.
pub const BN254_SCALAR_MODULUS: U256 = U256([
    0x43e1f593f0000001,
    0x2833e84879b97091,
    0xb85045b68181585d,
    0x30644e72e131a029,
]);

/// Accepts or rejects a proof for a vector of public inputs. Must be pure.
pub trait ProofVerifier: Send + Sync {
    fn verify(&self, proof: &[u8], public_inputs: &[U256]) -> bool;
}

/// Derives the public inputs a batch proof must carry. Any implementation
/// has to change its output when the operations are reordered.
pub trait BatchCommitment: Send + Sync {
    fn public_inputs(
        &self,
        ops: &[UserOperation],
        entry_point: Address,
        chain_id: u64,
    ) -> Vec<U256>;
}

/// Folds operation hashes left to right:
/// `acc_i = keccak256(acc_{i-1} || hash(op_i))`, output `[acc_n mod r]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeccakChainCommitment;

impl KeccakChainCommitment {
    pub fn accumulate(ops: &[UserOperation], entry_point: Address, chain_id: u64) -> H256 {
        ops.iter().fold(H256::zero(), |acc, op| {
            let mut preimage = [0u8; 64];
            preimage[..32].copy_from_slice(acc.as_bytes());
            preimage[32..].copy_from_slice(op.hash(entry_point, chain_id).as_bytes());
            H256::from(keccak256(preimage))
        })
    }
}

impl BatchCommitment for KeccakChainCommitment {
    fn public_inputs(
        &self,
        ops: &[UserOperation],
        entry_point: Address,
        chain_id: u64,
    ) -> Vec<U256> {
        let acc = Self::accumulate(ops, entry_point, chain_id);
        vec![U256::from_big_endian(acc.as_bytes()) % BN254_SCALAR_MODULUS]
    }
}

/// Stand-in proof scheme for development nodes and tests: a proof is the
/// keccak digest of a domain tag and the ABI-encoded public inputs. It has
/// no zero-knowledge or soundness properties beyond binding to the inputs.
#[derive(Debug, Clone, Copy)]
pub struct DigestVerifier {
    domain: H256,
}

impl DigestVerifier {
    pub fn new(domain: H256) -> Self {
        Self { domain }
    }

    pub fn prove(&self, public_inputs: &[U256]) -> Bytes {
        Bytes::from(self.digest(public_inputs).to_vec())
    }

    fn digest(&self, public_inputs: &[U256]) -> [u8; 32] {
        let inputs = Token::Array(public_inputs.iter().copied().map(Token::Uint).collect());
        let mut preimage = self.domain.as_bytes().to_vec();
        preimage.extend_from_slice(&encode(&[inputs]));
        keccak256(preimage)
    }
}

impl ProofVerifier for DigestVerifier {
    fn verify(&self, proof: &[u8], public_inputs: &[U256]) -> bool {
        proof == self.digest(public_inputs).as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(seed: u8) -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(seed),
            nonce: U256::zero(),
            init_code: Bytes::default(),
            call_data: Bytes::from(vec![seed]),
            call_gas_limit: U256::from(10_000),
            verification_gas_limit: U256::from(10_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(1),
            max_priority_fee_per_gas: U256::from(1),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        }
    }

    #[test]
    fn modulus_matches_decimal() {
        let decimal = U256::from_dec_str(
            "21888242871839275222246405745257275088548364400416034343698204186575808495617",
        )
        .unwrap();
        assert_eq!(BN254_SCALAR_MODULUS, decimal);
    }

    #[test]
    fn commitment_is_order_sensitive() {
        let ops = [op(1), op(2), op(3)];
        let commitment = KeccakChainCommitment;
        let entry_point = Address::repeat_byte(0xee);
        let forward = commitment.public_inputs(&ops, entry_point, 1);

        let permutations = [[0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in permutations {
            let reordered: Vec<_> = order.iter().map(|&i| ops[i].clone()).collect();
            assert_ne!(forward, commitment.public_inputs(&reordered, entry_point, 1));
        }
    }

    #[test]
    fn commitment_binds_batch_length() {
        let ops = [op(1), op(2)];
        let commitment = KeccakChainCommitment;
        let entry_point = Address::repeat_byte(0xee);
        assert_ne!(
            commitment.public_inputs(&ops, entry_point, 1),
            commitment.public_inputs(&ops[..1], entry_point, 1)
        );
    }

    #[test]
    fn commitment_fits_the_field() {
        let inputs = KeccakChainCommitment.public_inputs(&[op(9)], Address::zero(), 1);
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0] < BN254_SCALAR_MODULUS);
    }

    #[test]
    fn digest_verifier_binds_inputs_and_domain() {
        let verifier = DigestVerifier::new(H256::repeat_byte(1));
        let inputs = vec![U256::from(42)];
        let proof = verifier.prove(&inputs);

        assert!(verifier.verify(&proof, &inputs));
        assert!(!verifier.verify(&proof, &[U256::from(43)]));
        assert!(!DigestVerifier::new(H256::repeat_byte(2)).verify(&proof, &inputs));
        assert!(!verifier.verify(&[], &inputs));
    }
}
