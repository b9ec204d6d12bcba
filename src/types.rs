// src/types.rs
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionFailure, InvariantViolation, ValidationFailure};

/// Length of the paymaster address prefix in `paymaster_and_data`.
pub const PAYMASTER_ADDRESS_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Returns the sponsoring paymaster, if any.
    ///
    /// `Ok(None)` means the operation is self-funded. A non-empty field too
    /// short to hold an address is rejected.
    pub fn paymaster(&self) -> Result<Option<Address>, ValidationFailure> {
        if self.paymaster_and_data.is_empty() {
            return Ok(None);
        }
        if self.paymaster_and_data.len() < PAYMASTER_ADDRESS_LEN {
            return Err(ValidationFailure::InvalidPaymasterAndData {
                len: self.paymaster_and_data.len(),
            });
        }
        Ok(Some(Address::from_slice(
            &self.paymaster_and_data[..PAYMASTER_ADDRESS_LEN],
        )))
    }

    /// Upper bound on what this operation may be charged:
    /// `(callGasLimit + verificationGasLimit + preVerificationGas) * maxFeePerGas`.
    pub fn max_cost(&self) -> Result<U256, ValidationFailure> {
        self.call_gas_limit
            .checked_add(self.verification_gas_limit)
            .and_then(|sum| sum.checked_add(self.pre_verification_gas))
            .and_then(|gas| gas.checked_mul(self.max_fee_per_gas))
            .ok_or(ValidationFailure::GasValuesOverflow)
    }

    /// Effective price per gas unit at the given base fee.
    pub fn gas_price(&self, base_fee: U256) -> U256 {
        if self.max_fee_per_gas == self.max_priority_fee_per_gas {
            // legacy pricing, base fee never consulted
            return self.max_fee_per_gas;
        }
        let dynamic = base_fee.saturating_add(self.max_priority_fee_per_gas);
        self.max_fee_per_gas.min(dynamic)
    }

    /// ABI encoding of every field except the signature, with dynamic byte
    /// fields replaced by their hashes.
    pub fn pack(&self) -> Vec<u8> {
        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
    }

    /// Identifier of this operation, bound to one entry point on one chain.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let inner = keccak256(self.pack());
        let outer = encode(&[
            Token::FixedBytes(inner.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ]);
        H256::from(keccak256(outer))
    }
}

/// Decoded form of the reference paymaster's `paymaster_and_data` layout:
/// `paymaster (20) || validUntil (32) || validAfter (32) || signature`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterAndData {
    pub paymaster: Address,
    pub valid_until: u64,
    pub valid_after: u64,
    pub signature: Bytes,
}

impl PaymasterAndData {
    const WORD: usize = 32;
    const HEADER_LEN: usize = PAYMASTER_ADDRESS_LEN + 2 * Self::WORD;

    pub fn encode(&self) -> Bytes {
        let mut data = Vec::with_capacity(Self::HEADER_LEN + self.signature.len());
        data.extend_from_slice(self.paymaster.as_bytes());
        data.extend_from_slice(&u64_word(self.valid_until));
        data.extend_from_slice(&u64_word(self.valid_after));
        data.extend_from_slice(&self.signature);
        Bytes::from(data)
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::HEADER_LEN {
            return None;
        }
        let paymaster = Address::from_slice(&raw[..PAYMASTER_ADDRESS_LEN]);
        let until = U256::from_big_endian(
            &raw[PAYMASTER_ADDRESS_LEN..PAYMASTER_ADDRESS_LEN + Self::WORD],
        );
        let after = U256::from_big_endian(
            &raw[PAYMASTER_ADDRESS_LEN + Self::WORD..Self::HEADER_LEN],
        );
        if until > U256::from(u64::MAX) || after > U256::from(u64::MAX) {
            return None;
        }
        Some(Self {
            paymaster,
            valid_until: until.as_u64(),
            valid_after: after.as_u64(),
            signature: Bytes::from(raw[Self::HEADER_LEN..].to_vec()),
        })
    }
}

fn u64_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymasterResponse {
    pub paymaster_and_data: Bytes,
}

/// Per-account record kept by the deposit ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositInfo {
    pub deposit: U256,
    pub staked: bool,
    pub stake: U256,
    pub unstake_delay_sec: u32,
    pub withdraw_time: u64,
}

/// What an account or paymaster reports back from validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationData {
    pub sig_failed: bool,
    pub valid_after: u64,
    /// Zero means the operation never expires.
    pub valid_until: u64,
}

impl ValidationData {
    pub fn window(valid_after: u64, valid_until: u64) -> Self {
        Self {
            sig_failed: false,
            valid_after,
            valid_until,
        }
    }

    pub fn sig_failure() -> Self {
        Self {
            sig_failed: true,
            ..Self::default()
        }
    }

    pub fn in_window(&self, now: u64) -> bool {
        self.valid_after <= now && (self.valid_until == 0 || now <= self.valid_until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "address")]
pub enum Payer {
    Account(Address),
    Paymaster(Address),
}

impl Payer {
    pub fn address(&self) -> Address {
        match self {
            Payer::Account(address) | Payer::Paymaster(address) => *address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostOpMode {
    OpSucceeded,
    OpReverted,
    /// The first post-op call reverted; this is the second and last call.
    PostOpReverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub actual_gas_used: U256,
    pub actual_gas_cost: U256,
    pub payer: Payer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum OperationOutcome {
    Executed(ExecutionResult),
    ExecutionFailed {
        result: ExecutionResult,
        failure: ExecutionFailure,
    },
    ValidationFailed {
        failure: ValidationFailure,
    },
    SettlementFaulted {
        result: ExecutionResult,
        violation: InvariantViolation,
    },
}

impl OperationOutcome {
    /// The settled result, absent when the operation never got past validation.
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            OperationOutcome::Executed(result)
            | OperationOutcome::ExecutionFailed { result, .. }
            | OperationOutcome::SettlementFaulted { result, .. } => Some(result),
            OperationOutcome::ValidationFailed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Executed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub index: usize,
    pub user_op_hash: H256,
    pub sender: Address,
    pub nonce: U256,
    pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub beneficiary: Address,
    pub operations: Vec<OperationReport>,
    /// Sum of everything charged to payers in this batch.
    pub collected: U256,
    pub beneficiary_payout: U256,
    pub overhead_retained: U256,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.operations
            .iter()
            .filter(|report| report.outcome.is_success())
            .count()
    }

    pub fn validation_failures(&self) -> impl Iterator<Item = &OperationReport> {
        self.operations
            .iter()
            .filter(|report| matches!(report.outcome, OperationOutcome::ValidationFailed { .. }))
    }
}
