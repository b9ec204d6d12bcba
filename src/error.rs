// src/error.rs
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a whole `handle_ops` call before any state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntryPointError {
    #[error("Empty batch")]
    EmptyBatch,

    #[error("AA90 invalid beneficiary")]
    InvalidBeneficiary,

    #[error("Duplicate operation for sender {sender} with nonce {nonce}")]
    DuplicateOperation { sender: Address, nonce: U256 },

    #[error("Proof rejected: {0}")]
    ProofRejected(ProofRejection),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofRejection {
    #[error("public inputs do not match the batch")]
    PublicInputMismatch,

    #[error("verifier rejected the proof")]
    VerifierRejected,
}

/// Why an operation was excluded before execution. Nothing is charged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ValidationFailure {
    #[error("AA10 sender already constructed")]
    SenderAlreadyConstructed,

    #[error("AA20 account not deployed")]
    AccountNotDeployed,

    #[error("AA21 didn't pay prefund: deposit {deposit} < required {required}")]
    PrefundNotPaid { deposit: U256, required: U256 },

    #[error("AA22 expired or not due")]
    AccountExpiredOrNotDue,

    #[error("AA23 reverted: {reason}")]
    AccountReverted { reason: String },

    #[error("AA24 signature error")]
    AccountSignatureError,

    #[error("AA25 invalid account nonce: expected {expected}, got {actual}")]
    InvalidNonce { expected: U256, actual: U256 },

    #[error("AA30 paymaster not deployed")]
    PaymasterNotDeployed,

    #[error("AA31 paymaster deposit too low: deposit {deposit} < required {required}")]
    PaymasterDepositTooLow { deposit: U256, required: U256 },

    #[error("AA32 paymaster expired or not due")]
    PaymasterExpiredOrNotDue,

    #[error("AA33 reverted: {reason}")]
    PaymasterReverted { reason: String },

    #[error("AA34 signature error")]
    PaymasterSignatureError,

    #[error("AA40 over verificationGasLimit")]
    OverVerificationGasLimit,

    #[error("AA93 invalid paymasterAndData length {len}")]
    InvalidPaymasterAndData { len: usize },

    #[error("AA94 gas values overflow")]
    GasValuesOverflow,
}

impl ValidationFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationFailure::SenderAlreadyConstructed => "AA10",
            ValidationFailure::AccountNotDeployed => "AA20",
            ValidationFailure::PrefundNotPaid { .. } => "AA21",
            ValidationFailure::AccountExpiredOrNotDue => "AA22",
            ValidationFailure::AccountReverted { .. } => "AA23",
            ValidationFailure::AccountSignatureError => "AA24",
            ValidationFailure::InvalidNonce { .. } => "AA25",
            ValidationFailure::PaymasterNotDeployed => "AA30",
            ValidationFailure::PaymasterDepositTooLow { .. } => "AA31",
            ValidationFailure::PaymasterExpiredOrNotDue => "AA32",
            ValidationFailure::PaymasterReverted { .. } => "AA33",
            ValidationFailure::PaymasterSignatureError => "AA34",
            ValidationFailure::OverVerificationGasLimit => "AA40",
            ValidationFailure::InvalidPaymasterAndData { .. } => "AA93",
            ValidationFailure::GasValuesOverflow => "AA94",
        }
    }
}

/// An operation that passed validation but failed while running. Gas is still charged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ExecutionFailure {
    #[error("execution reverted: {reason}")]
    Reverted { reason: String },

    #[error("execution ran out of gas (limit {limit})")]
    OutOfGas { limit: U256 },

    #[error("AA50 postOp reverted: {reason}")]
    PostOpReverted { reason: String },
}

/// Internal-consistency faults. Validation should make these unreachable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum InvariantViolation {
    #[error("AA51 prefund below actualGasCost: reserved {reserved} < actual {actual}")]
    PrefundBelowActualCost { reserved: U256, actual: U256 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient balance for {account}: {amount} > {balance}")]
    InsufficientBalance {
        account: Address,
        amount: U256,
        balance: U256,
    },

    #[error("Must specify unstake delay")]
    ZeroUnstakeDelay,

    #[error("Cannot decrease unstake time: {requested} < {current}")]
    StakeDelayDecreased { requested: u32, current: u32 },

    #[error("No stake specified")]
    NoStakeSpecified,

    #[error("Not staked")]
    NotStaked,

    #[error("Already unstaking")]
    AlreadyUnstaking,

    #[error("No stake to withdraw")]
    NoStake,

    #[error("Must call unlockStake() first")]
    StakeNotUnlocked,

    #[error("Stake withdrawal is not due until {withdraw_time} (now {now})")]
    StakeWithdrawalNotDue { withdraw_time: u64, now: u64 },

    #[error("Balance overflow for {account}")]
    Overflow { account: Address },
}

/// Outcome of a call into the execution substrate that did not return normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    #[error("reverted: {reason}")]
    Reverted { reason: String, gas_used: U256 },

    #[error("out of gas")]
    OutOfGas,
}

impl CallFailure {
    pub fn revert(reason: impl Into<String>, gas_used: U256) -> Self {
        CallFailure::Reverted {
            reason: reason.into(),
            gas_used,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            CallFailure::Reverted { reason, .. } => reason.clone(),
            CallFailure::OutOfGas => "out of gas".to_string(),
        }
    }

    /// Gas consumed by the failed call; running out of gas burns the whole limit.
    pub fn gas_used(&self, limit: U256) -> U256 {
        match self {
            CallFailure::Reverted { gas_used, .. } => (*gas_used).min(limit),
            CallFailure::OutOfGas => limit,
        }
    }
}

#[derive(Error, Debug)]
pub enum PaymasterError {
    #[error("Invalid UserOperation: {0}")]
    InvalidUserOperation(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}
