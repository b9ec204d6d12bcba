// src/entry_point.rs
//! The batch orchestrator.
//!
//! A batch is authorized once by a proof over the ordered operations, then
//! each operation runs validate -> execute -> post-op -> settle on its own.
//! Only the proof gate can fail the whole call; everything after it is
//! reported per operation.

use std::collections::HashSet;
use std::sync::Arc;

use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::account::{Account, AccountValidation};
use crate::clock::Clock;
use crate::config::{BeneficiaryPolicy, EntryPointConfig};
use crate::error::{
    CallFailure, EntryPointError, ExecutionFailure, ProofRejection, ValidationFailure,
};
use crate::events::{EntryPointEvent, EventLog};
use crate::ledger::DepositLedger;
use crate::nonce::NonceManager;
use crate::paymaster::Paymaster;
use crate::registry::Registry;
use crate::types::{
    BatchReport, DepositInfo, ExecutionResult, OperationOutcome, OperationReport, Payer,
    PostOpMode, UserOperation,
};
use crate::verifier::{BatchCommitment, KeccakChainCommitment, ProofVerifier};

/// State carried from a successful validation into execution and settlement.
struct Validated {
    account: Arc<dyn Account>,
    payer: Payer,
    sponsor: Option<Sponsor>,
    reserved: U256,
    validation_gas: U256,
}

struct Sponsor {
    paymaster: Arc<dyn Paymaster>,
    context: Bytes,
}

pub struct EntryPoint {
    config: EntryPointConfig,
    base_fee: RwLock<U256>,
    ledger: Arc<DepositLedger>,
    nonces: NonceManager,
    registry: Arc<Registry>,
    verifier: Arc<dyn ProofVerifier>,
    commitment: Arc<dyn BatchCommitment>,
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    // one batch at a time; ledger records still lock individually
    batch_lock: Mutex<()>,
}

impl EntryPoint {
    pub fn new(
        config: EntryPointConfig,
        registry: Arc<Registry>,
        verifier: Arc<dyn ProofVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Arc::new(EventLog::with_capacity(config.event_log_capacity));
        let ledger = Arc::new(DepositLedger::new(clock.clone(), events.clone()));
        Self {
            base_fee: RwLock::new(config.base_fee),
            config,
            ledger,
            nonces: NonceManager::new(),
            registry,
            verifier,
            commitment: Arc::new(KeccakChainCommitment),
            clock,
            events,
            batch_lock: Mutex::new(()),
        }
    }

    /// Swaps in the commitment scheme the proof circuit actually uses.
    pub fn with_commitment(mut self, commitment: Arc<dyn BatchCommitment>) -> Self {
        self.commitment = commitment;
        self
    }

    pub fn config(&self) -> &EntryPointConfig {
        &self.config
    }

    pub fn ledger(&self) -> &DepositLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn base_fee(&self) -> U256 {
        *self.base_fee.read()
    }

    pub fn set_base_fee(&self, base_fee: U256) {
        *self.base_fee.write() = base_fee;
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.ledger.balance_of(account)
    }

    pub fn get_deposit_info(&self, account: Address) -> DepositInfo {
        self.ledger.deposit_info(account)
    }

    pub fn get_nonce(&self, sender: Address, key: U256) -> U256 {
        self.nonces.get_nonce(sender, key)
    }

    /// Burns the sender's current nonce under `key` so pending operations can never run.
    pub fn increment_nonce(&self, sender: Address, key: U256) -> U256 {
        self.nonces.increment_nonce(sender, key)
    }

    pub fn user_op_hash(&self, op: &UserOperation) -> H256 {
        op.hash(self.config.address, self.config.chain_id)
    }

    /// The public inputs a proof for exactly this ordered batch must carry.
    pub fn public_inputs(&self, ops: &[UserOperation]) -> Vec<U256> {
        self.commitment
            .public_inputs(ops, self.config.address, self.config.chain_id)
    }

    pub async fn handle_ops(
        &self,
        ops: &[UserOperation],
        proof: &[u8],
        public_inputs: &[U256],
        beneficiary: Address,
    ) -> Result<BatchReport, EntryPointError> {
        let _batch = self.batch_lock.lock().await;

        self.check_batch(ops, beneficiary)?;
        self.check_proof(ops, proof, public_inputs)?;

        info!(
            "Handling batch of {} operations for beneficiary {}",
            ops.len(),
            beneficiary
        );
        self.events.emit(EntryPointEvent::BeforeExecution);

        let base_fee = self.base_fee();
        let mut collected = U256::zero();
        let mut operations = Vec::with_capacity(ops.len());

        for (index, op) in ops.iter().enumerate() {
            let user_op_hash = self.user_op_hash(op);
            let outcome = self.process_op(index, op, user_op_hash, base_fee).await;

            if let Some(result) = outcome.result() {
                collected = collected.saturating_add(result.actual_gas_cost);
            }
            self.emit_outcome(op, user_op_hash, &outcome);

            operations.push(OperationReport {
                index,
                user_op_hash,
                sender: op.sender,
                nonce: op.nonce,
                outcome,
            });
        }

        let (beneficiary_payout, overhead_retained) =
            self.pay_beneficiary(beneficiary, collected, base_fee);

        let report = BatchReport {
            beneficiary,
            operations,
            collected,
            beneficiary_payout,
            overhead_retained,
        };
        info!(
            "Batch done: {}/{} succeeded, collected {}, paid {} to {}",
            report.succeeded(),
            ops.len(),
            collected,
            beneficiary_payout,
            beneficiary
        );
        Ok(report)
    }

    fn check_batch(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
    ) -> Result<(), EntryPointError> {
        if ops.is_empty() {
            return Err(EntryPointError::EmptyBatch);
        }
        if beneficiary.is_zero() {
            return Err(EntryPointError::InvalidBeneficiary);
        }
        let mut seen = HashSet::with_capacity(ops.len());
        for op in ops {
            if !seen.insert((op.sender, op.nonce)) {
                return Err(EntryPointError::DuplicateOperation {
                    sender: op.sender,
                    nonce: op.nonce,
                });
            }
        }
        Ok(())
    }

    fn check_proof(
        &self,
        ops: &[UserOperation],
        proof: &[u8],
        public_inputs: &[U256],
    ) -> Result<(), EntryPointError> {
        let expected = self.public_inputs(ops);
        if expected.as_slice() != public_inputs {
            warn!("Public inputs do not match batch of {} operations", ops.len());
            return Err(EntryPointError::ProofRejected(
                ProofRejection::PublicInputMismatch,
            ));
        }
        if !self.verifier.verify(proof, public_inputs) {
            warn!("Verifier rejected proof for batch of {} operations", ops.len());
            return Err(EntryPointError::ProofRejected(
                ProofRejection::VerifierRejected,
            ));
        }
        Ok(())
    }

    async fn process_op(
        &self,
        index: usize,
        op: &UserOperation,
        user_op_hash: H256,
        base_fee: U256,
    ) -> OperationOutcome {
        let validated = match self.validate(op, user_op_hash).await {
            Ok(validated) => validated,
            Err(failure) => {
                warn!("Operation {} from {} failed validation: {}", index, op.sender, failure);
                return OperationOutcome::ValidationFailed { failure };
            }
        };
        debug!(
            "Operation {} validated, reserved {} from {:?}",
            index, validated.reserved, validated.payer
        );

        let (execution_gas, mut failure) = self.execute(op, validated.account.as_ref()).await;
        if let Some(failure) = &failure {
            warn!("Operation {} from {} failed: {}", index, op.sender, failure);
        }

        let gas_price = op.gas_price(base_fee);
        let mut gas_used = op
            .pre_verification_gas
            .saturating_add(validated.validation_gas)
            .saturating_add(execution_gas);

        if let Some(sponsor) = &validated.sponsor {
            let budget = op
                .verification_gas_limit
                .saturating_sub(validated.validation_gas);
            let post_op_gas = self
                .post_op(
                    op,
                    sponsor,
                    gas_used.saturating_mul(gas_price),
                    budget,
                    &mut failure,
                )
                .await;
            gas_used = gas_used.saturating_add(post_op_gas);
        }

        let actual_gas_cost = gas_used.saturating_mul(gas_price);
        let payer = validated.payer;
        match self
            .ledger
            .settle(payer.address(), validated.reserved, actual_gas_cost)
        {
            Ok(charged) => {
                let result = ExecutionResult {
                    success: failure.is_none(),
                    actual_gas_used: gas_used,
                    actual_gas_cost: charged,
                    payer,
                };
                match failure {
                    None => OperationOutcome::Executed(result),
                    Some(failure) => OperationOutcome::ExecutionFailed { result, failure },
                }
            }
            Err(violation) => {
                error!(
                    "Settlement fault on operation {} from {}: {}",
                    index, op.sender, violation
                );
                let result = ExecutionResult {
                    success: false,
                    actual_gas_used: gas_used,
                    actual_gas_cost: validated.reserved,
                    payer,
                };
                OperationOutcome::SettlementFaulted { result, violation }
            }
        }
    }

    async fn validate(
        &self,
        op: &UserOperation,
        user_op_hash: H256,
    ) -> Result<Validated, ValidationFailure> {
        let max_cost = op.max_cost()?;
        let paymaster_address = op.paymaster()?;

        let account = self
            .registry
            .account(op.sender)
            .ok_or(ValidationFailure::AccountNotDeployed)?;
        if !op.init_code.is_empty() {
            return Err(ValidationFailure::SenderAlreadyConstructed);
        }
        self.nonces.check(op.sender, op.nonce)?;

        let sponsor = match paymaster_address {
            Some(address) => {
                let paymaster = self
                    .registry
                    .paymaster(address)
                    .ok_or(ValidationFailure::PaymasterNotDeployed)?;
                let deposit = self.ledger.balance_of(address);
                if deposit < max_cost {
                    return Err(ValidationFailure::PaymasterDepositTooLow {
                        deposit,
                        required: max_cost,
                    });
                }
                Some((address, paymaster))
            }
            None => None,
        };

        let now = self.clock.now();
        let limit = op.verification_gas_limit;
        let missing_account_funds = if sponsor.is_some() {
            U256::zero()
        } else {
            max_cost.saturating_sub(self.ledger.balance_of(op.sender))
        };

        let validation = account
            .validate_user_op(op, user_op_hash, missing_account_funds, limit)
            .await
            .map_err(|failure| ValidationFailure::AccountReverted {
                reason: failure.reason(),
            })?;
        let mut validation_gas = validation.gas_used;
        let AccountValidation {
            validation_data: account_data,
            prefund_paid,
        } = validation.value;

        // value the account already sent lands in its deposit whatever happens next
        if !prefund_paid.is_zero() {
            self.ledger
                .deposit_to(op.sender, prefund_paid)
                .map_err(|e| ValidationFailure::AccountReverted {
                    reason: e.to_string(),
                })?;
        }
        if validation_gas > limit {
            return Err(ValidationFailure::OverVerificationGasLimit);
        }
        if account_data.sig_failed {
            return Err(ValidationFailure::AccountSignatureError);
        }
        if !account_data.in_window(now) {
            return Err(ValidationFailure::AccountExpiredOrNotDue);
        }

        let (payer, sponsor) = match sponsor {
            Some((address, paymaster)) => {
                let remaining = limit - validation_gas;
                let validation = paymaster
                    .validate_paymaster_user_op(op, user_op_hash, max_cost, remaining)
                    .await
                    .map_err(|failure| ValidationFailure::PaymasterReverted {
                        reason: failure.reason(),
                    })?;
                if validation.gas_used > remaining {
                    return Err(ValidationFailure::OverVerificationGasLimit);
                }
                validation_gas += validation.gas_used;

                let data = validation.value.validation_data;
                if data.sig_failed {
                    return Err(ValidationFailure::PaymasterSignatureError);
                }
                if !data.in_window(now) {
                    return Err(ValidationFailure::PaymasterExpiredOrNotDue);
                }
                let sponsor = Sponsor {
                    paymaster,
                    context: validation.value.context,
                };
                (Payer::Paymaster(address), Some(sponsor))
            }
            None => (Payer::Account(op.sender), None),
        };

        self.ledger
            .reserve(payer.address(), max_cost)
            .map_err(|_| {
                let deposit = self.ledger.balance_of(payer.address());
                match payer {
                    Payer::Account(_) => ValidationFailure::PrefundNotPaid {
                        deposit,
                        required: max_cost,
                    },
                    Payer::Paymaster(_) => ValidationFailure::PaymasterDepositTooLow {
                        deposit,
                        required: max_cost,
                    },
                }
            })?;

        if let Err(failure) = self.nonces.validate_and_consume(op.sender, op.nonce) {
            self.ledger.release(payer.address(), max_cost);
            return Err(failure);
        }

        Ok(Validated {
            account,
            payer,
            sponsor,
            reserved: max_cost,
            validation_gas,
        })
    }

    async fn execute(
        &self,
        op: &UserOperation,
        account: &dyn Account,
    ) -> (U256, Option<ExecutionFailure>) {
        if op.call_data.is_empty() {
            return (U256::zero(), None);
        }
        let limit = op.call_gas_limit;
        match account.execute(&op.call_data, limit).await {
            Ok(call) if call.gas_used > limit => {
                (limit, Some(ExecutionFailure::OutOfGas { limit }))
            }
            Ok(call) => (call.gas_used, None),
            Err(CallFailure::OutOfGas) => (limit, Some(ExecutionFailure::OutOfGas { limit })),
            Err(failure) => (
                failure.gas_used(limit),
                Some(ExecutionFailure::Reverted {
                    reason: failure.reason(),
                }),
            ),
        }
    }

    /// Runs the paymaster callback and returns the gas it consumed. The
    /// callback only gets the verification gas validation left unused. A
    /// reverting callback marks the operation failed and gets one more call in
    /// `PostOpReverted` mode out of whatever budget the first call left.
    async fn post_op(
        &self,
        op: &UserOperation,
        sponsor: &Sponsor,
        cost_so_far: U256,
        budget: U256,
        failure: &mut Option<ExecutionFailure>,
    ) -> U256 {
        let mode = match failure {
            None => PostOpMode::OpSucceeded,
            Some(_) => PostOpMode::OpReverted,
        };
        let first = match sponsor
            .paymaster
            .post_op(mode, &sponsor.context, cost_so_far, budget)
            .await
        {
            Ok(call) => return call.gas_used.min(budget),
            Err(first) => first,
        };

        warn!("postOp for {} reverted: {}", op.sender, first.reason());
        *failure = Some(ExecutionFailure::PostOpReverted {
            reason: first.reason(),
        });
        let first_gas = first.gas_used(budget);
        let remaining = budget - first_gas;

        let retry_gas = match sponsor
            .paymaster
            .post_op(PostOpMode::PostOpReverted, &sponsor.context, cost_so_far, remaining)
            .await
        {
            Ok(call) => call.gas_used.min(remaining),
            Err(second) => {
                error!(
                    "postOp for {} reverted twice: {}",
                    op.sender,
                    second.reason()
                );
                second.gas_used(remaining)
            }
        };
        first_gas + retry_gas
    }

    fn emit_outcome(&self, op: &UserOperation, user_op_hash: H256, outcome: &OperationOutcome) {
        let Some(result) = outcome.result() else {
            return;
        };
        let revert_reason = match outcome {
            OperationOutcome::ExecutionFailed { failure, .. } => Some(failure.to_string()),
            _ => None,
        };
        if let Some(revert_reason) = revert_reason {
            self.events.emit(EntryPointEvent::UserOperationRevertReason {
                user_op_hash,
                sender: op.sender,
                nonce: op.nonce,
                revert_reason,
            });
        }
        let paymaster = match result.payer {
            Payer::Paymaster(address) => Some(address),
            Payer::Account(_) => None,
        };
        self.events.emit(EntryPointEvent::UserOperationEvent {
            user_op_hash,
            sender: op.sender,
            paymaster,
            nonce: op.nonce,
            success: result.success,
            actual_gas_cost: result.actual_gas_cost,
            actual_gas_used: result.actual_gas_used,
        });
    }

    /// Splits the batch revenue into the entry point's overhead and the
    /// beneficiary's payout, returning `(payout, overhead)`.
    fn pay_beneficiary(
        &self,
        beneficiary: Address,
        collected: U256,
        base_fee: U256,
    ) -> (U256, U256) {
        let overhead = self
            .config
            .overhead_gas
            .saturating_mul(base_fee)
            .min(collected);
        let payout = collected - overhead;

        if !overhead.is_zero() {
            if let Err(e) = self.ledger.deposit_to(self.config.address, overhead) {
                error!("Failed to retain overhead {}: {}", overhead, e);
            }
        }
        if payout.is_zero() {
            return (payout, overhead);
        }
        match self.config.beneficiary_policy {
            BeneficiaryPolicy::CreditDeposit => {
                if let Err(e) = self.ledger.deposit_to(beneficiary, payout) {
                    error!("Failed to credit beneficiary {}: {}", beneficiary, e);
                }
            }
            BeneficiaryPolicy::Transfer => {
                info!("Paying {} to beneficiary {}", payout, beneficiary);
                self.events.emit(EntryPointEvent::BeneficiaryPaid {
                    beneficiary,
                    amount: payout,
                });
            }
        }
        (payout, overhead)
    }
}
