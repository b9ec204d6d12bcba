// src/paymaster.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::account::Metered;
use crate::clock::Clock;
use crate::error::{CallFailure, PaymasterError};
use crate::types::{PaymasterAndData, PaymasterResponse, PostOpMode, UserOperation, ValidationData};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymasterValidation {
    /// Opaque data handed back to `post_op`.
    pub context: Bytes,
    pub validation_data: ValidationData,
}

/// A sponsor that pays gas for operations it agrees to.
#[async_trait]
pub trait Paymaster: Send + Sync {
    async fn validate_paymaster_user_op(
        &self,
        op: &UserOperation,
        user_op_hash: H256,
        max_cost: U256,
        gas_limit: U256,
    ) -> Result<Metered<PaymasterValidation>, CallFailure>;

    async fn post_op(
        &self,
        mode: PostOpMode,
        context: &Bytes,
        actual_gas_cost: U256,
        gas_limit: U256,
    ) -> Result<Metered<()>, CallFailure>;
}

const SIGNATURE_LEN: usize = 65;

/// Sponsors operations that carry its signer's approval inside
/// `paymaster_and_data`, limited to the signed validity window.
pub struct VerifyingPaymaster {
    wallet: LocalWallet,
    pub paymaster_address: Address,
    entry_point: Address,
    chain_id: u64,
    clock: Arc<dyn Clock>,
    // Configuration parameters
    valid_duration: u64, // The validity time window in seconds
    validation_gas: U256,
    post_op_gas: U256,
    sponsored: Mutex<U256>,
}

impl VerifyingPaymaster {
    pub fn new(
        private_key: &str,
        paymaster_address: Address,
        entry_point: Address,
        chain_id: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PaymasterError> {
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| PaymasterError::InvalidParameters(e.to_string()))?
            .with_chain_id(chain_id);

        info!(
            "Initialized verifying paymaster {} with signer {}",
            paymaster_address,
            wallet.address()
        );

        Ok(Self {
            wallet,
            paymaster_address,
            entry_point,
            chain_id,
            clock,
            valid_duration: 3600, // Default 1 hour validity
            validation_gas: U256::from(25_000),
            post_op_gas: U256::from(10_000),
            sponsored: Mutex::new(U256::zero()),
        })
    }

    pub fn with_valid_duration(mut self, valid_duration: u64) -> Self {
        self.valid_duration = valid_duration;
        self
    }

    pub fn signer(&self) -> Address {
        self.wallet.address()
    }

    /// Total gas cost reconciled through `post_op`.
    pub fn sponsored(&self) -> U256 {
        *self.sponsored.lock()
    }

    // Sign a user operation to sponsor it
    pub async fn sponsor_user_operation(
        &self,
        user_op: &UserOperation,
    ) -> Result<PaymasterResponse, PaymasterError> {
        // 1. Validate the user operation
        self.check_user_operation(user_op)?;

        // 2. Create time-range for paymaster validity
        let valid_after = self.clock.now();
        let valid_until = valid_after + self.valid_duration;

        // 3. Hash and sign the sponsorship
        let message_hash = self.sponsorship_hash(user_op, valid_until, valid_after);
        let signature = self
            .wallet
            .sign_message(message_hash)
            .await
            .map_err(|e| PaymasterError::SigningFailed(e.to_string()))?;

        // 4. Encode the paymaster data with the signature
        let paymaster_and_data = PaymasterAndData {
            paymaster: self.paymaster_address,
            valid_until,
            valid_after,
            signature: Bytes::from(signature.to_vec()),
        }
        .encode();

        debug!(
            "Sponsored operation for {} valid until {}",
            user_op.sender, valid_until
        );
        Ok(PaymasterResponse { paymaster_and_data })
    }

    fn check_user_operation(&self, user_op: &UserOperation) -> Result<(), PaymasterError> {
        if user_op.max_fee_per_gas.is_zero() || user_op.max_priority_fee_per_gas.is_zero() {
            return Err(PaymasterError::InvalidUserOperation(
                "Gas price cannot be zero".to_string(),
            ));
        }
        user_op
            .max_cost()
            .map_err(|e| PaymasterError::InvalidUserOperation(e.to_string()))?;
        Ok(())
    }

    // The operation hash with paymasterAndData blanked, since the signature lives there
    fn sponsorship_hash(&self, user_op: &UserOperation, valid_until: u64, valid_after: u64) -> [u8; 32] {
        let mut unsponsored = user_op.clone();
        unsponsored.paymaster_and_data = Bytes::default();
        let user_op_hash = unsponsored.hash(self.entry_point, self.chain_id);

        // paymaster + validUntil + validAfter + userOpHash
        let mut message = vec![];
        message.extend_from_slice(self.paymaster_address.as_bytes());
        message.extend_from_slice(&valid_until.to_be_bytes());
        message.extend_from_slice(&valid_after.to_be_bytes());
        message.extend_from_slice(user_op_hash.as_bytes());
        keccak256(&message)
    }
}

#[async_trait]
impl Paymaster for VerifyingPaymaster {
    async fn validate_paymaster_user_op(
        &self,
        op: &UserOperation,
        _user_op_hash: H256,
        max_cost: U256,
        gas_limit: U256,
    ) -> Result<Metered<PaymasterValidation>, CallFailure> {
        if self.validation_gas > gas_limit {
            return Err(CallFailure::OutOfGas);
        }
        let gas_used = self.validation_gas;
        let data = PaymasterAndData::decode(&op.paymaster_and_data)
            .ok_or_else(|| CallFailure::revert("invalid paymasterAndData", gas_used))?;
        if data.signature.len() != SIGNATURE_LEN {
            return Err(CallFailure::revert("invalid signature length", gas_used));
        }

        let message_hash = self.sponsorship_hash(op, data.valid_until, data.valid_after);
        let recovered = Signature::try_from(data.signature.as_ref())
            .and_then(|signature| signature.recover(message_hash.to_vec()));
        let validation_data = match recovered {
            Ok(signer) if signer == self.wallet.address() => {
                ValidationData::window(data.valid_after, data.valid_until)
            }
            Ok(signer) => {
                warn!("Sponsorship for {} signed by unknown {}", op.sender, signer);
                ValidationData::sig_failure()
            }
            Err(e) => {
                warn!("Malformed sponsorship signature for {}: {}", op.sender, e);
                ValidationData::sig_failure()
            }
        };

        debug!("Paymaster accepts up to {} for {}", max_cost, op.sender);
        Ok(Metered::new(
            PaymasterValidation {
                context: Bytes::from(op.sender.as_bytes().to_vec()),
                validation_data,
            },
            gas_used,
        ))
    }

    async fn post_op(
        &self,
        mode: PostOpMode,
        _context: &Bytes,
        actual_gas_cost: U256,
        gas_limit: U256,
    ) -> Result<Metered<()>, CallFailure> {
        if self.post_op_gas > gas_limit {
            return Err(CallFailure::OutOfGas);
        }
        debug!("postOp {:?} with cost {}", mode, actual_gas_cost);
        let mut sponsored = self.sponsored.lock();
        *sponsored = sponsored.saturating_add(actual_gas_cost);
        Ok(Metered::new((), self.post_op_gas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    // well-known development keys
    const SIGNER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const OTHER_KEY: &str = "59c6995e998f97a5a0044966f0a4c3e1a0f5b1e3e8c7a0e1b5f1b2d9b7c1a8f1";

    fn paymaster(key: &str, clock: Arc<ManualClock>) -> VerifyingPaymaster {
        VerifyingPaymaster::new(
            key,
            Address::repeat_byte(0x50),
            Address::repeat_byte(0xee),
            1337,
            clock,
        )
        .unwrap()
    }

    fn op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0xaa),
            nonce: U256::zero(),
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::from(50_000),
            verification_gas_limit: U256::from(100_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(10),
            max_priority_fee_per_gas: U256::from(1),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        }
    }

    #[tokio::test]
    async fn sponsored_operation_validates() {
        let clock = Arc::new(ManualClock::new(1_000));
        let paymaster = paymaster(SIGNER_KEY, clock);
        let mut op = op();
        op.paymaster_and_data = paymaster.sponsor_user_operation(&op).await.unwrap().paymaster_and_data;

        assert_eq!(op.paymaster().unwrap(), Some(paymaster.paymaster_address));
        let validation = paymaster
            .validate_paymaster_user_op(&op, H256::zero(), U256::from(1), U256::from(100_000))
            .await
            .unwrap();
        assert_eq!(
            validation.value.validation_data,
            ValidationData::window(1_000, 4_600)
        );
    }

    #[tokio::test]
    async fn foreign_signature_fails() {
        let clock = Arc::new(ManualClock::new(1_000));
        let ours = paymaster(SIGNER_KEY, clock.clone());
        let theirs = paymaster(OTHER_KEY, clock);
        let mut op = op();
        op.paymaster_and_data = theirs.sponsor_user_operation(&op).await.unwrap().paymaster_and_data;

        let validation = ours
            .validate_paymaster_user_op(&op, H256::zero(), U256::from(1), U256::from(100_000))
            .await
            .unwrap();
        assert!(validation.value.validation_data.sig_failed);
    }

    #[tokio::test]
    async fn tampered_operation_fails() {
        let clock = Arc::new(ManualClock::new(1_000));
        let paymaster = paymaster(SIGNER_KEY, clock);
        let mut op = op();
        op.paymaster_and_data = paymaster.sponsor_user_operation(&op).await.unwrap().paymaster_and_data;
        op.call_gas_limit = U256::from(5_000_000);

        let validation = paymaster
            .validate_paymaster_user_op(&op, H256::zero(), U256::from(1), U256::from(100_000))
            .await
            .unwrap();
        assert!(validation.value.validation_data.sig_failed);
    }

    #[tokio::test]
    async fn short_paymaster_data_reverts() {
        let clock = Arc::new(ManualClock::new(1_000));
        let paymaster = paymaster(SIGNER_KEY, clock);
        let mut op = op();
        op.paymaster_and_data = Bytes::from(paymaster.paymaster_address.as_bytes().to_vec());

        let result = paymaster
            .validate_paymaster_user_op(&op, H256::zero(), U256::from(1), U256::from(100_000))
            .await;
        assert!(matches!(result, Err(CallFailure::Reverted { .. })));
    }

    #[tokio::test]
    async fn zero_gas_price_is_not_sponsored() {
        let clock = Arc::new(ManualClock::new(1_000));
        let paymaster = paymaster(SIGNER_KEY, clock);
        let mut op = op();
        op.max_priority_fee_per_gas = U256::zero();
        assert!(paymaster.sponsor_user_operation(&op).await.is_err());
    }

    #[tokio::test]
    async fn post_op_accumulates_cost() {
        let clock = Arc::new(ManualClock::new(0));
        let paymaster = paymaster(SIGNER_KEY, clock);
        for _ in 0..2 {
            paymaster
                .post_op(PostOpMode::OpSucceeded, &Bytes::default(), U256::from(7), U256::from(100_000))
                .await
                .unwrap();
        }
        assert_eq!(paymaster.sponsored(), U256::from(14));
        assert_eq!(
            paymaster
                .post_op(PostOpMode::OpReverted, &Bytes::default(), U256::one(), U256::from(1))
                .await,
            Err(CallFailure::OutOfGas)
        );
    }
}
