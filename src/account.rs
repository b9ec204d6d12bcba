// src/account.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CallFailure;
use crate::types::{UserOperation, ValidationData};

/// A successful call together with the gas it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metered<T> {
    pub value: T,
    pub gas_used: U256,
}

impl<T> Metered<T> {
    pub fn new(value: T, gas_used: impl Into<U256>) -> Self {
        Self {
            value,
            gas_used: gas_used.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountValidation {
    pub validation_data: ValidationData,
    /// Value the account moved into its own deposit to cover `missing_account_funds`.
    pub prefund_paid: U256,
}

/// The smart account side of an operation.
#[async_trait]
pub trait Account: Send + Sync {
    async fn validate_user_op(
        &self,
        op: &UserOperation,
        user_op_hash: H256,
        missing_account_funds: U256,
        gas_limit: U256,
    ) -> Result<Metered<AccountValidation>, CallFailure>;

    async fn execute(
        &self,
        call_data: &Bytes,
        gas_limit: U256,
    ) -> Result<Metered<Bytes>, CallFailure>;
}

/// The execution substrate: runs a message call and meters it.
#[async_trait]
pub trait CallExecutor: Send + Sync {
    async fn call(
        &self,
        from: Address,
        target: Address,
        value: U256,
        data: &Bytes,
        gas_limit: U256,
    ) -> Result<Metered<Bytes>, CallFailure>;
}

pub const EXECUTE_SIGNATURE: &str = "execute(address,uint256,bytes)";

/// Builds the call data `SimpleAccount` understands.
pub fn encode_execute(target: Address, value: U256, data: &[u8]) -> Bytes {
    let mut call_data = id(EXECUTE_SIGNATURE).to_vec();
    call_data.extend_from_slice(&encode(&[
        Token::Address(target),
        Token::Uint(value),
        Token::Bytes(data.to_vec()),
    ]));
    Bytes::from(call_data)
}

pub fn decode_execute(call_data: &[u8]) -> Option<(Address, U256, Bytes)> {
    if call_data.len() < 4 || call_data[..4] != id(EXECUTE_SIGNATURE) {
        return None;
    }
    let tokens = decode(
        &[ParamType::Address, ParamType::Uint(256), ParamType::Bytes],
        &call_data[4..],
    )
    .ok()?;
    match tokens.as_slice() {
        [Token::Address(target), Token::Uint(value), Token::Bytes(data)] => {
            Some((*target, *value, Bytes::from(data.clone())))
        }
        _ => None,
    }
}

/// Reference account: execution is delegated to the substrate via
/// `execute(address,uint256,bytes)`, missing prefund comes out of the
/// account's own native balance.
pub struct SimpleAccount {
    address: Address,
    owner: Address,
    balance: Mutex<U256>,
    executor: Arc<dyn CallExecutor>,
    validation_gas: U256,
}

impl SimpleAccount {
    pub const DEFAULT_VALIDATION_GAS: u64 = 30_000;

    pub fn new(
        address: Address,
        owner: Address,
        balance: U256,
        executor: Arc<dyn CallExecutor>,
    ) -> Self {
        Self {
            address,
            owner,
            balance: Mutex::new(balance),
            executor,
            validation_gas: U256::from(Self::DEFAULT_VALIDATION_GAS),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn balance(&self) -> U256 {
        *self.balance.lock()
    }
}

#[async_trait]
impl Account for SimpleAccount {
    async fn validate_user_op(
        &self,
        op: &UserOperation,
        user_op_hash: H256,
        missing_account_funds: U256,
        gas_limit: U256,
    ) -> Result<Metered<AccountValidation>, CallFailure> {
        if self.validation_gas > gas_limit {
            return Err(CallFailure::OutOfGas);
        }
        if op.sender != self.address {
            return Err(CallFailure::revert("wrong sender", self.validation_gas));
        }
        debug!("Validating {:?} for {}", user_op_hash, self.address);

        let mut balance = self.balance.lock();
        let prefund_paid = missing_account_funds.min(*balance);
        *balance -= prefund_paid;

        Ok(Metered::new(
            AccountValidation {
                validation_data: ValidationData::default(),
                prefund_paid,
            },
            self.validation_gas,
        ))
    }

    async fn execute(
        &self,
        call_data: &Bytes,
        gas_limit: U256,
    ) -> Result<Metered<Bytes>, CallFailure> {
        let (target, value, data) = decode_execute(call_data)
            .ok_or_else(|| CallFailure::revert("unknown selector", U256::zero()))?;
        {
            let mut balance = self.balance.lock();
            if value > *balance {
                return Err(CallFailure::revert("insufficient balance", U256::zero()));
            }
            *balance -= value;
        }
        let result = self
            .executor
            .call(self.address, target, value, &data, gas_limit)
            .await;
        if result.is_err() && !value.is_zero() {
            // value never left the account
            *self.balance.lock() += value;
        }
        result
    }
}

/// Minimal substrate with no contract code: plain value transfers succeed at
/// a flat gas cost, any call carrying data reverts.
pub struct ValueTransferExecutor {
    received: Mutex<HashMap<Address, U256>>,
    transfer_gas: U256,
}

impl ValueTransferExecutor {
    pub fn new(transfer_gas: u64) -> Self {
        Self {
            received: Mutex::new(HashMap::new()),
            transfer_gas: U256::from(transfer_gas),
        }
    }

    pub fn received(&self, address: Address) -> U256 {
        self.received
            .lock()
            .get(&address)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CallExecutor for ValueTransferExecutor {
    async fn call(
        &self,
        _from: Address,
        target: Address,
        value: U256,
        data: &Bytes,
        gas_limit: U256,
    ) -> Result<Metered<Bytes>, CallFailure> {
        if self.transfer_gas > gas_limit {
            return Err(CallFailure::OutOfGas);
        }
        if !data.is_empty() {
            return Err(CallFailure::revert("no code at target", self.transfer_gas));
        }
        let mut received = self.received.lock();
        let balance = received.entry(target).or_default();
        *balance = balance.saturating_add(value);
        Ok(Metered::new(Bytes::default(), self.transfer_gas))
    }
}
