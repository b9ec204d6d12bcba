// src/rpc.rs
use std::sync::Arc;

use ethers::types::{Address, Bytes, H256, U256};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::error::{ErrorObject, ErrorObjectOwned};
use tracing::{debug, error, info};

use crate::account::{CallExecutor, SimpleAccount};
use crate::entry_point::EntryPoint;
use crate::error::{EntryPointError, LedgerError};
use crate::events::EntryPointEvent;
use crate::paymaster::VerifyingPaymaster;
use crate::types::{BatchReport, DepositInfo, PaymasterResponse, UserOperation};

pub const BATCH_ERROR_CODE: i32 = -32000;
pub const LEDGER_ERROR_CODE: i32 = -32001;
pub const UNAVAILABLE_ERROR_CODE: i32 = -32002;

// Define the RPC interface
#[rpc(server, namespace = "ep")]
pub trait EntryPointRpc {
    /// Authorizes a batch with one proof and runs every operation in it
    #[method(name = "handleOps")]
    async fn handle_ops(
        &self,
        ops: Vec<UserOperation>,
        proof: Bytes,
        public_inputs: Vec<U256>,
        beneficiary: Address,
    ) -> RpcResult<BatchReport>;

    /// Public inputs a proof must carry for this exact ordered batch
    #[method(name = "publicInputs")]
    async fn public_inputs(&self, ops: Vec<UserOperation>) -> RpcResult<Vec<U256>>;

    #[method(name = "getUserOpHash")]
    async fn get_user_op_hash(&self, op: UserOperation) -> RpcResult<H256>;

    #[method(name = "getNonce")]
    async fn get_nonce(&self, sender: Address, key: Option<U256>) -> RpcResult<U256>;

    #[method(name = "balanceOf")]
    async fn balance_of(&self, account: Address) -> RpcResult<U256>;

    #[method(name = "getDepositInfo")]
    async fn get_deposit_info(&self, account: Address) -> RpcResult<DepositInfo>;

    #[method(name = "depositTo")]
    async fn deposit_to(&self, account: Address, amount: U256) -> RpcResult<U256>;

    #[method(name = "withdrawTo")]
    async fn withdraw_to(
        &self,
        account: Address,
        withdraw_address: Address,
        amount: U256,
    ) -> RpcResult<bool>;

    #[method(name = "addStake")]
    async fn add_stake(
        &self,
        account: Address,
        amount: U256,
        unstake_delay_sec: u32,
    ) -> RpcResult<U256>;

    #[method(name = "unlockStake")]
    async fn unlock_stake(&self, account: Address) -> RpcResult<u64>;

    #[method(name = "withdrawStake")]
    async fn withdraw_stake(&self, account: Address, withdraw_address: Address)
        -> RpcResult<U256>;

    /// Takes every buffered event, oldest first, and clears the buffer
    #[method(name = "drainEvents")]
    async fn drain_events(&self) -> RpcResult<Vec<EntryPointEvent>>;

    #[method(name = "baseFee")]
    async fn base_fee(&self) -> RpcResult<U256>;

    /// Sets the base fee used to price gas for the next batches
    #[method(name = "setBaseFee")]
    async fn set_base_fee(&self, base_fee: U256) -> RpcResult<U256>;

    /// Registers a `SimpleAccount` backed by the node's execution substrate
    #[method(name = "deployAccount")]
    async fn deploy_account(
        &self,
        address: Address,
        owner: Address,
        balance: U256,
    ) -> RpcResult<bool>;

    /// Requests the built-in paymaster to sponsor a user operation
    #[method(name = "sponsorUserOperation")]
    async fn sponsor(&self, user_op: UserOperation) -> RpcResult<PaymasterResponse>;
}

pub struct EntryPointRpcImpl {
    entry_point: Arc<EntryPoint>,
    executor: Arc<dyn CallExecutor>,
    paymaster: Option<Arc<VerifyingPaymaster>>,
}

impl EntryPointRpcImpl {
    pub fn new(
        entry_point: Arc<EntryPoint>,
        executor: Arc<dyn CallExecutor>,
        paymaster: Option<Arc<VerifyingPaymaster>>,
    ) -> Self {
        Self {
            entry_point,
            executor,
            paymaster,
        }
    }
}

fn batch_error(e: EntryPointError) -> ErrorObjectOwned {
    error!("Batch rejected: {}", e);
    ErrorObject::owned(BATCH_ERROR_CODE, e.to_string(), None::<()>)
}

fn ledger_error(e: LedgerError) -> ErrorObjectOwned {
    debug!("Ledger call failed: {}", e);
    ErrorObject::owned(LEDGER_ERROR_CODE, e.to_string(), None::<()>)
}

#[async_trait]
impl EntryPointRpcServer for EntryPointRpcImpl {
    async fn handle_ops(
        &self,
        ops: Vec<UserOperation>,
        proof: Bytes,
        public_inputs: Vec<U256>,
        beneficiary: Address,
    ) -> RpcResult<BatchReport> {
        debug!("Received handleOps with {} operations", ops.len());
        self.entry_point
            .handle_ops(&ops, &proof, &public_inputs, beneficiary)
            .await
            .map_err(|e| batch_error(e).into())
    }

    async fn public_inputs(&self, ops: Vec<UserOperation>) -> RpcResult<Vec<U256>> {
        Ok(self.entry_point.public_inputs(&ops))
    }

    async fn get_user_op_hash(&self, op: UserOperation) -> RpcResult<H256> {
        Ok(self.entry_point.user_op_hash(&op))
    }

    async fn get_nonce(&self, sender: Address, key: Option<U256>) -> RpcResult<U256> {
        Ok(self
            .entry_point
            .get_nonce(sender, key.unwrap_or_default()))
    }

    async fn balance_of(&self, account: Address) -> RpcResult<U256> {
        Ok(self.entry_point.balance_of(account))
    }

    async fn get_deposit_info(&self, account: Address) -> RpcResult<DepositInfo> {
        Ok(self.entry_point.get_deposit_info(account))
    }

    async fn deposit_to(&self, account: Address, amount: U256) -> RpcResult<U256> {
        self.entry_point
            .ledger()
            .deposit_to(account, amount)
            .map_err(|e| ledger_error(e).into())
    }

    async fn withdraw_to(
        &self,
        account: Address,
        withdraw_address: Address,
        amount: U256,
    ) -> RpcResult<bool> {
        self.entry_point
            .ledger()
            .withdraw_to(account, withdraw_address, amount)
            .map(|()| true)
            .map_err(|e| ledger_error(e).into())
    }

    async fn add_stake(
        &self,
        account: Address,
        amount: U256,
        unstake_delay_sec: u32,
    ) -> RpcResult<U256> {
        self.entry_point
            .ledger()
            .add_stake(account, amount, unstake_delay_sec)
            .map_err(|e| ledger_error(e).into())
    }

    async fn unlock_stake(&self, account: Address) -> RpcResult<u64> {
        self.entry_point
            .ledger()
            .unlock_stake(account)
            .map_err(|e| ledger_error(e).into())
    }

    async fn withdraw_stake(
        &self,
        account: Address,
        withdraw_address: Address,
    ) -> RpcResult<U256> {
        self.entry_point
            .ledger()
            .withdraw_stake(account, withdraw_address)
            .map_err(|e| ledger_error(e).into())
    }

    async fn drain_events(&self) -> RpcResult<Vec<EntryPointEvent>> {
        let events = self.entry_point.events().drain();
        debug!("Drained {} events", events.len());
        Ok(events)
    }

    async fn base_fee(&self) -> RpcResult<U256> {
        Ok(self.entry_point.base_fee())
    }

    async fn set_base_fee(&self, base_fee: U256) -> RpcResult<U256> {
        let previous = self.entry_point.base_fee();
        self.entry_point.set_base_fee(base_fee);
        info!("Base fee changed from {} to {}", previous, base_fee);
        Ok(previous)
    }

    async fn deploy_account(
        &self,
        address: Address,
        owner: Address,
        balance: U256,
    ) -> RpcResult<bool> {
        if self.entry_point.registry().is_deployed(address) {
            return Ok(false);
        }
        let account = SimpleAccount::new(address, owner, balance, self.executor.clone());
        self.entry_point
            .registry()
            .register_account(address, Arc::new(account));
        Ok(true)
    }

    async fn sponsor(&self, user_op: UserOperation) -> RpcResult<PaymasterResponse> {
        debug!("Received sponsor request for sender: {}", user_op.sender);

        let Some(paymaster) = &self.paymaster else {
            return Err(ErrorObject::owned(
                UNAVAILABLE_ERROR_CODE,
                "No paymaster configured",
                None::<()>,
            )
            .into());
        };

        match paymaster.sponsor_user_operation(&user_op).await {
            Ok(response) => {
                info!("Successfully sponsored operation for {}", user_op.sender);
                Ok(response)
            }
            Err(e) => {
                error!("Failed to sponsor operation: {}", e);
                Err(ErrorObject::owned(
                    BATCH_ERROR_CODE,
                    format!("Paymaster error: {}", e),
                    None::<()>,
                )
                .into())
            }
        }
    }
}
