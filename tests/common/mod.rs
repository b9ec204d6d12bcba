#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{id, parse_ether};
use parking_lot::Mutex;

use zk_entrypoint::account::{encode_execute, CallExecutor, Metered, SimpleAccount};
use zk_entrypoint::clock::ManualClock;
use zk_entrypoint::config::{BeneficiaryPolicy, EntryPointConfig};
use zk_entrypoint::error::CallFailure;
use zk_entrypoint::paymaster::{Paymaster, PaymasterValidation};
use zk_entrypoint::registry::Registry;
use zk_entrypoint::types::{PostOpMode, UserOperation};
use zk_entrypoint::verifier::DigestVerifier;
use zk_entrypoint::EntryPoint;

pub const CHAIN_ID: u64 = 1337;
pub const START_TIME: u64 = 1_700_000_000;
pub const BASE_FEE: u64 = 7;
pub const TRANSFER_GAS: u64 = 35_000;
pub const OVERHEAD_GAS: u64 = 50_000;

pub fn entry_point_address() -> Address {
    Address::repeat_byte(0xee)
}

pub fn beneficiary() -> Address {
    Address::repeat_byte(0xbe)
}

pub fn paymaster_address() -> Address {
    Address::repeat_byte(0x50)
}

pub fn token_address() -> Address {
    Address::repeat_byte(0x70)
}

pub fn one_eth() -> U256 {
    parse_ether(1).unwrap()
}

/// An ERC-20 style token living in the substrate; only understands
/// `transfer(address,uint256)` sent to its own address.
pub struct TokenExecutor {
    balances: Mutex<HashMap<Address, U256>>,
    transfer_gas: U256,
}

impl TokenExecutor {
    pub fn new(transfer_gas: u64) -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            transfer_gas: U256::from(transfer_gas),
        }
    }

    pub fn mint(&self, to: Address, amount: U256) {
        *self.balances.lock().entry(to).or_default() += amount;
    }

    pub fn balance_of(&self, owner: Address) -> U256 {
        self.balances.lock().get(&owner).copied().unwrap_or_default()
    }

    pub fn transfer_call(to: Address, amount: U256) -> Bytes {
        let mut data = id("transfer(address,uint256)").to_vec();
        data.extend_from_slice(&encode(&[Token::Address(to), Token::Uint(amount)]));
        Bytes::from(data)
    }
}

#[async_trait]
impl CallExecutor for TokenExecutor {
    async fn call(
        &self,
        from: Address,
        target: Address,
        _value: U256,
        data: &Bytes,
        gas_limit: U256,
    ) -> Result<Metered<Bytes>, CallFailure> {
        if self.transfer_gas > gas_limit {
            return Err(CallFailure::OutOfGas);
        }
        if target != token_address() || data.len() < 4 {
            return Err(CallFailure::revert("not a token call", U256::from(2_600)));
        }
        let tokens = decode(&[ParamType::Address, ParamType::Uint(256)], &data[4..])
            .map_err(|_| CallFailure::revert("bad calldata", U256::from(2_600)))?;
        let (to, amount) = match tokens.as_slice() {
            [Token::Address(to), Token::Uint(amount)] => (*to, *amount),
            _ => return Err(CallFailure::revert("bad calldata", U256::from(2_600))),
        };

        let mut balances = self.balances.lock();
        let from_balance = balances.get(&from).copied().unwrap_or_default();
        if amount > from_balance {
            return Err(CallFailure::revert(
                "ERC20: transfer amount exceeds balance",
                U256::from(5_000),
            ));
        }
        balances.insert(from, from_balance - amount);
        *balances.entry(to).or_default() += amount;
        Ok(Metered::new(Bytes::from(vec![1]), self.transfer_gas))
    }
}

/// Sponsors everything, like a bare test paymaster, with tunable gas and a
/// switch to make `post_op` revert.
pub struct TestPaymaster {
    pub validation_gas: U256,
    pub post_op_gas: U256,
    pub fail_post_op: bool,
    pub post_op_modes: Mutex<Vec<PostOpMode>>,
    pub validations: AtomicUsize,
}

impl TestPaymaster {
    pub fn new() -> Self {
        Self {
            validation_gas: U256::from(20_000),
            post_op_gas: U256::from(15_000),
            fail_post_op: false,
            post_op_modes: Mutex::new(Vec::new()),
            validations: AtomicUsize::new(0),
        }
    }

    pub fn modes(&self) -> Vec<PostOpMode> {
        self.post_op_modes.lock().clone()
    }
}

#[async_trait]
impl Paymaster for TestPaymaster {
    async fn validate_paymaster_user_op(
        &self,
        _op: &UserOperation,
        _user_op_hash: H256,
        _max_cost: U256,
        gas_limit: U256,
    ) -> Result<Metered<PaymasterValidation>, CallFailure> {
        if self.validation_gas > gas_limit {
            return Err(CallFailure::OutOfGas);
        }
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(Metered::new(PaymasterValidation::default(), self.validation_gas))
    }

    async fn post_op(
        &self,
        mode: PostOpMode,
        _context: &Bytes,
        _actual_gas_cost: U256,
        gas_limit: U256,
    ) -> Result<Metered<()>, CallFailure> {
        self.post_op_modes.lock().push(mode);
        if self.fail_post_op {
            return Err(CallFailure::revert("postOp failed", U256::from(1_000)));
        }
        if self.post_op_gas > gas_limit {
            return Err(CallFailure::OutOfGas);
        }
        Ok(Metered::new((), self.post_op_gas))
    }
}

pub struct Harness {
    pub entry_point: Arc<EntryPoint>,
    pub registry: Arc<Registry>,
    pub token: Arc<TokenExecutor>,
    pub clock: Arc<ManualClock>,
    pub verifier: DigestVerifier,
    pub accounts: Vec<Arc<SimpleAccount>>,
}

pub fn config(policy: BeneficiaryPolicy) -> EntryPointConfig {
    EntryPointConfig {
        address: entry_point_address(),
        chain_id: CHAIN_ID,
        overhead_gas: U256::from(OVERHEAD_GAS),
        base_fee: U256::from(BASE_FEE),
        beneficiary_policy: policy,
        event_log_capacity: 100_000,
    }
}

pub fn setup() -> Harness {
    setup_with(config(BeneficiaryPolicy::CreditDeposit), TRANSFER_GAS)
}

pub fn setup_with(config: EntryPointConfig, transfer_gas: u64) -> Harness {
    let registry = Arc::new(Registry::new());
    let clock = Arc::new(ManualClock::new(START_TIME));
    let verifier = DigestVerifier::new(H256::repeat_byte(0x42));
    let entry_point = EntryPoint::new(
        config,
        registry.clone(),
        Arc::new(verifier),
        clock.clone(),
    );
    Harness {
        entry_point: Arc::new(entry_point),
        registry,
        token: Arc::new(TokenExecutor::new(transfer_gas)),
        clock,
        verifier,
        accounts: Vec::new(),
    }
}

impl Harness {
    /// Deploys a fresh account holding `tokens` and `native` balance; the
    /// owner address is derived from the same seed.
    pub fn fresh_account(&mut self, seed: u64, tokens: U256, native: U256) -> Address {
        let address = seeded_address(0xa0, seed);
        let owner = seeded_address(0x0a, seed);
        let account = Arc::new(SimpleAccount::new(address, owner, native, self.token.clone()));
        self.registry.register_account(address, account.clone());
        self.token.mint(address, tokens);
        self.accounts.push(account);
        address
    }

    pub fn add_test_paymaster(&self, paymaster: TestPaymaster) -> Arc<TestPaymaster> {
        let paymaster = Arc::new(paymaster);
        self.registry
            .register_paymaster(paymaster_address(), paymaster.clone());
        paymaster
    }

    /// Public inputs and a matching proof for exactly `ops`, in order.
    pub fn prove(&self, ops: &[UserOperation]) -> (Bytes, Vec<U256>) {
        let inputs = self.entry_point.public_inputs(ops);
        (self.verifier.prove(&inputs), inputs)
    }

    pub fn nonce(&self, sender: Address) -> U256 {
        self.entry_point.get_nonce(sender, U256::zero())
    }
}

pub fn seeded_address(prefix: u8, seed: u64) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = prefix;
    bytes[12..].copy_from_slice(&seed.to_be_bytes());
    Address::from(bytes)
}

pub fn owner_of(sender: Address) -> Address {
    let mut bytes = sender.to_fixed_bytes();
    bytes[0] = 0x0a;
    Address::from(bytes)
}

/// An operation that moves `amount` tokens from `sender` to `to`.
pub fn transfer_op(sender: Address, to: Address, amount: U256, nonce: u64) -> UserOperation {
    let transfer = TokenExecutor::transfer_call(to, amount);
    UserOperation {
        sender,
        nonce: U256::from(nonce),
        init_code: Bytes::default(),
        call_data: encode_execute(token_address(), U256::zero(), &transfer),
        call_gas_limit: U256::from(100_000),
        verification_gas_limit: U256::from(100_000),
        pre_verification_gas: U256::from(21_000),
        max_fee_per_gas: U256::from(1_016_982_020u64),
        max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        paymaster_and_data: Bytes::default(),
        signature: Bytes::default(),
    }
}

pub fn sponsored(mut op: UserOperation, paymaster: Address) -> UserOperation {
    op.paymaster_and_data = Bytes::from(paymaster.as_bytes().to_vec());
    op
}
