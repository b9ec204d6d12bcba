// src/events.rs
use std::collections::VecDeque;

use ethers::types::{Address, H256, U256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Records emitted by the ledger and the orchestrator, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum EntryPointEvent {
    Deposited {
        account: Address,
        total_deposit: U256,
    },
    Withdrawn {
        account: Address,
        withdraw_address: Address,
        amount: U256,
    },
    StakeLocked {
        account: Address,
        total_staked: U256,
        unstake_delay_sec: u32,
    },
    StakeUnlocked {
        account: Address,
        withdraw_time: u64,
    },
    StakeWithdrawn {
        account: Address,
        withdraw_address: Address,
        amount: U256,
    },
    BeforeExecution,
    UserOperationEvent {
        user_op_hash: H256,
        sender: Address,
        paymaster: Option<Address>,
        nonce: U256,
        success: bool,
        actual_gas_cost: U256,
        actual_gas_used: U256,
    },
    UserOperationRevertReason {
        user_op_hash: H256,
        sender: Address,
        nonce: U256,
        revert_reason: String,
    },
    BeneficiaryPaid {
        beneficiary: Address,
        amount: U256,
    },
}

/// Bounded in-memory event log. Once full, the oldest event is dropped for
/// each new one.
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<EntryPointEvent>>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl EventLog {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::default()
    }

    /// A zero capacity is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn emit(&self, event: EntryPointEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            if let Some(dropped) = events.pop_front() {
                trace!("Event log full, dropping {:?}", dropped);
            }
        }
        events.push_back(event);
    }

    /// Takes every event recorded so far, leaving the log empty.
    pub fn drain(&self) -> Vec<EntryPointEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<EntryPointEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
