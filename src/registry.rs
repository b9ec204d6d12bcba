// src/registry.rs
use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::Address;
use parking_lot::RwLock;
use tracing::info;

use crate::account::Account;
use crate::paymaster::Paymaster;

/// Which accounts and paymasters exist at which addresses.
#[derive(Default)]
pub struct Registry {
    accounts: RwLock<HashMap<Address, Arc<dyn Account>>>,
    paymasters: RwLock<HashMap<Address, Arc<dyn Paymaster>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_account(&self, address: Address, account: Arc<dyn Account>) {
        info!("Registered account {}", address);
        self.accounts.write().insert(address, account);
    }

    pub fn register_paymaster(&self, address: Address, paymaster: Arc<dyn Paymaster>) {
        info!("Registered paymaster {}", address);
        self.paymasters.write().insert(address, paymaster);
    }

    pub fn account(&self, address: Address) -> Option<Arc<dyn Account>> {
        self.accounts.read().get(&address).cloned()
    }

    pub fn paymaster(&self, address: Address) -> Option<Arc<dyn Paymaster>> {
        self.paymasters.read().get(&address).cloned()
    }

    pub fn is_deployed(&self, address: Address) -> bool {
        self.accounts.read().contains_key(&address)
    }
}
