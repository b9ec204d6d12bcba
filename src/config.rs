// src/config.rs
use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::events::EventLog;

/// What happens to a batch's net gas revenue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum BeneficiaryPolicy {
    /// Credit the beneficiary's deposit in the ledger.
    CreditDeposit,
    /// Pay out of the ledger straight away.
    Transfer,
}

#[derive(Debug, Clone)]
pub struct EntryPointConfig {
    /// Address of the entry point itself; also where retained overhead is credited.
    pub address: Address,
    pub chain_id: u64,
    /// Gas the orchestrator spends per batch, proof verification included.
    pub overhead_gas: U256,
    pub base_fee: U256,
    pub beneficiary_policy: BeneficiaryPolicy,
    /// Most events kept in memory before the oldest are dropped.
    pub event_log_capacity: usize,
}

impl Default for EntryPointConfig {
    fn default() -> Self {
        Self {
            address: Address::zero(),
            chain_id: 1,
            overhead_gas: U256::zero(),
            base_fee: U256::zero(),
            beneficiary_policy: BeneficiaryPolicy::CreditDeposit,
            event_log_capacity: EventLog::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, env = "RPC_SERVER_ADDR", default_value = "127.0.0.1:8545")]
    pub rpc_server_addr: String,

    #[clap(short, long, env = "CHAIN_ID")]
    pub chain_id: u64,

    #[clap(short, long, env = "ENTRY_POINT_ADDRESS")]
    pub entry_point: Address,

    #[clap(long, env = "OVERHEAD_GAS", default_value_t = 0)]
    pub overhead_gas: u64,

    #[clap(long, env = "BASE_FEE", default_value_t = 1_000_000_000)]
    pub base_fee: u64,

    #[clap(long, value_enum, env = "BENEFICIARY_POLICY", default_value_t = BeneficiaryPolicy::CreditDeposit)]
    pub beneficiary_policy: BeneficiaryPolicy,

    /// Hex domain tag for the digest proof verifier.
    #[clap(long, env = "VERIFIER_DOMAIN")]
    pub verifier_domain: Option<String>,

    /// Signer key of the built-in verifying paymaster.
    #[clap(short, long, env = "PAYMASTER_PRIVATE_KEY")]
    pub private_key: Option<String>,

    #[clap(long, env = "EVENT_LOG_CAPACITY", default_value_t = EventLog::DEFAULT_CAPACITY)]
    pub event_log_capacity: usize,

    #[clap(long, env = "PAYMASTER_ADDRESS")]
    pub paymaster_address: Option<Address>,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: Level,
}

impl Args {
    pub fn entry_point_config(&self) -> EntryPointConfig {
        EntryPointConfig {
            address: self.entry_point,
            chain_id: self.chain_id,
            overhead_gas: U256::from(self.overhead_gas),
            base_fee: U256::from(self.base_fee),
            beneficiary_policy: self.beneficiary_policy,
            event_log_capacity: self.event_log_capacity,
        }
    }

    pub fn verifier_domain(&self) -> anyhow::Result<H256> {
        let Some(raw) = &self.verifier_domain else {
            return Ok(H256::zero());
        };
        let bytes = hex::decode(raw.trim_start_matches("0x")).context("verifier domain is not hex")?;
        if bytes.len() != 32 {
            bail!("verifier domain must be 32 bytes, got {}", bytes.len());
        }
        Ok(H256::from_slice(&bytes))
    }
}
