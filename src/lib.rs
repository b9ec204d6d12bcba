// src/lib.rs
//! Proof-gated account-abstraction entry point.
//!
//! A relayer submits an ordered batch of user operations together with one
//! succinct proof. The [`entry_point::EntryPoint`] checks that proof against
//! a commitment to the exact batch, then validates, executes and settles each
//! operation against its account and either a paymaster or the account's own
//! deposit in the [`ledger::DepositLedger`].

pub mod account;
pub mod clock;
pub mod config;
pub mod entry_point;
pub mod error;
pub mod events;
pub mod ledger;
pub mod nonce;
pub mod paymaster;
pub mod registry;
pub mod rpc;
pub mod types;
pub mod verifier;

pub use entry_point::EntryPoint;
pub use error::{EntryPointError, LedgerError, ValidationFailure};
pub use types::{BatchReport, DepositInfo, UserOperation};
