// src/ledger.rs
//! Deposit and stake bookkeeping for accounts and paymasters.
//!
//! Balances held here are independent of anything on the accounts
//! themselves. Every record sits behind its own lock, so a settlement for one
//! payer never waits on another.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::{Address, U256};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{InvariantViolation, LedgerError};
use crate::events::{EntryPointEvent, EventLog};
use crate::types::DepositInfo;

type Record = Arc<Mutex<DepositInfo>>;

pub struct DepositLedger {
    records: RwLock<HashMap<Address, Record>>,
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
}

impl DepositLedger {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<EventLog>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
            events,
        }
    }

    fn existing(&self, account: Address) -> Option<Record> {
        self.records.read().get(&account).cloned()
    }

    fn record(&self, account: Address) -> Record {
        if let Some(record) = self.existing(account) {
            return record;
        }
        self.records
            .write()
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(DepositInfo::default())))
            .clone()
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.existing(account)
            .map(|record| record.lock().deposit)
            .unwrap_or_default()
    }

    pub fn deposit_info(&self, account: Address) -> DepositInfo {
        self.existing(account)
            .map(|record| record.lock().clone())
            .unwrap_or_default()
    }

    /// Credits `amount` to the account's deposit. Repeated calls add up.
    pub fn deposit_to(&self, account: Address, amount: U256) -> Result<U256, LedgerError> {
        let record = self.record(account);
        let total_deposit = {
            let mut info = record.lock();
            info.deposit = info
                .deposit
                .checked_add(amount)
                .ok_or(LedgerError::Overflow { account })?;
            info.deposit
        };
        debug!("Deposited {} for {}, total {}", amount, account, total_deposit);
        self.events.emit(EntryPointEvent::Deposited {
            account,
            total_deposit,
        });
        Ok(total_deposit)
    }

    pub fn withdraw_to(
        &self,
        account: Address,
        withdraw_address: Address,
        amount: U256,
    ) -> Result<(), LedgerError> {
        let record = self.existing(account).ok_or(LedgerError::InsufficientBalance {
            account,
            amount,
            balance: U256::zero(),
        })?;
        {
            let mut info = record.lock();
            if amount > info.deposit {
                return Err(LedgerError::InsufficientBalance {
                    account,
                    amount,
                    balance: info.deposit,
                });
            }
            info.deposit -= amount;
        }
        info!("Withdrew {} from {} to {}", amount, account, withdraw_address);
        self.events.emit(EntryPointEvent::Withdrawn {
            account,
            withdraw_address,
            amount,
        });
        Ok(())
    }

    /// Locks `amount` of freshly supplied value as stake.
    pub fn add_stake(
        &self,
        account: Address,
        amount: U256,
        unstake_delay_sec: u32,
    ) -> Result<U256, LedgerError> {
        if unstake_delay_sec == 0 {
            return Err(LedgerError::ZeroUnstakeDelay);
        }
        let record = self.record(account);
        let total_staked = {
            let mut info = record.lock();
            if unstake_delay_sec < info.unstake_delay_sec {
                return Err(LedgerError::StakeDelayDecreased {
                    requested: unstake_delay_sec,
                    current: info.unstake_delay_sec,
                });
            }
            let stake = info
                .stake
                .checked_add(amount)
                .ok_or(LedgerError::Overflow { account })?;
            if stake.is_zero() {
                return Err(LedgerError::NoStakeSpecified);
            }
            info.stake = stake;
            info.staked = true;
            info.unstake_delay_sec = unstake_delay_sec;
            info.withdraw_time = 0;
            stake
        };
        info!(
            "Stake locked for {}: {} with delay {}s",
            account, total_staked, unstake_delay_sec
        );
        self.events.emit(EntryPointEvent::StakeLocked {
            account,
            total_staked,
            unstake_delay_sec,
        });
        Ok(total_staked)
    }

    /// Starts the unstake timer. Funds stay locked until `withdraw_time`.
    pub fn unlock_stake(&self, account: Address) -> Result<u64, LedgerError> {
        let record = self.existing(account).ok_or(LedgerError::NotStaked)?;
        let withdraw_time = {
            let mut info = record.lock();
            if info.stake.is_zero() {
                return Err(LedgerError::NotStaked);
            }
            if !info.staked {
                return Err(LedgerError::AlreadyUnstaking);
            }
            info.withdraw_time = self
                .clock
                .now()
                .checked_add(u64::from(info.unstake_delay_sec))
                .ok_or(LedgerError::Overflow { account })?;
            info.staked = false;
            info.withdraw_time
        };
        info!("Stake unlocked for {}, withdrawable at {}", account, withdraw_time);
        self.events.emit(EntryPointEvent::StakeUnlocked {
            account,
            withdraw_time,
        });
        Ok(withdraw_time)
    }

    pub fn withdraw_stake(
        &self,
        account: Address,
        withdraw_address: Address,
    ) -> Result<U256, LedgerError> {
        let record = self.existing(account).ok_or(LedgerError::NoStake)?;
        let amount = {
            let mut info = record.lock();
            if info.stake.is_zero() {
                return Err(LedgerError::NoStake);
            }
            if info.withdraw_time == 0 {
                return Err(LedgerError::StakeNotUnlocked);
            }
            let now = self.clock.now();
            if now < info.withdraw_time {
                return Err(LedgerError::StakeWithdrawalNotDue {
                    withdraw_time: info.withdraw_time,
                    now,
                });
            }
            let amount = info.stake;
            info.stake = U256::zero();
            info.withdraw_time = 0;
            info.unstake_delay_sec = 0;
            amount
        };
        info!(
            "Stake withdrawn for {}: {} to {}",
            account, amount, withdraw_address
        );
        self.events.emit(EntryPointEvent::StakeWithdrawn {
            account,
            withdraw_address,
            amount,
        });
        Ok(amount)
    }

    /// Takes `amount` out of the payer's deposit ahead of execution.
    pub fn reserve(&self, payer: Address, amount: U256) -> Result<(), LedgerError> {
        let record = self.existing(payer).ok_or(LedgerError::InsufficientBalance {
            account: payer,
            amount,
            balance: U256::zero(),
        })?;
        let mut info = record.lock();
        if amount > info.deposit {
            return Err(LedgerError::InsufficientBalance {
                account: payer,
                amount,
                balance: info.deposit,
            });
        }
        info.deposit -= amount;
        Ok(())
    }

    /// Gives back a reservation that will not be used.
    pub fn release(&self, payer: Address, reserved: U256) {
        let record = self.record(payer);
        let mut info = record.lock();
        info.deposit = info.deposit.saturating_add(reserved);
    }

    /// Settles a reservation against the actual cost and returns what was charged.
    ///
    /// The charge never exceeds `reserved`. When `actual` is larger the whole
    /// reservation is kept and the violation is returned.
    pub fn settle(
        &self,
        payer: Address,
        reserved: U256,
        actual: U256,
    ) -> Result<U256, InvariantViolation> {
        if actual > reserved {
            return Err(InvariantViolation::PrefundBelowActualCost { reserved, actual });
        }
        let refund = reserved - actual;
        if !refund.is_zero() {
            let record = self.record(payer);
            let mut info = record.lock();
            // refund came out of this same record during reserve()
            info.deposit = info.deposit.saturating_add(refund);
        }
        Ok(actual)
    }

    /// Everything currently in custody: all deposits plus all stakes.
    pub fn total_held(&self) -> U256 {
        self.records
            .read()
            .values()
            .fold(U256::zero(), |total, record| {
                let info = record.lock();
                total
                    .saturating_add(info.deposit)
                    .saturating_add(info.stake)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (DepositLedger, Arc<ManualClock>, Arc<EventLog>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let events = Arc::new(EventLog::new());
        let ledger = DepositLedger::new(clock.clone(), events.clone());
        (ledger, clock, events)
    }

    fn eth(amount: u64) -> U256 {
        U256::from(amount) * U256::exp10(18)
    }

    #[test]
    fn deposit_is_additive() {
        let (ledger, _, events) = setup();
        let account = Address::repeat_byte(1);

        ledger.deposit_to(account, eth(1)).unwrap();
        ledger.deposit_to(account, eth(1)).unwrap();

        assert_eq!(ledger.balance_of(account), eth(2));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn introspection_does_not_create_records() {
        let (ledger, _, _) = setup();
        let account = Address::repeat_byte(2);

        assert_eq!(ledger.deposit_info(account), DepositInfo::default());
        assert_eq!(ledger.balance_of(account), U256::zero());
        assert!(ledger.records.read().is_empty());
    }

    #[test]
    fn withdraw_more_than_deposit_fails() {
        let (ledger, _, _) = setup();
        let account = Address::repeat_byte(3);
        ledger.deposit_to(account, U256::from(10)).unwrap();

        let err = ledger
            .withdraw_to(account, Address::zero(), U256::from(11))
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                account,
                amount: U256::from(11),
                balance: U256::from(10),
            }
        );

        ledger
            .withdraw_to(account, Address::zero(), U256::from(10))
            .unwrap();
        assert_eq!(ledger.balance_of(account), U256::zero());
    }

    #[test]
    fn stake_delay_is_monotonic() {
        let (ledger, _, _) = setup();
        let account = Address::repeat_byte(4);

        assert_eq!(
            ledger.add_stake(account, U256::one(), 0),
            Err(LedgerError::ZeroUnstakeDelay)
        );
        ledger.add_stake(account, U256::from(5), 100).unwrap();
        assert_eq!(
            ledger.add_stake(account, U256::from(5), 99),
            Err(LedgerError::StakeDelayDecreased {
                requested: 99,
                current: 100
            })
        );
        assert_eq!(ledger.add_stake(account, U256::from(5), 200), Ok(U256::from(10)));

        let info = ledger.deposit_info(account);
        assert!(info.staked);
        assert_eq!(info.unstake_delay_sec, 200);
        assert_eq!(info.deposit, U256::zero());
    }

    #[test]
    fn stake_lifecycle() {
        let (ledger, clock, _) = setup();
        let account = Address::repeat_byte(5);
        let dest = Address::repeat_byte(6);

        assert_eq!(
            ledger.withdraw_stake(account, dest),
            Err(LedgerError::NoStake)
        );
        ledger.add_stake(account, U256::from(50), 60).unwrap();
        assert_eq!(
            ledger.withdraw_stake(account, dest),
            Err(LedgerError::StakeNotUnlocked)
        );

        assert_eq!(ledger.unlock_stake(account), Ok(1_060));
        assert_eq!(
            ledger.unlock_stake(account),
            Err(LedgerError::AlreadyUnstaking)
        );

        clock.advance(59);
        assert_eq!(
            ledger.withdraw_stake(account, dest),
            Err(LedgerError::StakeWithdrawalNotDue {
                withdraw_time: 1_060,
                now: 1_059
            })
        );

        clock.advance(1);
        assert_eq!(ledger.withdraw_stake(account, dest), Ok(U256::from(50)));
        assert_eq!(ledger.deposit_info(account), DepositInfo::default());
    }

    #[test]
    fn unlock_time_overflow_is_rejected() {
        let (ledger, clock, _) = setup();
        let account = Address::repeat_byte(9);
        ledger.add_stake(account, eth(1), 100).unwrap();
        clock.set(u64::MAX - 10);

        assert_eq!(
            ledger.unlock_stake(account),
            Err(LedgerError::Overflow { account })
        );
        let info = ledger.deposit_info(account);
        assert!(info.staked);
        assert_eq!(info.withdraw_time, 0);
    }

    #[test]
    fn reserve_and_settle_refunds_difference() {
        let (ledger, _, _) = setup();
        let payer = Address::repeat_byte(7);
        ledger.deposit_to(payer, U256::from(1_000)).unwrap();

        ledger.reserve(payer, U256::from(600)).unwrap();
        assert_eq!(ledger.balance_of(payer), U256::from(400));

        assert_eq!(
            ledger.settle(payer, U256::from(600), U256::from(250)),
            Ok(U256::from(250))
        );
        assert_eq!(ledger.balance_of(payer), U256::from(750));
    }

    #[test]
    fn settle_never_charges_more_than_reserved() {
        let (ledger, _, _) = setup();
        let payer = Address::repeat_byte(8);
        ledger.deposit_to(payer, U256::from(1_000)).unwrap();
        ledger.reserve(payer, U256::from(100)).unwrap();

        assert_eq!(
            ledger.settle(payer, U256::from(100), U256::from(101)),
            Err(InvariantViolation::PrefundBelowActualCost {
                reserved: U256::from(100),
                actual: U256::from(101),
            })
        );
        assert_eq!(ledger.balance_of(payer), U256::from(900));
    }

    #[test]
    fn reserve_beyond_deposit_fails() {
        let (ledger, _, _) = setup();
        let payer = Address::repeat_byte(9);
        assert!(ledger.reserve(payer, U256::one()).is_err());

        ledger.deposit_to(payer, U256::from(3)).unwrap();
        assert!(ledger.reserve(payer, U256::from(4)).is_err());
        assert_eq!(ledger.balance_of(payer), U256::from(3));
    }

    #[test]
    fn total_held_tracks_deposits_and_stakes() {
        let (ledger, _, _) = setup();
        ledger.deposit_to(Address::repeat_byte(1), U256::from(10)).unwrap();
        ledger.add_stake(Address::repeat_byte(2), U256::from(5), 1).unwrap();
        ledger
            .withdraw_to(Address::repeat_byte(1), Address::zero(), U256::from(3))
            .unwrap();

        assert_eq!(ledger.total_held(), U256::from(12));
    }
}
