//! Account ledger
//!
//! The protocol handlers only see the [`Ledger`] trait. Two backends are
//! provided: an in-memory book and a CSV-persisted one.

pub mod csv_store;
pub mod memory;

pub use csv_store::CsvLedger;
pub use memory::MemoryLedger;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Number given to the first account a bank opens
pub const FIRST_ACCOUNT: u64 = 10001;

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Account {0} does not exist")]
    AccountNotFound(u64),
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Account {0} has a non-zero balance")]
    NonZeroBalance(u64),
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),
    #[error("Balance overflow")]
    Overflow,
    #[error("Ledger lock poisoned")]
    Poisoned,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] ::csv::Error),
}

/// Operations the request handlers need from the account store
pub trait Ledger: Send + Sync {
    fn open_account(&self, bank: Ipv4Addr) -> Result<u64, LedgerError>;
    fn deposit(&self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError>;
    fn withdraw(&self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError>;
    fn balance(&self, account: u64, bank: Ipv4Addr) -> Result<i64, LedgerError>;
    fn remove(&self, account: u64, bank: Ipv4Addr) -> Result<(), LedgerError>;
    fn total_balance(&self) -> Result<i64, LedgerError>;
    fn account_count(&self) -> Result<u64, LedgerError>;

    /// Short name of the persistence strategy, for monitoring
    fn strategy_name(&self) -> &'static str;
}

/// One persisted account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account: u64,
    pub bank: Ipv4Addr,
    pub balance: i64,
}

/// Account book shared by the ledger backends
///
/// Account numbers are never handed out twice: each bank keeps a high-water
/// mark that only grows, even when its newest account is removed.
#[derive(Debug, Clone, Default)]
pub struct Accounts {
    balances: BTreeMap<(Ipv4Addr, u64), i64>,
    next: BTreeMap<Ipv4Addr, u64>,
}

impl Accounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = AccountRecord>) -> Self {
        let mut accounts = Self::default();
        for record in records {
            accounts.reserve(record.bank, record.account.saturating_add(1));
            accounts
                .balances
                .insert((record.bank, record.account), record.balance);
        }
        accounts
    }

    /// Raise the next number for `bank` to at least `next`
    pub fn reserve(&mut self, bank: Ipv4Addr, next: u64) {
        let mark = self.next.entry(bank).or_insert(FIRST_ACCOUNT);
        *mark = (*mark).max(next);
    }

    /// Next number each bank will hand out
    pub fn next_numbers(&self) -> &BTreeMap<Ipv4Addr, u64> {
        &self.next
    }

    pub fn records(&self) -> Vec<AccountRecord> {
        self.balances
            .iter()
            .map(|(&(bank, account), &balance)| AccountRecord {
                account,
                bank,
                balance,
            })
            .collect()
    }

    fn entry(&mut self, account: u64, bank: Ipv4Addr) -> Result<&mut i64, LedgerError> {
        self.balances
            .get_mut(&(bank, account))
            .ok_or(LedgerError::AccountNotFound(account))
    }

    fn check_amount(amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        Ok(())
    }

    pub fn open(&mut self, bank: Ipv4Addr) -> u64 {
        let mark = self.next.entry(bank).or_insert(FIRST_ACCOUNT);
        let number = *mark;
        *mark = number.saturating_add(1);
        self.balances.insert((bank, number), 0);
        number
    }

    pub fn deposit(&mut self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError> {
        Self::check_amount(amount)?;
        let balance = self.entry(account, bank)?;
        *balance = balance.checked_add(amount).ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    pub fn withdraw(&mut self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError> {
        Self::check_amount(amount)?;
        let balance = self.entry(account, bank)?;
        if amount > *balance {
            return Err(LedgerError::InsufficientFunds);
        }
        *balance -= amount;
        Ok(())
    }

    pub fn balance(&self, account: u64, bank: Ipv4Addr) -> Result<i64, LedgerError> {
        self.balances
            .get(&(bank, account))
            .copied()
            .ok_or(LedgerError::AccountNotFound(account))
    }

    pub fn remove(&mut self, account: u64, bank: Ipv4Addr) -> Result<(), LedgerError> {
        if *self.entry(account, bank)? != 0 {
            return Err(LedgerError::NonZeroBalance(account));
        }
        self.balances.remove(&(bank, account));
        Ok(())
    }

    pub fn total(&self) -> Result<i64, LedgerError> {
        self.balances
            .values()
            .try_fold(0i64, |sum, b| sum.checked_add(*b))
            .ok_or(LedgerError::Overflow)
    }

    pub fn count(&self) -> u64 {
        self.balances.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANK: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn test_open_accounts_are_distinct() {
        let mut accounts = Accounts::new();
        let a = accounts.open(BANK);
        let b = accounts.open(BANK);
        let c = accounts.open(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(a, FIRST_ACCOUNT);
        assert_ne!(a, b);
        assert_eq!(c, FIRST_ACCOUNT);
    }

    #[test]
    fn test_numbering_continues_after_restore() {
        let mut accounts = Accounts::from_records(vec![AccountRecord {
            account: 10040,
            bank: BANK,
            balance: 5,
        }]);
        assert_eq!(accounts.open(BANK), 10041);
    }

    #[test]
    fn test_removed_number_not_reused() {
        let mut accounts = Accounts::new();
        let first = accounts.open(BANK);
        accounts.remove(first, BANK).unwrap();
        let second = accounts.open(BANK);
        assert_ne!(first, second);
        assert_eq!(second, FIRST_ACCOUNT + 1);
    }

    #[test]
    fn test_reserve_only_raises() {
        let mut accounts = Accounts::new();
        accounts.reserve(BANK, 10050);
        accounts.reserve(BANK, 10010);
        assert_eq!(accounts.open(BANK), 10050);
        assert_eq!(accounts.next_numbers().get(&BANK), Some(&10051));
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut accounts = Accounts::new();
        let acc = accounts.open(BANK);
        accounts.deposit(acc, BANK, 100).unwrap();
        accounts.withdraw(acc, BANK, 40).unwrap();
        assert_eq!(accounts.balance(acc, BANK).unwrap(), 60);

        assert!(matches!(
            accounts.withdraw(acc, BANK, 61),
            Err(LedgerError::InsufficientFunds)
        ));
        assert_eq!(accounts.balance(acc, BANK).unwrap(), 60);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut accounts = Accounts::new();
        let acc = accounts.open(BANK);
        assert!(matches!(
            accounts.deposit(acc, BANK, -1),
            Err(LedgerError::InvalidAmount(-1))
        ));
        assert!(matches!(
            accounts.withdraw(acc, BANK, -1),
            Err(LedgerError::InvalidAmount(-1))
        ));
    }

    #[test]
    fn test_overflow_rejected() {
        let mut accounts = Accounts::new();
        let acc = accounts.open(BANK);
        accounts.deposit(acc, BANK, i64::MAX).unwrap();
        assert!(matches!(
            accounts.deposit(acc, BANK, 1),
            Err(LedgerError::Overflow)
        ));
    }

    #[test]
    fn test_remove_requires_zero_balance() {
        let mut accounts = Accounts::new();
        let empty = accounts.open(BANK);
        let funded = accounts.open(BANK);
        accounts.deposit(funded, BANK, 10).unwrap();

        accounts.remove(empty, BANK).unwrap();
        assert!(matches!(
            accounts.balance(empty, BANK),
            Err(LedgerError::AccountNotFound(n)) if n == empty
        ));

        assert!(matches!(
            accounts.remove(funded, BANK),
            Err(LedgerError::NonZeroBalance(_))
        ));
        assert_eq!(accounts.balance(funded, BANK).unwrap(), 10);
    }

    #[test]
    fn test_totals() {
        let mut accounts = Accounts::new();
        let a = accounts.open(BANK);
        let b = accounts.open(BANK);
        accounts.deposit(a, BANK, 30).unwrap();
        accounts.deposit(b, BANK, 12).unwrap();
        assert_eq!(accounts.total().unwrap(), 42);
        assert_eq!(accounts.count(), 2);
    }

    #[test]
    fn test_missing_account() {
        let mut accounts = Accounts::new();
        assert!(matches!(
            accounts.deposit(99, BANK, 1),
            Err(LedgerError::AccountNotFound(99))
        ));
        let acc = accounts.open(BANK);
        // Same number, different bank
        assert!(accounts.balance(acc, Ipv4Addr::new(10, 0, 0, 9)).is_err());
    }
}
