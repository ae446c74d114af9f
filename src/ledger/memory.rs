//! In-memory ledger

use crate::ledger::{Accounts, Ledger, LedgerError};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

/// Ledger kept entirely in memory; contents are lost on exit
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: Mutex<Accounts>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn accounts(&self) -> Result<MutexGuard<'_, Accounts>, LedgerError> {
        self.accounts.lock().map_err(|_| LedgerError::Poisoned)
    }
}

impl Ledger for MemoryLedger {
    fn open_account(&self, bank: Ipv4Addr) -> Result<u64, LedgerError> {
        Ok(self.accounts()?.open(bank))
    }

    fn deposit(&self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError> {
        self.accounts()?.deposit(account, bank, amount)
    }

    fn withdraw(&self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError> {
        self.accounts()?.withdraw(account, bank, amount)
    }

    fn balance(&self, account: u64, bank: Ipv4Addr) -> Result<i64, LedgerError> {
        self.accounts()?.balance(account, bank)
    }

    fn remove(&self, account: u64, bank: Ipv4Addr) -> Result<(), LedgerError> {
        self.accounts()?.remove(account, bank)
    }

    fn total_balance(&self) -> Result<i64, LedgerError> {
        self.accounts()?.total()
    }

    fn account_count(&self) -> Result<u64, LedgerError> {
        Ok(self.accounts()?.count())
    }

    fn strategy_name(&self) -> &'static str {
        "MEMORY"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANK: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 10);

    #[test]
    fn test_repeated_open_returns_distinct_numbers() {
        let ledger = MemoryLedger::new();
        let numbers: Vec<u64> = (0..5).map(|_| ledger.open_account(BANK).unwrap()).collect();
        let mut unique = numbers.clone();
        unique.dedup();
        assert_eq!(unique.len(), numbers.len());
        assert_eq!(ledger.account_count().unwrap(), 5);
    }

    #[test]
    fn test_open_after_remove_gets_new_number() {
        let ledger = MemoryLedger::new();
        let first = ledger.open_account(BANK).unwrap();
        ledger.remove(first, BANK).unwrap();
        let second = ledger.open_account(BANK).unwrap();
        assert_ne!(first, second);
        assert_eq!(ledger.account_count().unwrap(), 1);
    }

    #[test]
    fn test_balance_after_deposit() {
        let ledger = MemoryLedger::new();
        let acc = ledger.open_account(BANK).unwrap();
        ledger.deposit(acc, BANK, 250).unwrap();
        assert_eq!(ledger.balance(acc, BANK).unwrap(), 250);
        assert_eq!(ledger.total_balance().unwrap(), 250);
    }
}
