//! CSV-persisted ledger
//!
//! The whole book is rewritten after every mutation. A mutation is applied to
//! a copy first and only becomes visible once the file has been replaced.
//! Next account numbers live in a second file next to the book, so a removed
//! number stays retired across restarts.

use crate::ledger::{AccountRecord, Accounts, Ledger, LedgerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Default file name inside the data directory
pub const ACCOUNTS_FILE: &str = "accounts.csv";

/// Row of the next-number file
#[derive(Debug, Serialize, Deserialize)]
struct NextNumber {
    bank: Ipv4Addr,
    next: u64,
}

/// Ledger backed by a CSV file with columns `account,bank,balance`
#[derive(Debug)]
pub struct CsvLedger {
    path: PathBuf,
    numbers_path: PathBuf,
    accounts: Mutex<Accounts>,
}

impl CsvLedger {
    /// Open the ledger at `path`, loading existing accounts if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let numbers_path = path.with_extension("next.csv");

        let mut accounts = if path.exists() {
            let loaded = Self::load(&path)?;
            log::info!("Loaded {} accounts from {}", loaded.count(), path.display());
            loaded
        } else {
            Accounts::new()
        };
        if numbers_path.exists() {
            let mut reader = ::csv::Reader::from_path(&numbers_path)?;
            for row in reader.deserialize::<NextNumber>() {
                let row = row?;
                accounts.reserve(row.bank, row.next);
            }
        }

        Ok(Self {
            path,
            numbers_path,
            accounts: Mutex::new(accounts),
        })
    }

    /// Open `accounts.csv` inside a data directory
    pub fn in_dir(data_dir: &Path) -> Result<Self, LedgerError> {
        Self::open(data_dir.join(ACCOUNTS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Accounts, LedgerError> {
        let mut reader = ::csv::Reader::from_path(path)?;
        let records = reader
            .deserialize::<AccountRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Accounts::from_records(records))
    }

    /// Write `rows` to a temp file and rename it over `path`
    fn replace<T: Serialize>(
        path: &Path,
        rows: impl IntoIterator<Item = T>,
    ) -> Result<(), LedgerError> {
        let temp_path = path.with_extension("tmp");
        {
            let mut writer = ::csv::Writer::from_path(&temp_path)?;
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }

        // Atomic rename
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn save(&self, accounts: &Accounts) -> Result<(), LedgerError> {
        let numbers = accounts
            .next_numbers()
            .iter()
            .map(|(&bank, &next)| NextNumber { bank, next });
        Self::replace(&self.numbers_path, numbers)?;
        Self::replace(&self.path, accounts.records())
    }

    fn accounts(&self) -> Result<MutexGuard<'_, Accounts>, LedgerError> {
        self.accounts.lock().map_err(|_| LedgerError::Poisoned)
    }

    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut Accounts) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut accounts = self.accounts()?;
        let mut next = accounts.clone();
        let result = op(&mut next)?;
        self.save(&next)?;
        *accounts = next;
        Ok(result)
    }
}

impl Ledger for CsvLedger {
    fn open_account(&self, bank: Ipv4Addr) -> Result<u64, LedgerError> {
        self.mutate(|accounts| Ok(accounts.open(bank)))
    }

    fn deposit(&self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError> {
        self.mutate(|accounts| accounts.deposit(account, bank, amount))
    }

    fn withdraw(&self, account: u64, bank: Ipv4Addr, amount: i64) -> Result<(), LedgerError> {
        self.mutate(|accounts| accounts.withdraw(account, bank, amount))
    }

    fn balance(&self, account: u64, bank: Ipv4Addr) -> Result<i64, LedgerError> {
        self.accounts()?.balance(account, bank)
    }

    fn remove(&self, account: u64, bank: Ipv4Addr) -> Result<(), LedgerError> {
        self.mutate(|accounts| accounts.remove(account, bank))
    }

    fn total_balance(&self) -> Result<i64, LedgerError> {
        self.accounts()?.total()
    }

    fn account_count(&self) -> Result<u64, LedgerError> {
        Ok(self.accounts()?.count())
    }

    fn strategy_name(&self) -> &'static str {
        "CSV"
    }
}
