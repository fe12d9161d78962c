// =============================================================================
// Accounts and the append-only ledger
// =============================================================================
//
// Balance never changes outside a ledger entry: every mutation flows through
// `AccountBook::apply`, which appends the entry and stamps `balance_after`
// with the running sum. The book is written only by the engine task; readers
// take the locks briefly for snapshots.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::types::MarginMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Open,
    /// Margin level below the call threshold: no new orders.
    MarginCall,
    Suspended,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::MarginCall => write!(f, "MARGIN_CALL"),
            Self::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub currency: String,
    pub balance: f64,
    pub leverage: f64,
    pub margin_mode: MarginMode,
    pub status: AccountStatus,
    /// Demo accounts are always routed B-Book.
    #[serde(default)]
    pub demo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerType {
    Deposit,
    Withdraw,
    RealizedPnl,
    Commission,
    Swap,
    Adjustment,
}

/// One append-only ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub entry_type: LedgerType,
    pub amount: f64,
    /// Running balance after applying `amount`.
    pub balance_after: f64,
    /// Position / order id this entry refers to, when applicable.
    pub reference: Option<String>,
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

pub struct AccountBook {
    accounts: RwLock<HashMap<String, Account>>,
    ledger: RwLock<Vec<LedgerEntry>>,
    /// Optional JSONL append file mirroring every entry.
    ledger_file: Option<parking_lot::Mutex<std::fs::File>>,
}

impl AccountBook {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            ledger: RwLock::new(Vec::new()),
            ledger_file: None,
        }
    }

    /// Mirror the ledger to an append-only JSONL file.
    pub fn with_ledger_file(path: &str) -> std::io::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            accounts: RwLock::new(HashMap::new()),
            ledger: RwLock::new(Vec::new()),
            ledger_file: Some(parking_lot::Mutex::new(file)),
        })
    }

    /// Provision an account and record its opening balance as a deposit.
    pub fn provision(
        &self,
        id: &str,
        currency: &str,
        balance: f64,
        leverage: f64,
        margin_mode: MarginMode,
        demo: bool,
    ) {
        let account = Account {
            id: id.to_string(),
            currency: currency.to_string(),
            balance: 0.0,
            leverage,
            margin_mode,
            status: AccountStatus::Open,
            demo,
        };
        self.accounts.write().insert(id.to_string(), account);
        if balance > 0.0 {
            let _ = self.apply(id, LedgerType::Deposit, balance, None);
        }
        info!(account = id, balance, leverage, mode = %margin_mode, "account provisioned");
    }

    /// Append a ledger entry and move the balance. The only balance mutation
    /// path in the process.
    pub fn apply(
        &self,
        account_id: &str,
        entry_type: LedgerType,
        amount: f64,
        reference: Option<String>,
    ) -> Result<LedgerEntry, CoreError> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(account_id)
            .ok_or_else(|| CoreError::UnknownAccount(account_id.to_string()))?;

        account.balance += amount;
        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            entry_type,
            amount,
            balance_after: account.balance,
            reference,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        if account.balance < 0.0 {
            warn!(
                account = account_id,
                balance = account.balance,
                "account balance negative after {:?}",
                entry_type
            );
        }
        if let Some(file) = &self.ledger_file {
            use std::io::Write;
            if let Ok(line) = serde_json::to_string(&entry) {
                let mut file = file.lock();
                if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                    warn!(error = %e, "ledger file append failed");
                }
            }
        }
        self.ledger.write().push(entry.clone());
        Ok(entry)
    }

    pub fn get(&self, account_id: &str) -> Option<Account> {
        self.accounts.read().get(account_id).cloned()
    }

    pub fn require(&self, account_id: &str) -> Result<Account, CoreError> {
        self.get(account_id)
            .ok_or_else(|| CoreError::UnknownAccount(account_id.to_string()))
    }

    pub fn set_status(&self, account_id: &str, status: AccountStatus) {
        if let Some(account) = self.accounts.write().get_mut(account_id) {
            if account.status != status {
                info!(account = account_id, from = %account.status, to = %status, "account status");
                account.status = status;
            }
        }
    }

    pub fn all(&self) -> Vec<Account> {
        self.accounts.read().values().cloned().collect()
    }

    /// Ledger entries for one account, oldest first.
    pub fn entries_for(&self, account_id: &str, limit: usize) -> Vec<LedgerEntry> {
        let ledger = self.ledger.read();
        let filtered: Vec<LedgerEntry> = ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    /// Invariant check: balance equals the sum of all ledger amounts and the
    /// last `balance_after` matches. Used by tests and the health surface.
    pub fn verify_ledger(&self, account_id: &str) -> bool {
        let ledger = self.ledger.read();
        let mut running = 0.0;
        let mut count = 0usize;
        for entry in ledger.iter().filter(|e| e.account_id == account_id) {
            running += entry.amount;
            if (entry.balance_after - running).abs() > 1e-6 {
                return false;
            }
            count += 1;
        }
        match self.get(account_id) {
            Some(account) if count == 0 => account.balance.abs() < 1e-9,
            Some(account) => (account.balance - running).abs() < 1e-6,
            None => false,
        }
    }
}

impl Default for AccountBook {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn book_with_account() -> AccountBook {
        let book = AccountBook::new();
        book.provision("acc-1", "USD", 10_000.0, 100.0, MarginMode::Hedging, true);
        book
    }

    #[test]
    fn provision_records_deposit() {
        let book = book_with_account();
        let account = book.get("acc-1").unwrap();
        assert!((account.balance - 10_000.0).abs() < 1e-9);
        let entries = book.entries_for("acc-1", 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, LedgerType::Deposit);
        assert!((entries[0].balance_after - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn apply_moves_balance_and_appends() {
        let book = book_with_account();
        book.apply("acc-1", LedgerType::Commission, -0.50, Some("pos-1".into()))
            .unwrap();
        book.apply("acc-1", LedgerType::RealizedPnl, 48.0, Some("pos-1".into()))
            .unwrap();

        let account = book.get("acc-1").unwrap();
        assert!((account.balance - 10_047.50).abs() < 1e-6);

        let entries = book.entries_for("acc-1", 10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].entry_type, LedgerType::Commission);
        assert_eq!(entries[2].entry_type, LedgerType::RealizedPnl);
        assert!((entries[2].balance_after - 10_047.50).abs() < 1e-6);
        assert!(book.verify_ledger("acc-1"));
    }

    #[test]
    fn unknown_account_rejected() {
        let book = AccountBook::new();
        assert!(matches!(
            book.apply("ghost", LedgerType::Deposit, 1.0, None),
            Err(CoreError::UnknownAccount(_))
        ));
    }

    #[test]
    fn ledger_consistency_over_many_entries() {
        let book = book_with_account();
        for i in 0..50 {
            let amount = if i % 2 == 0 { 13.25 } else { -7.5 };
            book.apply("acc-1", LedgerType::Adjustment, amount, None).unwrap();
        }
        assert!(book.verify_ledger("acc-1"));
    }

    #[test]
    fn status_transitions() {
        let book = book_with_account();
        book.set_status("acc-1", AccountStatus::MarginCall);
        assert_eq!(book.get("acc-1").unwrap().status, AccountStatus::MarginCall);
        book.set_status("acc-1", AccountStatus::Open);
        assert_eq!(book.get("acc-1").unwrap().status, AccountStatus::Open);
    }
}
