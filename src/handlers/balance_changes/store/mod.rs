//! Ledger persistence.
//!
//! The ledger is the only authoritative state: every engine step re-derives
//! what to do next from it, so a crash at any point resumes correctly.

mod postgres;

pub use postgres::PgLedger;

use async_trait::async_trait;

use super::counterparty::Counterparty;
use super::error::LedgerResult;
use super::gap_detector::BalanceGap;
use super::types::{BalanceChange, MonitoredAccount};

#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Insert a validated record. Returns `false` when a record already exists
    /// for the same (account, block, token); existing records are never modified.
    async fn insert_balance_change(&self, change: &BalanceChange) -> LedgerResult<bool>;

    /// Chain breaks for one pair, records up to `up_to_block` inclusive, ascending.
    async fn find_gaps(
        &self,
        account_id: &str,
        token_id: &str,
        up_to_block: u64,
    ) -> LedgerResult<Vec<BalanceGap>>;

    /// Highest record at or below `up_to_block`.
    async fn latest_change(
        &self,
        account_id: &str,
        token_id: &str,
        up_to_block: u64,
    ) -> LedgerResult<Option<BalanceChange>>;

    async fn earliest_change(
        &self,
        account_id: &str,
        token_id: &str,
    ) -> LedgerResult<Option<BalanceChange>>;

    /// Distinct token ids with at least one record for the account.
    async fn tracked_tokens(&self, account_id: &str) -> LedgerResult<Vec<String>>;

    /// Enabled monitored accounts ordered by account id.
    async fn enabled_accounts(&self) -> LedgerResult<Vec<MonitoredAccount>>;

    async fn monitored_account(&self, account_id: &str) -> LedgerResult<Option<MonitoredAccount>>;

    async fn mark_synced(&self, account_id: &str) -> LedgerResult<()>;

    async fn get_counterparty(&self, account_id: &str) -> LedgerResult<Option<Counterparty>>;

    async fn upsert_counterparty(&self, counterparty: &Counterparty) -> LedgerResult<()>;
}
