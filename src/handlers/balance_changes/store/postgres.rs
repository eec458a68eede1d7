//! Postgres-backed ledger.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::BalanceLedger;
use crate::handlers::balance_changes::counterparty::{Counterparty, CounterpartyType};
use crate::handlers::balance_changes::error::LedgerResult;
use crate::handlers::balance_changes::gap_detector::BalanceGap;
use crate::handlers::balance_changes::types::{BalanceChange, MonitoredAccount};
use crate::handlers::balance_changes::utils::block_timestamp_to_datetime;

const BALANCE_CHANGE_COLUMNS: &str = r#"
    account_id, token_id, block_height, block_timestamp, amount, balance_before,
    balance_after, counterparty, signer_id, receiver_id, transaction_hashes,
    receipt_id, actions, raw_data
"#;

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct GapRow {
    start_block: i64,
    end_block: i64,
    expected_before: BigDecimal,
    actual_before: BigDecimal,
}

#[derive(sqlx::FromRow)]
struct CounterpartyRow {
    account_id: String,
    account_type: String,
    token_symbol: Option<String>,
    token_name: Option<String>,
    token_decimals: Option<i16>,
    token_icon: Option<String>,
    discovered_at: DateTime<Utc>,
    last_verified_at: DateTime<Utc>,
}

impl From<CounterpartyRow> for Counterparty {
    fn from(row: CounterpartyRow) -> Self {
        Counterparty {
            account_id: row.account_id,
            account_type: CounterpartyType::parse(&row.account_type),
            token_symbol: row.token_symbol,
            token_name: row.token_name,
            token_decimals: row.token_decimals.and_then(|d| u8::try_from(d).ok()),
            token_icon: row.token_icon,
            discovered_at: row.discovered_at,
            last_verified_at: row.last_verified_at,
        }
    }
}

#[async_trait]
impl BalanceLedger for PgLedger {
    async fn insert_balance_change(&self, change: &BalanceChange) -> LedgerResult<bool> {
        change.validate()?;

        let result = sqlx::query(
            r#"
            INSERT INTO balance_changes
            (account_id, token_id, block_height, block_timestamp, block_time, amount,
             balance_before, balance_after, transaction_hashes, receipt_id, signer_id,
             receiver_id, counterparty, actions, raw_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (account_id, block_height, token_id) DO NOTHING
            "#,
        )
        .bind(&change.account_id)
        .bind(&change.token_id)
        .bind(change.block_height)
        .bind(change.block_timestamp)
        .bind(block_timestamp_to_datetime(change.block_timestamp))
        .bind(&change.amount)
        .bind(&change.balance_before)
        .bind(&change.balance_after)
        .bind(&change.transaction_hashes)
        .bind(&change.receipt_ids)
        .bind(&change.signer_id)
        .bind(&change.receiver_id)
        .bind(&change.counterparty)
        .bind(&change.actions)
        .bind(&change.raw_data)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_gaps(
        &self,
        account_id: &str,
        token_id: &str,
        up_to_block: u64,
    ) -> LedgerResult<Vec<BalanceGap>> {
        let rows = sqlx::query_as::<_, GapRow>(
            r#"
            WITH ordered AS (
                SELECT
                    block_height,
                    balance_before,
                    LAG(block_height) OVER w AS prev_block_height,
                    LAG(balance_after) OVER w AS prev_balance_after
                FROM balance_changes
                WHERE account_id = $1 AND token_id = $2 AND block_height <= $3
                WINDOW w AS (ORDER BY block_height)
            )
            SELECT
                prev_block_height AS start_block,
                block_height AS end_block,
                prev_balance_after AS expected_before,
                balance_before AS actual_before
            FROM ordered
            WHERE prev_block_height IS NOT NULL
              AND prev_balance_after <> balance_before
            ORDER BY block_height
            "#,
        )
        .bind(account_id)
        .bind(token_id)
        .bind(up_to_block as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| BalanceGap {
                account_id: account_id.to_string(),
                token_id: token_id.to_string(),
                start_block: row.start_block,
                end_block: row.end_block,
                expected_before: row.expected_before,
                actual_before: row.actual_before,
            })
            .collect())
    }

    async fn latest_change(
        &self,
        account_id: &str,
        token_id: &str,
        up_to_block: u64,
    ) -> LedgerResult<Option<BalanceChange>> {
        let query = format!(
            "SELECT {} FROM balance_changes
             WHERE account_id = $1 AND token_id = $2 AND block_height <= $3
             ORDER BY block_height DESC LIMIT 1",
            BALANCE_CHANGE_COLUMNS
        );
        let change = sqlx::query_as::<_, BalanceChange>(&query)
            .bind(account_id)
            .bind(token_id)
            .bind(up_to_block as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(change)
    }

    async fn earliest_change(
        &self,
        account_id: &str,
        token_id: &str,
    ) -> LedgerResult<Option<BalanceChange>> {
        let query = format!(
            "SELECT {} FROM balance_changes
             WHERE account_id = $1 AND token_id = $2
             ORDER BY block_height ASC LIMIT 1",
            BALANCE_CHANGE_COLUMNS
        );
        let change = sqlx::query_as::<_, BalanceChange>(&query)
            .bind(account_id)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(change)
    }

    async fn tracked_tokens(&self, account_id: &str) -> LedgerResult<Vec<String>> {
        let tokens: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT token_id FROM balance_changes WHERE account_id = $1 ORDER BY token_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens.into_iter().map(|(t,)| t).collect())
    }

    async fn enabled_accounts(&self) -> LedgerResult<Vec<MonitoredAccount>> {
        let accounts = sqlx::query_as::<_, MonitoredAccount>(
            r#"
            SELECT account_id, enabled, last_synced_at, created_at, updated_at
            FROM monitored_accounts
            WHERE enabled = true
            ORDER BY account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    async fn monitored_account(&self, account_id: &str) -> LedgerResult<Option<MonitoredAccount>> {
        let account = sqlx::query_as::<_, MonitoredAccount>(
            r#"
            SELECT account_id, enabled, last_synced_at, created_at, updated_at
            FROM monitored_accounts
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn mark_synced(&self, account_id: &str) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE monitored_accounts SET last_synced_at = NOW(), updated_at = NOW() WHERE account_id = $1",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_counterparty(&self, account_id: &str) -> LedgerResult<Option<Counterparty>> {
        let row = sqlx::query_as::<_, CounterpartyRow>(
            r#"
            SELECT account_id, account_type, token_symbol, token_name, token_decimals,
                   token_icon, discovered_at, last_verified_at
            FROM counterparties
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Counterparty::from))
    }

    async fn upsert_counterparty(&self, counterparty: &Counterparty) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO counterparties
            (account_id, account_type, token_symbol, token_name, token_decimals, token_icon,
             discovered_at, last_verified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (account_id) DO UPDATE SET
                account_type = EXCLUDED.account_type,
                token_symbol = COALESCE(EXCLUDED.token_symbol, counterparties.token_symbol),
                token_name = COALESCE(EXCLUDED.token_name, counterparties.token_name),
                token_decimals = COALESCE(EXCLUDED.token_decimals, counterparties.token_decimals),
                token_icon = COALESCE(EXCLUDED.token_icon, counterparties.token_icon),
                last_verified_at = EXCLUDED.last_verified_at
            "#,
        )
        .bind(&counterparty.account_id)
        .bind(counterparty.account_type.as_str())
        .bind(&counterparty.token_symbol)
        .bind(&counterparty.token_name)
        .bind(counterparty.token_decimals.map(i16::from))
        .bind(&counterparty.token_icon)
        .bind(counterparty.discovered_at)
        .bind(counterparty.last_verified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::balance_changes::types::Asset;

    fn record(block: u64, before: i64, after: i64) -> BalanceChange {
        BalanceChange::new(
            "alice.near",
            &Asset::Near,
            block,
            1_704_067_200_000_000_000,
            BigDecimal::from(before),
            BigDecimal::from(after),
            "bob.near",
        )
    }

    #[sqlx::test]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn test_insert_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
        let ledger = PgLedger::new(pool);
        let change = record(100, 0, 50);

        assert!(ledger.insert_balance_change(&change).await.unwrap());
        assert!(!ledger.insert_balance_change(&change).await.unwrap());

        let latest = ledger
            .latest_change("alice.near", "near", u64::MAX >> 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, change);
        Ok(())
    }

    #[sqlx::test]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn test_lag_query_finds_gaps(pool: PgPool) -> sqlx::Result<()> {
        let ledger = PgLedger::new(pool);
        for change in [record(100, 0, 50), record(200, 80, 10), record(300, 10, 4)] {
            ledger.insert_balance_change(&change).await.unwrap();
        }

        let gaps = ledger.find_gaps("alice.near", "near", 1_000).await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_block, 100);
        assert_eq!(gaps[0].end_block, 200);
        assert_eq!(gaps[0].expected_before, BigDecimal::from(50));
        assert_eq!(gaps[0].actual_before, BigDecimal::from(80));

        let bounded = ledger.find_gaps("alice.near", "near", 150).await.unwrap();
        assert!(bounded.is_empty());
        Ok(())
    }

    #[sqlx::test]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn test_counterparty_upsert_keeps_token_metadata(pool: PgPool) -> sqlx::Result<()> {
        let ledger = PgLedger::new(pool);

        let mut token = Counterparty::classified("wrap.near");
        token.account_type = CounterpartyType::FtToken;
        token.token_decimals = Some(24);
        token.token_symbol = Some("wNEAR".to_string());
        ledger.upsert_counterparty(&token).await.unwrap();

        let mut reclassified = Counterparty::classified("wrap.near");
        reclassified.account_type = CounterpartyType::FtToken;
        ledger.upsert_counterparty(&reclassified).await.unwrap();

        let stored = ledger.get_counterparty("wrap.near").await.unwrap().unwrap();
        assert_eq!(stored.token_decimals, Some(24));
        assert_eq!(stored.token_symbol.as_deref(), Some("wNEAR"));
        Ok(())
    }
}
