//! Gap detection over the ordered records of one (account, asset) pair.
//!
//! Consecutive records must chain: the `balance_after` of one record equals the
//! `balance_before` of the next. Any break is a gap hiding at least one
//! unrecorded change.

use bigdecimal::BigDecimal;
use serde::Serialize;

use super::error::LedgerResult;
use super::store::BalanceLedger;
use super::types::BalanceChange;

/// A break in the chain between the records at `start_block` and `end_block`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceGap {
    pub account_id: String,
    pub token_id: String,
    pub start_block: i64,
    pub end_block: i64,
    /// `balance_after` of the record at `start_block`.
    pub expected_before: BigDecimal,
    /// `balance_before` of the record at `end_block`; the value the balance
    /// reached somewhere in `(start_block, end_block)`.
    pub actual_before: BigDecimal,
}

/// Scan records (any order) with a one-step lookback and report every break.
///
/// This mirrors the windowed query the Postgres ledger runs; gaps come back in
/// ascending block order.
pub fn detect_gaps<'a, I>(records: I) -> Vec<BalanceGap>
where
    I: IntoIterator<Item = &'a BalanceChange>,
{
    let mut ordered: Vec<&BalanceChange> = records.into_iter().collect();
    ordered.sort_by_key(|r| r.block_height);

    ordered
        .windows(2)
        .filter(|pair| pair[0].balance_after != pair[1].balance_before)
        .map(|pair| BalanceGap {
            account_id: pair[1].account_id.clone(),
            token_id: pair[1].token_id.clone(),
            start_block: pair[0].block_height,
            end_block: pair[1].block_height,
            expected_before: pair[0].balance_after.clone(),
            actual_before: pair[1].balance_before.clone(),
        })
        .collect()
}

/// Gaps for one pair, considering records up to `up_to_block` inclusive.
pub async fn find_gaps(
    ledger: &dyn BalanceLedger,
    account_id: &str,
    token_id: &str,
    up_to_block: u64,
) -> LedgerResult<Vec<BalanceGap>> {
    ledger.find_gaps(account_id, token_id, up_to_block).await
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
            0,
            BigDecimal::from(before),
            BigDecimal::from(after),
            "bob.near",
        )
    }

    #[test]
    fn test_chained_records_have_no_gaps() {
        let records = vec![record(100, 0, 50), record(150, 50, 80), record(200, 80, 10)];
        assert!(detect_gaps(&records).is_empty());
    }

    #[test]
    fn test_detects_break_between_records() {
        let records = vec![record(100, 0, 50), record(200, 80, 10)];
        let gaps = detect_gaps(&records);

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_block, 100);
        assert_eq!(gaps[0].end_block, 200);
        assert_eq!(gaps[0].expected_before, BigDecimal::from(50));
        assert_eq!(gaps[0].actual_before, BigDecimal::from(80));
    }

    #[test]
    fn test_gaps_are_ordered_regardless_of_input_order() {
        let records = vec![
            record(300, 7, 9),
            record(100, 0, 50),
            record(200, 80, 5),
        ];
        let gaps = detect_gaps(&records);

        let bounds: Vec<(i64, i64)> = gaps.iter().map(|g| (g.start_block, g.end_block)).collect();
        assert_eq!(bounds, vec![(100, 200), (200, 300)]);
    }

    #[test]
    fn test_numerically_equal_balances_chain() {
        let mut first = record(1, 0, 0);
        first.balance_after = "5.000".parse().unwrap();
        first.amount = first.balance_after.clone();
        let second = record(2, 5, 6);
        assert!(detect_gaps(&[first, second]).is_empty());
    }
}
