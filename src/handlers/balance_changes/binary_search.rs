//! Binary search for the block where a balance changed.
//!
//! Balances are observed at the end of a block, so a record whose
//! `balance_before` sits at block `end` says nothing about `end` itself: the
//! search space for a change ending at `end` is `[start, end - 1]`.

use bigdecimal::BigDecimal;

use super::balance::BalanceQueryService;
use super::error::LedgerResult;
use super::types::Asset;
use super::utils::{RetryPolicy, with_ledger_retry};

#[derive(Clone)]
pub struct BinarySearchEngine {
    balances: BalanceQueryService,
    retry: RetryPolicy,
}

impl BinarySearchEngine {
    pub fn new(balances: BalanceQueryService) -> Self {
        Self {
            balances,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// One balance read, retried in place on transport failures.
    /// Any other failure (or exhausted retries) propagates and abandons the search.
    pub async fn probe(&self, account_id: &str, asset: &Asset, block_height: u64) -> LedgerResult<BigDecimal> {
        let label = format!("probe {}/{}@{}", account_id, asset, block_height);
        with_ledger_retry(&label, self.retry, || {
            self.balances.balance_at(account_id, asset, block_height)
        })
        .await
    }

    /// Find the block in `[start_block, end_block - 1]` at which the balance
    /// became `expected_after`.
    ///
    /// Returns `None` when the balance at `end_block - 1` equals the balance at
    /// `start_block` (no change in range), or when the range never reaches
    /// `expected_after`. Cost is O(log(end - start)) balance reads.
    pub async fn find_change_block(
        &self,
        account_id: &str,
        asset: &Asset,
        start_block: u64,
        end_block: u64,
        expected_after: &BigDecimal,
    ) -> LedgerResult<Option<u64>> {
        if end_block <= start_block + 1 {
            return Ok(None);
        }
        let mut lo = start_block;
        let mut hi = end_block - 1;

        let start_balance = self.probe(account_id, asset, lo).await?;
        let end_balance = self.probe(account_id, asset, hi).await?;

        if start_balance == end_balance {
            log::debug!(
                "{}/{}: balance unchanged in [{}, {}]",
                account_id,
                asset,
                lo,
                hi
            );
            return Ok(None);
        }
        if &end_balance != expected_after {
            log::warn!(
                "{}/{}: balance at block {} is {}, expected {} - range does not reach target",
                account_id,
                asset,
                hi,
                end_balance,
                expected_after
            );
            return Ok(None);
        }

        // Invariant: balance(lo) != expected, balance(hi) == expected.
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let balance = self.probe(account_id, asset, mid).await?;
            if &balance == expected_after {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        log::debug!(
            "{}/{}: balance became {} at block {}",
            account_id,
            asset,
            expected_after,
            hi
        );
        Ok(Some(hi))
    }
}
