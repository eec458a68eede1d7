//! Archival RPC seam.
//!
//! Everything the engine learns about the chain goes through [`ArchivalRpc`].
//! Production uses [`NearRpcClient`]; tests substitute a scripted chain.

mod near;

pub use near::NearRpcClient;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use super::error::LedgerResult;
use super::types::{FtMetadata, ReceiptRecord};

#[async_trait]
pub trait ArchivalRpc: Send + Sync {
    /// Height of the latest final block.
    async fn latest_block_height(&self) -> LedgerResult<u64>;

    /// Total native balance (liquid + locked) in yoctoNEAR at the end of `block_height`.
    async fn near_balance(&self, account_id: &str, block_height: u64) -> LedgerResult<BigDecimal>;

    /// `ft_balance_of` on `contract`. Missing contracts and unregistered accounts yield zero.
    async fn ft_balance(
        &self,
        contract: &str,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<BigDecimal>;

    /// `mt_balance_of` on a multi-token contract.
    async fn mt_balance(
        &self,
        contract: &str,
        account_id: &str,
        token_id: &str,
        block_height: u64,
    ) -> LedgerResult<BigDecimal>;

    /// Token ids the account holds on a multi-token contract.
    async fn mt_tokens_for_owner(
        &self,
        contract: &str,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<Vec<String>>;

    /// Balances for `token_ids`, in the same order.
    async fn mt_batch_balance_of(
        &self,
        contract: &str,
        account_id: &str,
        token_ids: &[String],
        block_height: u64,
    ) -> LedgerResult<Vec<BigDecimal>>;

    /// Block timestamp in nanoseconds.
    async fn block_timestamp(&self, block_height: u64) -> LedgerResult<i64>;

    /// Receipts and transactions in `block_height` where `account_id` is the
    /// receiver or the predecessor.
    async fn block_receipts(
        &self,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<Vec<ReceiptRecord>>;

    async fn ft_metadata(&self, contract: &str) -> LedgerResult<FtMetadata>;
}
