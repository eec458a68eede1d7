//! [`ArchivalRpc`] backed by a NEAR archival node.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use near_api::NetworkConfig;

use super::ArchivalRpc;
use crate::handlers::balance_changes::balance::{ft, intents, near};
use crate::handlers::balance_changes::block_info;
use crate::handlers::balance_changes::error::LedgerResult;
use crate::handlers::balance_changes::types::{FtMetadata, ReceiptRecord};

pub struct NearRpcClient {
    network: NetworkConfig,
}

impl NearRpcClient {
    /// `network` should point at an archival endpoint; historical queries fail otherwise.
    pub fn new(network: NetworkConfig) -> Self {
        Self { network }
    }
}

#[async_trait]
impl ArchivalRpc for NearRpcClient {
    async fn latest_block_height(&self) -> LedgerResult<u64> {
        block_info::fetch_latest_block_height(&self.network).await
    }

    async fn near_balance(&self, account_id: &str, block_height: u64) -> LedgerResult<BigDecimal> {
        near::get_balance_at_block(&self.network, account_id, block_height).await
    }

    async fn ft_balance(
        &self,
        contract: &str,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<BigDecimal> {
        ft::get_balance_at_block(&self.network, account_id, contract, block_height).await
    }

    async fn mt_balance(
        &self,
        contract: &str,
        account_id: &str,
        token_id: &str,
        block_height: u64,
    ) -> LedgerResult<BigDecimal> {
        intents::get_balance_at_block(&self.network, contract, account_id, token_id, block_height)
            .await
    }

    async fn mt_tokens_for_owner(
        &self,
        contract: &str,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<Vec<String>> {
        intents::get_tokens_for_owner(&self.network, contract, account_id, block_height).await
    }

    async fn mt_batch_balance_of(
        &self,
        contract: &str,
        account_id: &str,
        token_ids: &[String],
        block_height: u64,
    ) -> LedgerResult<Vec<BigDecimal>> {
        intents::get_batch_balances(&self.network, contract, account_id, token_ids, block_height)
            .await
    }

    async fn block_timestamp(&self, block_height: u64) -> LedgerResult<i64> {
        block_info::fetch_block_timestamp(&self.network, block_height).await
    }

    async fn block_receipts(
        &self,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<Vec<ReceiptRecord>> {
        block_info::fetch_block_receipts(&self.network, account_id, block_height).await
    }

    async fn ft_metadata(&self, contract: &str) -> LedgerResult<FtMetadata> {
        ft::get_metadata(&self.network, contract).await
    }
}
