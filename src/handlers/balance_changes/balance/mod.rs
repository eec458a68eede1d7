//! Balance Query Services
//!
//! Unified interface for reading an account's balance of any [`Asset`] at a
//! specific block height. Three asset kinds are supported:
//! - NEAR native tokens (via `near` submodule)
//! - Fungible Tokens/NEP-141 (via `ft` submodule)
//! - NEAR Intents multi-tokens (via `intents` submodule)
//!
//! The submodules hold the raw near-api queries; [`BalanceQueryService`]
//! dispatches through the [`ArchivalRpc`] seam so the engine can run against a
//! scripted chain in tests.

pub mod ft;
pub mod intents;
pub mod near;

use bigdecimal::BigDecimal;
use std::sync::Arc;

use super::error::LedgerResult;
use super::rpc::ArchivalRpc;
use super::types::Asset;

#[derive(Clone)]
pub struct BalanceQueryService {
    rpc: Arc<dyn ArchivalRpc>,
}

impl BalanceQueryService {
    pub fn new(rpc: Arc<dyn ArchivalRpc>) -> Self {
        Self { rpc }
    }

    /// Balance at the end of `block_height`.
    ///
    /// Queries are not retried here: a transport failure surfaces as
    /// `RpcUnavailable` and the caller owns the retry policy.
    pub async fn balance_at(
        &self,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
    ) -> LedgerResult<BigDecimal> {
        match asset {
            Asset::Near => self.rpc.near_balance(account_id, block_height).await,
            Asset::FungibleToken { contract } => {
                self.rpc.ft_balance(contract, account_id, block_height).await
            }
            Asset::Intents { contract, token_id } => {
                self.rpc
                    .mt_balance(contract, account_id, token_id, block_height)
                    .await
            }
        }
    }
}
