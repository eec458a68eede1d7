//! Fungible Token (NEP-141) Balance Queries
//!
//! View calls against a token contract at a specific block height.

use bigdecimal::BigDecimal;
use near_api::{AccountId, Contract, NetworkConfig, Reference};
use std::str::FromStr;

use crate::handlers::balance_changes::error::{
    LedgerError, LedgerResult, is_missing_account_message,
};
use crate::handlers::balance_changes::types::FtMetadata;
use crate::handlers::balance_changes::utils::parse_balance;

fn parse_account(account_id: &str) -> LedgerResult<AccountId> {
    AccountId::from_str(account_id)
        .map_err(|e| LedgerError::Decode(format!("invalid account id {}: {}", account_id, e)))
}

/// Query `ft_balance_of` for `account_id` at the end of `block_height`.
///
/// A contract that is not deployed yet (or an account that never registered
/// with it) has a balance of zero.
pub async fn get_balance_at_block(
    network: &NetworkConfig,
    account_id: &str,
    token_contract: &str,
    block_height: u64,
) -> LedgerResult<BigDecimal> {
    let contract = Contract(parse_account(token_contract)?);
    let args = serde_json::json!({ "account_id": account_id });

    let result = contract
        .call_function("ft_balance_of", args)
        .read_only::<String>()
        .at(Reference::AtBlock(block_height))
        .fetch_from(network)
        .await;

    match result {
        Ok(balance) => parse_balance(&balance.data),
        Err(e) => {
            let message = format!("{} ({:?})", e, e);
            if is_missing_account_message(&message) {
                log::debug!(
                    "FT contract {} not available at block {}, treating balance as 0",
                    token_contract,
                    block_height
                );
                return Ok(BigDecimal::from(0));
            }
            Err(LedgerError::from_rpc(&e, block_height))
        }
    }
}

/// Fetch NEP-148 metadata from a token contract at the latest block.
pub async fn get_metadata(network: &NetworkConfig, token_contract: &str) -> LedgerResult<FtMetadata> {
    let contract = Contract(parse_account(token_contract)?);

    let metadata = contract
        .call_function("ft_metadata", ())
        .read_only::<FtMetadata>()
        .fetch_from(network)
        .await
        .map_err(|e| LedgerError::from_rpc(&e, 0))?
        .data;

    Ok(metadata)
}
