//! NEAR Intents Multi-Token (NEP-245) Balance Queries
//!
//! View calls against the multi-token ledger contract (`intents.near`).

use bigdecimal::BigDecimal;
use near_api::{AccountId, Contract, NetworkConfig, Reference};
use serde::Deserialize;
use std::str::FromStr;

use crate::handlers::balance_changes::error::{LedgerError, LedgerResult};
use crate::handlers::balance_changes::utils::parse_balance;

#[derive(Deserialize, Debug)]
struct OwnedToken {
    token_id: String,
}

fn contract_for(contract_id: &str) -> LedgerResult<Contract> {
    let id = AccountId::from_str(contract_id)
        .map_err(|e| LedgerError::Decode(format!("invalid contract id {}: {}", contract_id, e)))?;
    Ok(Contract(id))
}

/// Query `mt_balance_of` for a single token at the end of `block_height`.
///
/// `token_id` is the contract-local id, e.g. `nep141:btc.omft.near`.
pub async fn get_balance_at_block(
    network: &NetworkConfig,
    contract_id: &str,
    account_id: &str,
    token_id: &str,
    block_height: u64,
) -> LedgerResult<BigDecimal> {
    let args = serde_json::json!({
        "account_id": account_id,
        "token_id": token_id
    });

    let balance = contract_for(contract_id)?
        .call_function("mt_balance_of", args)
        .read_only::<String>()
        .at(Reference::AtBlock(block_height))
        .fetch_from(network)
        .await
        .map_err(|e| LedgerError::from_rpc(&e, block_height))?;

    parse_balance(&balance.data)
}

/// List the token ids `account_id` holds on the multi-token contract.
pub async fn get_tokens_for_owner(
    network: &NetworkConfig,
    contract_id: &str,
    account_id: &str,
    block_height: u64,
) -> LedgerResult<Vec<String>> {
    let args = serde_json::json!({ "account_id": account_id });

    let tokens = contract_for(contract_id)?
        .call_function("mt_tokens_for_owner", args)
        .read_only::<Vec<OwnedToken>>()
        .at(Reference::AtBlock(block_height))
        .fetch_from(network)
        .await
        .map_err(|e| LedgerError::from_rpc(&e, block_height))?;

    Ok(tokens.data.into_iter().map(|t| t.token_id).collect())
}

/// Batch `mt_batch_balance_of`; balances come back in `token_ids` order.
pub async fn get_batch_balances(
    network: &NetworkConfig,
    contract_id: &str,
    account_id: &str,
    token_ids: &[String],
    block_height: u64,
) -> LedgerResult<Vec<BigDecimal>> {
    if token_ids.is_empty() {
        return Ok(Vec::new());
    }

    let args = serde_json::json!({
        "account_id": account_id,
        "token_ids": token_ids
    });

    let balances = contract_for(contract_id)?
        .call_function("mt_batch_balance_of", args)
        .read_only::<Vec<String>>()
        .at(Reference::AtBlock(block_height))
        .fetch_from(network)
        .await
        .map_err(|e| LedgerError::from_rpc(&e, block_height))?;

    if balances.data.len() != token_ids.len() {
        return Err(LedgerError::Decode(format!(
            "mt_batch_balance_of returned {} balances for {} tokens",
            balances.data.len(),
            token_ids.len()
        )));
    }

    balances.data.iter().map(|raw| parse_balance(raw)).collect()
}
