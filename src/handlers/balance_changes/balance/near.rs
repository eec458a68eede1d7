//! NEAR Native Token Balance Queries
//!
//! Queries the total (liquid + locked) native balance at a specific block height.

use bigdecimal::BigDecimal;
use near_api::{AccountId, NetworkConfig, Reference, Tokens};
use std::str::FromStr;

use crate::handlers::balance_changes::error::{
    LedgerError, LedgerResult, is_missing_account_message,
};
use crate::handlers::balance_changes::utils::parse_balance;

/// Query NEAR native balance at the end of `block_height`, in yoctoNEAR.
///
/// An account that does not exist yet at that block has a balance of zero.
/// No retry happens here; callers decide how to handle transport failures.
pub async fn get_balance_at_block(
    network: &NetworkConfig,
    account_id: &str,
    block_height: u64,
) -> LedgerResult<BigDecimal> {
    let account = AccountId::from_str(account_id)
        .map_err(|e| LedgerError::Decode(format!("invalid account id {}: {}", account_id, e)))?;

    match Tokens::account(account)
        .near_balance()
        .at(Reference::AtBlock(block_height))
        .fetch_from(network)
        .await
    {
        Ok(balance) => parse_balance(&balance.total.as_yoctonear().to_string()),
        Err(e) => {
            let message = format!("{} ({:?})", e, e);
            if is_missing_account_message(&message) {
                log::debug!(
                    "{} does not exist at block {}, treating balance as 0",
                    account_id,
                    block_height
                );
                return Ok(BigDecimal::from(0));
            }
            Err(LedgerError::from_rpc(&e, block_height))
        }
    }
}
