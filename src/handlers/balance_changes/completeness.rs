//! Balance History Completeness Check
//!
//! Reports, per tracked token, how many interior gaps remain and whether the
//! history reaches back to a zero balance. Derived purely from the ledger.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::LedgerResult;
use super::store::BalanceLedger;
use super::types::{Asset, BalanceChange};

/// Completeness information for a single token
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCompleteness {
    pub token_id: String,
    pub has_gaps: bool,
    pub gap_count: usize,
    pub reaches_beginning: bool,
    pub earliest_block: Option<i64>,
}

/// Full completeness response for an account
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessResponse {
    pub account_id: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub tokens: Vec<TokenCompleteness>,
}

impl CompletenessResponse {
    pub fn is_complete(&self) -> bool {
        self.tokens.iter().all(|t| !t.has_gaps && t.reaches_beginning)
    }
}

/// Check completeness for all tokens of an account up to `up_to_block`
pub async fn check_completeness(
    ledger: &dyn BalanceLedger,
    account_id: &str,
    up_to_block: u64,
) -> LedgerResult<CompletenessResponse> {
    let last_synced_at = ledger
        .monitored_account(account_id)
        .await?
        .and_then(|a| a.last_synced_at);

    let mut tokens = Vec::new();
    for token_id in ledger.tracked_tokens(account_id).await? {
        let gap_count = ledger.find_gaps(account_id, &token_id, up_to_block).await?.len();
        let earliest = ledger.earliest_change(account_id, &token_id).await?;

        let reaches_beginning = match (&earliest, token_id.parse::<Asset>()) {
            (Some(record), Ok(asset)) => reaches_beginning(&asset, record),
            (None, _) => true,
            (Some(_), Err(e)) => {
                log::warn!("Skipping beginning check for {}/{}: {}", account_id, token_id, e);
                false
            }
        };

        tokens.push(TokenCompleteness {
            token_id,
            has_gaps: gap_count > 0,
            gap_count,
            reaches_beginning,
            earliest_block: earliest.map(|r| r.block_height),
        });
    }

    Ok(CompletenessResponse {
        account_id: account_id.to_string(),
        last_synced_at,
        tokens,
    })
}

/// Whether `earliest` marks the start of the token's history.
///
/// The earliest record must start from zero. For multi-token holdings a
/// SNAPSHOT does not count: those are boundary markers of the backward walk.
pub fn reaches_beginning(asset: &Asset, earliest: &BalanceChange) -> bool {
    if earliest.balance_before != BigDecimal::from(0) {
        return false;
    }
    match asset {
        Asset::Intents { .. } => !earliest.is_snapshot(),
        Asset::Near | Asset::FungibleToken { .. } => true,
    }
}
