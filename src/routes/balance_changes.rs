use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::types::BigDecimal;
use sqlx::types::chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::AppState;
use crate::handlers::balance_changes::LedgerError;
use crate::handlers::balance_changes::completeness::{self, CompletenessResponse};
use crate::handlers::balance_changes::types::{Asset, SNAPSHOT};

#[derive(Debug, Deserialize)]
pub struct BalanceChangesQuery {
    pub account_id: String,
    pub token_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub exclude_snapshots: Option<bool>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct BalanceChangeRow {
    pub id: i64,
    #[serde(rename = "accountId")]
    pub account_id: String,
    #[serde(rename = "blockHeight")]
    pub block_height: i64,
    #[serde(rename = "blockTime")]
    pub block_time: DateTime<Utc>,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(rename = "receiptId")]
    pub receipt_id: Vec<String>,
    #[serde(rename = "transactionHashes")]
    pub transaction_hashes: Vec<String>,
    pub counterparty: String,
    #[serde(rename = "signerId")]
    pub signer_id: Option<String>,
    #[serde(rename = "receiverId")]
    pub receiver_id: Option<String>,
    pub amount: BigDecimal,
    #[serde(rename = "balanceBefore")]
    pub balance_before: BigDecimal,
    #[serde(rename = "balanceAfter")]
    pub balance_after: BigDecimal,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Map an engine error to an HTTP status with `error`/`details` body.
pub(super) fn ledger_error(context: &str, e: LedgerError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        LedgerError::InvalidAsset(_) => StatusCode::BAD_REQUEST,
        LedgerError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        LedgerError::RpcUnavailable(_) | LedgerError::BlockNotIndexed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    log::error!("{}: {}", context, e);
    (
        status,
        Json(json!({
            "error": context,
            "details": e.to_string()
        })),
    )
}

pub async fn get_balance_changes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BalanceChangesQuery>,
) -> Result<Json<Vec<BalanceChangeRow>>, (StatusCode, Json<Value>)> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let offset = params.offset.unwrap_or(0).max(0);
    let exclude_snapshots = params.exclude_snapshots.unwrap_or(false);

    let token_id = match params.token_id.as_deref() {
        Some(raw) => Some(
            raw.parse::<Asset>()
                .map_err(|e| ledger_error("Invalid token id", e))?
                .token_id(),
        ),
        None => None,
    };

    let changes = sqlx::query_as::<_, BalanceChangeRow>(
        r#"
        SELECT id, account_id, block_height, block_time, token_id,
               receipt_id, transaction_hashes, counterparty, signer_id, receiver_id,
               amount, balance_before, balance_after, created_at
        FROM balance_changes
        WHERE account_id = $1
          AND ($2::text IS NULL OR token_id = $2)
          AND (NOT $3::bool OR counterparty <> $4)
        ORDER BY block_height DESC, id DESC
        LIMIT $5 OFFSET $6
        "#,
    )
    .bind(&params.account_id)
    .bind(&token_id)
    .bind(exclude_snapshots)
    .bind(SNAPSHOT)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db_pool)
    .await;

    match changes {
        Ok(data) => Ok(Json(data)),
        Err(e) => {
            log::error!("Failed to fetch balance changes: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to fetch balance changes",
                    "details": e.to_string()
                })),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FillGapsRequest {
    pub account_id: String,
    pub token_id: String,
    pub up_to_block: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FillGapsResponse {
    pub gaps_filled: usize,
    pub account_id: String,
    pub token_id: String,
    pub up_to_block: u64,
}

async fn resolve_up_to_block(
    state: &AppState,
    requested: Option<u64>,
) -> Result<u64, (StatusCode, Json<Value>)> {
    match requested {
        Some(block) => Ok(block),
        None => state
            .filler
            .blocks()
            .latest_block_height()
            .await
            .map_err(|e| ledger_error("Failed to get current block height", e)),
    }
}

pub async fn fill_gaps(
    State(state): State<Arc<AppState>>,
    Json(params): Json<FillGapsRequest>,
) -> Result<Json<FillGapsResponse>, (StatusCode, Json<Value>)> {
    let asset: Asset = params
        .token_id
        .parse()
        .map_err(|e| ledger_error("Invalid token id", e))?;
    let up_to_block = resolve_up_to_block(&state, params.up_to_block).await?;

    log::info!(
        "fill_gaps request: account={}, token={}, up_to_block={}",
        params.account_id,
        asset,
        up_to_block
    );

    let filled = state
        .filler
        .fill_all(&params.account_id, &asset, up_to_block)
        .await
        .map_err(|e| ledger_error("Failed to fill gaps", e))?;

    Ok(Json(FillGapsResponse {
        gaps_filled: filled.len(),
        account_id: params.account_id,
        token_id: asset.token_id(),
        up_to_block,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompletenessQuery {
    pub account_id: String,
    pub up_to_block: Option<u64>,
}

pub async fn get_completeness(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompletenessQuery>,
) -> Result<Json<CompletenessResponse>, (StatusCode, Json<Value>)> {
    let up_to_block = params.up_to_block.unwrap_or(i64::MAX as u64);
    completeness::check_completeness(state.ledger.as_ref(), &params.account_id, up_to_block)
        .await
        .map(Json)
        .map_err(|e| ledger_error("Failed to check completeness", e))
}

pub async fn run_monitor(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let up_to_block = resolve_up_to_block(&state, None).await?;
    let stats = state
        .monitor
        .run_monitor_cycle(up_to_block)
        .await
        .map_err(|e| ledger_error("Monitor cycle failed", e))?;

    let status = if stats.failures == 0 { "ok" } else { "partial" };
    Ok(Json(json!({
        "status": status,
        "stats": stats
    })))
}
