use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use near_account_id::AccountId;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;
use crate::handlers::balance_changes::types::MonitoredAccount;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAccountRequest {
    pub account_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAccountResponse {
    #[serde(flatten)]
    pub account: MonitoredAccount,
    pub is_new_registration: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAccountsQuery {
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    pub enabled: bool,
}

const ACCOUNT_COLUMNS: &str = "account_id, enabled, last_synced_at, created_at, updated_at";

fn db_error(e: sqlx::Error) -> (StatusCode, Json<Value>) {
    log::error!("Monitored accounts query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Database error", "details": e.to_string() })),
    )
}

/// Enroll an account for monitoring. Re-adding an existing account re-enables it.
pub async fn add_monitored_account(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddAccountRequest>,
) -> Result<Json<AddAccountResponse>, (StatusCode, Json<Value>)> {
    let account_id: AccountId = payload.account_id.parse().map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Invalid account id",
                "details": format!("{}", e)
            })),
        )
    })?;

    let existed = state
        .ledger
        .monitored_account(account_id.as_str())
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Database error", "details": e.to_string() })),
            )
        })?
        .is_some();

    let account = sqlx::query_as::<_, MonitoredAccount>(&format!(
        r#"
        INSERT INTO monitored_accounts (account_id, enabled)
        VALUES ($1, true)
        ON CONFLICT (account_id) DO UPDATE SET enabled = true, updated_at = NOW()
        RETURNING {}
        "#,
        ACCOUNT_COLUMNS
    ))
    .bind(account_id.as_str())
    .fetch_one(&state.db_pool)
    .await
    .map_err(db_error)?;

    if !existed {
        log::info!("Registered monitored account {}", account.account_id);
    }

    Ok(Json(AddAccountResponse {
        account,
        is_new_registration: !existed,
    }))
}

pub async fn list_monitored_accounts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListAccountsQuery>,
) -> Result<Json<Vec<MonitoredAccount>>, (StatusCode, Json<Value>)> {
    let accounts = sqlx::query_as::<_, MonitoredAccount>(&format!(
        r#"
        SELECT {}
        FROM monitored_accounts
        WHERE $1::bool IS NULL OR enabled = $1
        ORDER BY account_id
        "#,
        ACCOUNT_COLUMNS
    ))
    .bind(params.enabled)
    .fetch_all(&state.db_pool)
    .await
    .map_err(db_error)?;

    Ok(Json(accounts))
}

pub async fn update_monitored_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<MonitoredAccount>, (StatusCode, Json<Value>)> {
    let account = sqlx::query_as::<_, MonitoredAccount>(&format!(
        r#"
        UPDATE monitored_accounts
        SET enabled = $2, updated_at = NOW()
        WHERE account_id = $1
        RETURNING {}
        "#,
        ACCOUNT_COLUMNS
    ))
    .bind(&account_id)
    .bind(payload.enabled)
    .fetch_optional(&state.db_pool)
    .await
    .map_err(db_error)?;

    account.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Account not found",
                "details": account_id
            })),
        )
    })
}
