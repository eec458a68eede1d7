use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, patch, post},
};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;

mod balance_changes;
mod monitored_accounts;

async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // Test database connection
    let db_connected = sqlx::query("SELECT 1")
        .fetch_one(&state.db_pool)
        .await
        .is_ok();

    let pool_size = state.db_pool.size();
    let idle_connections = state.db_pool.num_idle();

    if !db_connected {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "database": {
                    "connected": false,
                    "error": "Database connection failed"
                }
            })),
        ));
    }

    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": {
            "connected": true,
            "pool_size": pool_size,
            "idle_connections": idle_connections
        }
    })))
}

pub fn create_routes(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(health_check))
        // Ledger endpoints
        .route(
            "/api/balance-changes",
            get(balance_changes::get_balance_changes),
        )
        .route(
            "/api/balance-changes/fill-gaps",
            post(balance_changes::fill_gaps),
        )
        .route(
            "/api/balance-changes/completeness",
            get(balance_changes::get_completeness),
        )
        // Monitoring endpoints
        .route(
            "/api/monitored-accounts",
            post(monitored_accounts::add_monitored_account)
                .get(monitored_accounts::list_monitored_accounts),
        )
        .route(
            "/api/monitored-accounts/{account_id}",
            patch(monitored_accounts::update_monitored_account),
        )
        .route("/api/monitor/run", post(balance_changes::run_monitor))
        .with_state(state)
}
