use axum::Router;
use ledger_be::AppState;
use ledger_be::handlers::balance_changes::account_monitor::run_monitor_loop;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    env_logger::init();

    let state = Arc::new(AppState::new().await?);

    if state.env_vars.monitoring_enabled() {
        let monitor = state.monitor.clone();
        let interval = Duration::from_secs(state.env_vars.monitor_interval_seconds);
        tokio::spawn(async move {
            run_monitor_loop(monitor, interval).await;
        });
    } else {
        log::info!("Balance monitoring disabled");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let addr = format!("0.0.0.0:{}", state.env_vars.port);
    let app = Router::new()
        .merge(ledger_be::routes::create_routes(state))
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("Server running on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
