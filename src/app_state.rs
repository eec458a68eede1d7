use near_api::{NetworkConfig, RPCEndpoint};
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};

use crate::handlers::balance_changes::{
    account_monitor::AccountMonitor,
    block_info::BlockInfoService,
    gap_filler::{FillConfig, GapFiller},
    rpc::{ArchivalRpc, NearRpcClient},
    store::{BalanceLedger, PgLedger},
    token_discovery::TokenDiscovery,
    transfer_hints::{TransferHintService, fastnear::FastNearProvider},
};
use crate::utils::env::EnvVars;

pub struct AppState {
    pub http_client: reqwest::Client,
    pub archival_network: NetworkConfig,
    pub env_vars: EnvVars,
    pub db_pool: PgPool,
    pub ledger: Arc<dyn BalanceLedger>,
    pub rpc: Arc<dyn ArchivalRpc>,
    pub filler: Arc<GapFiller>,
    pub monitor: Arc<AccountMonitor>,
}

impl AppState {
    /// Initialize the application state with database connection and migrations
    pub async fn new() -> Result<AppState, Box<dyn std::error::Error>> {
        let env_vars = EnvVars::default();

        // Database connection
        log::info!("Connecting to database...");
        let db_pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&env_vars.database_url)
            .await?;

        log::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&db_pool).await?;

        log::info!("Database connection established successfully");

        let mut endpoint = RPCEndpoint::new(env_vars.near_archival_rpc_url.parse()?);
        if let Some(api_key) = &env_vars.fastnear_api_key {
            endpoint = endpoint.with_api_key(api_key.clone());
        }
        let archival_network = NetworkConfig {
            rpc_endpoints: vec![endpoint],
            ..NetworkConfig::mainnet()
        };

        Ok(Self::from_parts(
            reqwest::Client::new(),
            archival_network,
            env_vars,
            db_pool,
        ))
    }

    /// Wire the ledger engine over an existing pool and archival network.
    pub fn from_parts(
        http_client: reqwest::Client,
        archival_network: NetworkConfig,
        env_vars: EnvVars,
        db_pool: PgPool,
    ) -> AppState {
        let ledger: Arc<dyn BalanceLedger> = Arc::new(PgLedger::new(db_pool.clone()));
        let rpc: Arc<dyn ArchivalRpc> = Arc::new(NearRpcClient::new(archival_network.clone()));
        let blocks = BlockInfoService::new(rpc.clone());

        let config = FillConfig {
            seed_lookback_blocks: env_vars.seed_lookback_blocks,
            past_lookback_blocks: env_vars.past_lookback_blocks,
            ..FillConfig::default()
        };
        let mut filler = GapFiller::new(ledger.clone(), rpc.clone(), blocks.clone(), config);

        if env_vars.transfer_hints_enabled {
            let provider = match &env_vars.transfer_hints_base_url {
                Some(base_url) => {
                    log::info!("Transfer hints enabled, using custom base URL: {}", base_url);
                    FastNearProvider::with_base_url(http_client.clone(), blocks.clone(), base_url.clone())
                }
                None => {
                    log::info!("Transfer hints enabled (FastNear)");
                    FastNearProvider::new(http_client.clone(), blocks.clone())
                }
            }
            .with_api_key(env_vars.fastnear_api_key.clone());
            filler = filler.with_hints(Arc::new(TransferHintService::new().with_provider(provider)));
        } else {
            log::info!("Transfer hints disabled, gap filling uses binary search only");
        }

        let filler = Arc::new(filler);
        let monitor = Arc::new(AccountMonitor::new(
            filler.clone(),
            TokenDiscovery::new(rpc.clone(), blocks),
            Duration::from_secs(env_vars.intents_poll_interval_seconds),
        ));

        AppState {
            http_client,
            archival_network,
            env_vars,
            db_pool,
            ledger,
            rpc,
            filler,
            monitor,
        }
    }
}
