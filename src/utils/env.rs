#[derive(Clone, Debug)]
pub struct EnvVars {
    pub database_url: String,
    pub fastnear_api_key: Option<String>,
    pub near_archival_rpc_url: String,
    pub disable_balance_monitoring: bool,
    pub monitor_interval_seconds: u64,
    pub intents_poll_interval_seconds: u64,
    // Transfer hints configuration (FastNear transfers-api)
    pub transfer_hints_enabled: bool,
    pub transfer_hints_base_url: Option<String>, // Override FastNear API URL for testing
    // Search windows, in blocks
    pub seed_lookback_blocks: u64,
    pub past_lookback_blocks: u64,
    pub port: u16,
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for EnvVars {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL is not set"),
            fastnear_api_key: std::env::var("FASTNEAR_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            near_archival_rpc_url: std::env::var("NEAR_ARCHIVAL_RPC_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "https://archival-rpc.mainnet.fastnear.com/".to_string()),
            disable_balance_monitoring: parse_or("DISABLE_BALANCE_MONITORING", false),
            monitor_interval_seconds: parse_or("MONITOR_INTERVAL_SECONDS", 30),
            intents_poll_interval_seconds: parse_or("INTENTS_POLL_INTERVAL_SECONDS", 3600),
            transfer_hints_enabled: parse_or("TRANSFER_HINTS_ENABLED", true), // Enabled by default
            transfer_hints_base_url: std::env::var("TRANSFER_HINTS_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            seed_lookback_blocks: parse_or("SEED_LOOKBACK_BLOCKS", 2_592_000),
            past_lookback_blocks: parse_or("PAST_LOOKBACK_BLOCKS", 600_000),
            port: parse_or("PORT", 3002),
        }
    }
}

impl EnvVars {
    /// Whether the background monitor loop should be spawned.
    pub fn monitoring_enabled(&self) -> bool {
        !self.disable_balance_monitoring && self.monitor_interval_seconds > 0
    }
}
