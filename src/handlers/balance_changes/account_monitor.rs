//! Account Monitor
//!
//! Drives reconciliation for every enabled monitored account. Accounts are
//! processed one at a time, and assets within an account one at a time, to
//! keep load on rate-limited upstreams flat. A failure for one account/asset
//! is logged and the cycle moves on; the next cycle re-detects whatever is
//! still missing from the ledger.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::error::LedgerResult;
use super::gap_filler::GapFiller;
use super::store::BalanceLedger;
use super::token_discovery::TokenDiscovery;
use super::types::{Asset, BalanceChange};

/// 24 polls per day.
pub const DEFAULT_INTENTS_POLL_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    pub up_to_block: u64,
    pub accounts_processed: usize,
    pub assets_processed: usize,
    pub records_inserted: usize,
    pub failures: usize,
}

pub struct AccountMonitor {
    ledger: Arc<dyn BalanceLedger>,
    filler: Arc<GapFiller>,
    discovery: TokenDiscovery,
    intents_poll_interval: Duration,
    last_intents_poll: Mutex<HashMap<String, Instant>>,
    cycle_lock: Mutex<()>,
}

impl AccountMonitor {
    pub fn new(filler: Arc<GapFiller>, discovery: TokenDiscovery, intents_poll_interval: Duration) -> Self {
        Self {
            ledger: filler.ledger().clone(),
            filler,
            discovery,
            intents_poll_interval,
            last_intents_poll: Mutex::new(HashMap::new()),
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run one monitoring cycle over all enabled accounts up to `up_to_block`.
    ///
    /// Only listing the accounts can fail the cycle; per-account and per-asset
    /// failures are counted in the returned stats. Cycles never overlap.
    pub async fn run_monitor_cycle(&self, up_to_block: u64) -> LedgerResult<CycleStats> {
        let _guard = self.cycle_lock.lock().await;

        let accounts = self.ledger.enabled_accounts().await?;
        let mut stats = CycleStats {
            up_to_block,
            ..Default::default()
        };

        if accounts.is_empty() {
            log::debug!("No enabled accounts to monitor");
            return Ok(stats);
        }

        log::info!(
            "Monitor cycle: {} account(s) up to block {}",
            accounts.len(),
            up_to_block
        );

        for account in accounts {
            self.process_account(&account.account_id, up_to_block, &mut stats).await;
            stats.accounts_processed += 1;

            if let Err(e) = self.ledger.mark_synced(&account.account_id).await {
                log::error!("Failed to update last_synced_at for {}: {}", account.account_id, e);
            }
        }

        log::info!(
            "Monitor cycle done: {} account(s), {} asset(s), {} record(s) inserted, {} failure(s)",
            stats.accounts_processed,
            stats.assets_processed,
            stats.records_inserted,
            stats.failures
        );

        Ok(stats)
    }

    async fn process_account(&self, account_id: &str, up_to_block: u64, stats: &mut CycleStats) {
        // Native first: its fresh records feed FT discovery.
        let near_changes = self
            .fill_asset(account_id, &Asset::Near, up_to_block, stats)
            .await
            .unwrap_or_default();

        let mut known = BTreeSet::new();
        match self.ledger.tracked_tokens(account_id).await {
            Ok(token_ids) => {
                for token_id in token_ids {
                    match token_id.parse::<Asset>() {
                        Ok(Asset::Near) => {}
                        Ok(asset) => {
                            known.insert(asset);
                        }
                        Err(e) => log::warn!("Ignoring stored token {} for {}: {}", token_id, account_id, e),
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to list tracked tokens for {}: {}", account_id, e);
                stats.failures += 1;
                return;
            }
        }

        // Discovered assets, with the native change block that revealed FTs.
        let mut discovered: BTreeMap<Asset, Option<u64>> = self
            .discovery
            .discover_ft_tokens(account_id, &near_changes)
            .await
            .into_iter()
            .map(|(asset, revealed_at)| (asset, Some(revealed_at)))
            .collect();

        if self.intents_poll_due(account_id).await {
            match self.discovery.discover_intents_tokens(account_id, up_to_block).await {
                Ok(holdings) => {
                    for (asset, _) in holdings {
                        discovered.entry(asset).or_insert(None);
                    }
                    self.last_intents_poll
                        .lock()
                        .await
                        .insert(account_id.to_string(), Instant::now());
                }
                Err(e) => log::warn!("Intents polling failed for {}: {}", account_id, e),
            }
        }

        for (asset, revealed_at) in discovered.iter().filter(|(asset, _)| !known.contains(*asset)) {
            log::info!("New asset {} discovered for {}", asset, account_id);
            match self
                .discovery
                .bootstrap_asset(&self.filler, account_id, asset, up_to_block, *revealed_at)
                .await
            {
                Ok(records) => stats.records_inserted += records.len(),
                Err(e) => {
                    log::warn!("Failed to bootstrap {}/{}: {}", account_id, asset, e);
                    stats.failures += 1;
                }
            }
        }

        known.extend(discovered.into_keys());
        for asset in &known {
            self.fill_asset(account_id, asset, up_to_block, stats).await;
        }
    }

    async fn fill_asset(
        &self,
        account_id: &str,
        asset: &Asset,
        up_to_block: u64,
        stats: &mut CycleStats,
    ) -> Option<Vec<BalanceChange>> {
        stats.assets_processed += 1;
        match self.filler.fill_all(account_id, asset, up_to_block).await {
            Ok(records) => {
                stats.records_inserted += records.len();
                Some(records)
            }
            Err(e) => {
                log::error!("Gap fill failed for {}/{}: {}", account_id, asset, e);
                stats.failures += 1;
                None
            }
        }
    }

    async fn intents_poll_due(&self, account_id: &str) -> bool {
        match self.last_intents_poll.lock().await.get(account_id) {
            Some(last) => last.elapsed() >= self.intents_poll_interval,
            None => true,
        }
    }
}

/// Run monitoring cycles forever, each up to the latest final block.
pub async fn run_monitor_loop(monitor: Arc<AccountMonitor>, interval: Duration) {
    log::info!(
        "Starting balance monitor (interval: {} seconds)",
        interval.as_secs()
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let up_to_block = match monitor.filler.blocks().latest_block_height().await {
            Ok(height) => height,
            Err(e) => {
                log::error!("Failed to fetch latest block height: {}", e);
                continue;
            }
        };

        if let Err(e) = monitor.run_monitor_cycle(up_to_block).await {
            log::error!("Monitor cycle up to block {} failed: {}", up_to_block, e);
        }
    }
}
