//! Gap Filler Service
//!
//! Turns gaps into records. For an (account, asset) pair it:
//! 1. seeds the first record when the ledger has none,
//! 2. closes the gap between the latest record and the current balance,
//! 3. walks backwards from the earliest record towards a zero balance,
//! 4. fills every break between consecutive records, in block order.
//!
//! Change blocks are located with verified transfer hints when a hint
//! provider has any, and by binary search otherwise. Every step re-reads the
//! ledger, so an interrupted run resumes where it stopped.

use bigdecimal::BigDecimal;
use serde::Serialize;
use std::sync::Arc;

use super::balance::BalanceQueryService;
use super::binary_search::BinarySearchEngine;
use super::block_info::BlockInfoService;
use super::counterparty::{self, CounterpartyRegistry};
use super::error::{LedgerError, LedgerResult};
use super::gap_detector::BalanceGap;
use super::rpc::ArchivalRpc;
use super::store::BalanceLedger;
use super::transfer_hints::{TransferHint, TransferHintService};
use super::types::{Asset, BalanceChange, ReceiptRecord, UNKNOWN};
use super::utils::RetryPolicy;

/// ~30 days of blocks at one block per second.
pub const DEFAULT_SEED_LOOKBACK_BLOCKS: u64 = 2_592_000;
/// ~7 days of blocks.
pub const DEFAULT_PAST_LOOKBACK_BLOCKS: u64 = 600_000;
const MAX_HINTS_VERIFIED: usize = 20;

#[derive(Debug, Clone)]
pub struct FillConfig {
    pub seed_lookback_blocks: u64,
    pub past_lookback_blocks: u64,
    /// Backward steps taken from the earliest record per `fill_all` run.
    pub past_steps_per_run: usize,
    /// Upper bound on interior gap fills per `fill_all` run.
    pub max_gap_fills_per_run: usize,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            seed_lookback_blocks: DEFAULT_SEED_LOOKBACK_BLOCKS,
            past_lookback_blocks: DEFAULT_PAST_LOOKBACK_BLOCKS,
            past_steps_per_run: 10,
            max_gap_fills_per_run: 1_000,
        }
    }
}

/// Where a change block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateStrategy {
    Hint,
    BinarySearch,
}

#[derive(Debug, Clone)]
struct LocatedChange {
    block_height: u64,
    hint: Option<TransferHint>,
    strategy: LocateStrategy,
}

pub struct GapFiller {
    ledger: Arc<dyn BalanceLedger>,
    blocks: BlockInfoService,
    search: BinarySearchEngine,
    registry: CounterpartyRegistry,
    hints: Option<Arc<TransferHintService>>,
    config: FillConfig,
}

impl GapFiller {
    pub fn new(
        ledger: Arc<dyn BalanceLedger>,
        rpc: Arc<dyn ArchivalRpc>,
        blocks: BlockInfoService,
        config: FillConfig,
    ) -> Self {
        Self {
            search: BinarySearchEngine::new(BalanceQueryService::new(rpc.clone())),
            registry: CounterpartyRegistry::new(ledger.clone(), rpc),
            ledger,
            blocks,
            hints: None,
            config,
        }
    }

    pub fn with_hints(mut self, hints: Arc<TransferHintService>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.search = self.search.with_retry_policy(retry);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn BalanceLedger> {
        &self.ledger
    }

    pub fn blocks(&self) -> &BlockInfoService {
        &self.blocks
    }

    /// Balance at the end of `block_height`, retried in place on transport errors.
    pub async fn balance_at(&self, account_id: &str, asset: &Asset, block_height: u64) -> LedgerResult<BigDecimal> {
        self.search.probe(account_id, asset, block_height).await
    }

    /// Reconcile one pair up to `up_to_block`: seed, present, past, then
    /// interior gaps until none remain. Returns the records inserted.
    pub async fn fill_all(
        &self,
        account_id: &str,
        asset: &Asset,
        up_to_block: u64,
    ) -> LedgerResult<Vec<BalanceChange>> {
        let token_id = asset.token_id();
        log::info!(
            "Starting gap fill for {}/{} up to block {} (hints: {})",
            account_id,
            token_id,
            up_to_block,
            if self.hints.is_some() { "enabled" } else { "disabled" }
        );

        let mut filled = Vec::new();

        if let Some(seed) = self.seed_initial_balance(account_id, asset, up_to_block).await? {
            filled.push(seed);
        }

        if let Some(present) = self.fill_gap_to_present(account_id, asset, up_to_block).await? {
            filled.push(present);
        }

        filled.extend(self.fill_gap_to_past(account_id, asset).await?);

        let mut previous: Option<(i64, i64)> = None;
        let mut fills = 0;
        loop {
            let gaps = self.ledger.find_gaps(account_id, &token_id, up_to_block).await?;
            let remaining = gaps.len();
            let Some(gap) = gaps.into_iter().next() else {
                break;
            };
            if fills >= self.config.max_gap_fills_per_run {
                log::warn!(
                    "Gap fill for {}/{} stopped after {} fill(s) with {} gap(s) left",
                    account_id,
                    token_id,
                    fills,
                    remaining
                );
                return Err(LedgerError::GapsRemaining {
                    account_id: account_id.to_string(),
                    token_id,
                    fills,
                    remaining,
                });
            }
            let bounds = (gap.start_block, gap.end_block);
            if previous == Some(bounds) {
                return Err(LedgerError::ChangeBlockNotFound {
                    account_id: account_id.to_string(),
                    token_id,
                    from_block: gap.start_block as u64,
                    to_block: gap.end_block as u64,
                    target: gap.actual_before,
                });
            }
            previous = Some(bounds);
            filled.push(self.fill(&gap).await?);
            fills += 1;
        }

        log::info!(
            "Gap fill for {}/{} inserted {} record(s)",
            account_id,
            token_id,
            filled.len()
        );
        Ok(filled)
    }

    /// Fill a single gap with the record of the block where the balance
    /// reached `gap.actual_before`.
    pub async fn fill(&self, gap: &BalanceGap) -> LedgerResult<BalanceChange> {
        let asset: Asset = gap.token_id.parse()?;
        let start = gap.start_block as u64;
        let end = gap.end_block as u64;

        let located = self
            .locate_change(&gap.account_id, &asset, start, end, &gap.actual_before)
            .await?
            .ok_or_else(|| LedgerError::ChangeBlockNotFound {
                account_id: gap.account_id.clone(),
                token_id: gap.token_id.clone(),
                from_block: start,
                to_block: end,
                target: gap.actual_before.clone(),
            })?;

        log::info!(
            "Filling gap {}/{} [{}, {}] at block {} via {:?}",
            gap.account_id,
            gap.token_id,
            start,
            end,
            located.block_height,
            located.strategy
        );

        self.record_change_at(&gap.account_id, &asset, located.block_height, located.hint.as_ref())
            .await
    }

    /// Seed the first record when the ledger has none for the pair.
    ///
    /// Looks back `seed_lookback_blocks` from `current_block` for the block
    /// where the balance became its current value. If the balance was already
    /// there at the lookback boundary, a snapshot marks the boundary instead.
    pub async fn seed_initial_balance(
        &self,
        account_id: &str,
        asset: &Asset,
        current_block: u64,
    ) -> LedgerResult<Option<BalanceChange>> {
        let token_id = asset.token_id();
        if self.ledger.earliest_change(account_id, &token_id).await?.is_some() {
            return Ok(None);
        }

        let current_balance = self.balance_at(account_id, asset, current_block).await?;
        if current_balance == BigDecimal::from(0) {
            log::info!("Balance of {}/{} is 0, nothing to seed", account_id, token_id);
            return Ok(None);
        }

        let start_block = current_block.saturating_sub(self.config.seed_lookback_blocks);
        log::info!(
            "Seeding {}/{}: balance {} at block {}, searching from block {}",
            account_id,
            token_id,
            current_balance,
            current_block,
            start_block
        );

        let located = self
            .locate_change(account_id, asset, start_block, current_block + 1, &current_balance)
            .await?;

        let record = match located {
            Some(located) => {
                self.record_change_at(account_id, asset, located.block_height, located.hint.as_ref())
                    .await?
            }
            None => {
                log::info!(
                    "Balance {} existed before block {}, inserting SNAPSHOT at lookback boundary",
                    current_balance,
                    start_block
                );
                self.snapshot_or_change_at(account_id, asset, start_block).await?
            }
        };

        Ok(Some(record))
    }

    /// Close the gap between the latest record and the balance at `up_to_block`.
    async fn fill_gap_to_present(
        &self,
        account_id: &str,
        asset: &Asset,
        up_to_block: u64,
    ) -> LedgerResult<Option<BalanceChange>> {
        let token_id = asset.token_id();
        let Some(latest) = self.ledger.latest_change(account_id, &token_id, up_to_block).await? else {
            return Ok(None);
        };
        let latest_block = latest.block_height as u64;
        if latest_block >= up_to_block {
            return Ok(None);
        }

        let current_balance = self.balance_at(account_id, asset, up_to_block).await?;
        if current_balance == latest.balance_after {
            log::debug!(
                "No gap to present: balance unchanged at {} for {}/{}",
                current_balance,
                account_id,
                token_id
            );
            return Ok(None);
        }

        log::info!(
            "Gap to present detected: {} -> {} for {}/{}, searching blocks {}-{}",
            latest.balance_after,
            current_balance,
            account_id,
            token_id,
            latest_block,
            up_to_block
        );

        let located = self
            .locate_change(account_id, asset, latest_block, up_to_block + 1, &current_balance)
            .await?
            .ok_or_else(|| LedgerError::ChangeBlockNotFound {
                account_id: account_id.to_string(),
                token_id: token_id.clone(),
                from_block: latest_block,
                to_block: up_to_block + 1,
                target: current_balance.clone(),
            })?;

        self.record_change_at(account_id, asset, located.block_height, located.hint.as_ref())
            .await
            .map(Some)
    }

    /// Walk backwards from the earliest record while its `balance_before` is non-zero.
    ///
    /// Each step searches `past_lookback_blocks` before the earliest record for
    /// the block where the balance became that record's `balance_before`. When
    /// the balance already held at the window start, a snapshot marks the
    /// boundary and the next step continues from there.
    async fn fill_gap_to_past(&self, account_id: &str, asset: &Asset) -> LedgerResult<Vec<BalanceChange>> {
        let token_id = asset.token_id();
        let zero = BigDecimal::from(0);
        let mut filled = Vec::new();

        for _ in 0..self.config.past_steps_per_run {
            let Some(earliest) = self.ledger.earliest_change(account_id, &token_id).await? else {
                break;
            };
            if earliest.balance_before == zero || earliest.block_height <= 0 {
                break;
            }

            let earliest_block = earliest.block_height as u64;
            let start_block = earliest_block.saturating_sub(self.config.past_lookback_blocks);
            let target = earliest.balance_before.clone();

            log::info!(
                "Gap to past for {}/{}: earliest record at block {} starts from {}, searching from block {}",
                account_id,
                token_id,
                earliest_block,
                target,
                start_block
            );

            let located = match self
                .locate_change(account_id, asset, start_block, earliest_block, &target)
                .await
            {
                Ok(located) => located,
                Err(
                    e @ (LedgerError::HistoricalStateUnavailable(_)
                    | LedgerError::BlockNotIndexed(_)
                    | LedgerError::BlockNotFound(_)),
                ) => {
                    log::warn!(
                        "Historical state for {}/{} unavailable before block {}: {} - stopping backward walk",
                        account_id,
                        token_id,
                        earliest_block,
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            let record = match located {
                Some(located) => {
                    self.record_change_at(account_id, asset, located.block_height, located.hint.as_ref())
                        .await?
                }
                None => {
                    let balance_at_start = self.balance_at(account_id, asset, start_block).await?;
                    if balance_at_start != target {
                        log::warn!(
                            "{}/{}: balance {} at block {} never reaches {} before block {}",
                            account_id,
                            token_id,
                            balance_at_start,
                            start_block,
                            target,
                            earliest_block
                        );
                        break;
                    }
                    self.snapshot_or_change_at(account_id, asset, start_block).await?
                }
            };
            filled.push(record);
        }

        Ok(filled)
    }

    /// Find the block in `[from_block, end_block - 1]` where the balance became
    /// `target`: verified hints first, binary search as the terminal fallback.
    async fn locate_change(
        &self,
        account_id: &str,
        asset: &Asset,
        from_block: u64,
        end_block: u64,
        target: &BigDecimal,
    ) -> LedgerResult<Option<LocatedChange>> {
        if end_block <= from_block + 1 {
            return Ok(None);
        }

        if let Some(hints) = self.hints.as_ref().filter(|h| h.supports(asset)) {
            let candidates = hints
                .get_hints(account_id, asset, from_block + 1, end_block - 1)
                .await;
            for hint in candidates
                .into_iter()
                .filter(|h| !h.ruled_out_for(target))
                .take(MAX_HINTS_VERIFIED)
            {
                if self.is_change_block(account_id, asset, hint.block_height, target).await? {
                    log::info!(
                        "Verified hint at block {} for {}/{}",
                        hint.block_height,
                        account_id,
                        asset
                    );
                    return Ok(Some(LocatedChange {
                        block_height: hint.block_height,
                        hint: Some(hint),
                        strategy: LocateStrategy::Hint,
                    }));
                }
            }
            log::debug!(
                "No hint verified for {}/{} in [{}, {}], falling back to binary search",
                account_id,
                asset,
                from_block,
                end_block - 1
            );
        }

        let block = self
            .search
            .find_change_block(account_id, asset, from_block, end_block, target)
            .await?;
        Ok(block.map(|block_height| LocatedChange {
            block_height,
            hint: None,
            strategy: LocateStrategy::BinarySearch,
        }))
    }

    /// True when the balance became `target` exactly at `block_height`.
    async fn is_change_block(
        &self,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
        target: &BigDecimal,
    ) -> LedgerResult<bool> {
        if block_height == 0 {
            return Ok(false);
        }
        let after = self.balance_at(account_id, asset, block_height).await?;
        if &after != target {
            return Ok(false);
        }
        let before = self.balance_at(account_id, asset, block_height - 1).await?;
        Ok(&before != target)
    }

    /// Insert a zero-delta SNAPSHOT at `block_height`.
    ///
    /// Refuses (`SnapshotMismatch`) when the balance moved within that block.
    pub async fn insert_snapshot(
        &self,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
    ) -> LedgerResult<BalanceChange> {
        let (before, after) = self.balance_change_at(account_id, asset, block_height).await?;
        if before != after {
            log::warn!(
                "Block {} has balance change {} -> {} for {}/{}, not inserting as SNAPSHOT",
                block_height,
                before,
                after,
                account_id,
                asset
            );
            return Err(LedgerError::SnapshotMismatch {
                account_id: account_id.to_string(),
                token_id: asset.token_id(),
                block_height,
                before,
                after,
            });
        }

        let timestamp = self.blocks.timestamp_of(block_height).await?;
        let snapshot = BalanceChange::snapshot(account_id, asset, block_height, timestamp, after);
        self.persist(snapshot).await
    }

    async fn snapshot_or_change_at(
        &self,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
    ) -> LedgerResult<BalanceChange> {
        match self.insert_snapshot(account_id, asset, block_height).await {
            Err(LedgerError::SnapshotMismatch { .. }) => {
                self.record_change_at(account_id, asset, block_height, None).await
            }
            other => other,
        }
    }

    async fn balance_change_at(
        &self,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
    ) -> LedgerResult<(BigDecimal, BigDecimal)> {
        let after = self.balance_at(account_id, asset, block_height).await?;
        let before = if block_height > 0 {
            self.balance_at(account_id, asset, block_height - 1).await?
        } else {
            BigDecimal::from(0)
        };
        Ok((before, after))
    }

    /// Receipts carrying the evidence for a change. Lookup failures other than
    /// transient ones degrade to `None`, which attributes the change to UNKNOWN.
    async fn evidence_for(
        &self,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
    ) -> LedgerResult<Option<Arc<Vec<ReceiptRecord>>>> {
        let executor = asset.receipt_executor(account_id);
        match self.blocks.receipts_for(executor, block_height).await {
            Ok(receipts) => Ok(Some(receipts)),
            Err(e) if e.is_retryable() || e.is_rate_limited() => Err(e),
            Err(e) => {
                log::warn!(
                    "Receipts of {} at block {} unavailable: {} - counterparty will be UNKNOWN",
                    executor,
                    block_height,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Measure, attribute and persist the change at `block_height`.
    pub async fn record_change_at(
        &self,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
        hint: Option<&TransferHint>,
    ) -> LedgerResult<BalanceChange> {
        let (before, after) = self.balance_change_at(account_id, asset, block_height).await?;
        let timestamp = self.blocks.timestamp_of(block_height).await?;

        let evidence = self.evidence_for(account_id, asset, block_height).await?;
        let mut resolved = match &evidence {
            Some(receipts) => counterparty::resolve(account_id, asset, receipts),
            None => counterparty::ResolvedCounterparty {
                counterparty: UNKNOWN.to_string(),
                ..Default::default()
            },
        };

        if let Some(hint) = hint {
            if resolved.counterparty == UNKNOWN
                && let Some(other) = &hint.counterparty
            {
                resolved.counterparty = other.clone();
            }
            if let Some(tx) = &hint.transaction_hash
                && !resolved.transaction_hashes.contains(tx)
            {
                resolved.transaction_hashes.push(tx.clone());
            }
        }

        let mut change = BalanceChange::new(
            account_id,
            asset,
            block_height,
            timestamp,
            before,
            after,
            resolved.counterparty,
        );
        change.signer_id = resolved.signer_id;
        change.receiver_id = resolved.receiver_id;
        change.transaction_hashes = resolved.transaction_hashes;
        change.receipt_ids = resolved.receipt_ids;

        if let Some(receipts) = evidence.filter(|r| !r.is_empty()) {
            let calls: Vec<_> = receipts
                .iter()
                .filter(|r| change.receipt_ids.contains(&r.receipt_id))
                .flat_map(|r| r.function_calls.iter())
                .collect();
            if !calls.is_empty() {
                change.actions = serde_json::to_value(&calls).ok();
            }
            change.raw_data = serde_json::to_value(&*receipts).ok();
        }

        let change = self.persist(change).await?;
        self.register_counterparties(asset, &change.counterparty).await;
        Ok(change)
    }

    async fn persist(&self, change: BalanceChange) -> LedgerResult<BalanceChange> {
        if self.ledger.insert_balance_change(&change).await? {
            log::info!(
                "Recorded {}/{} at block {}: {} -> {} (counterparty: {})",
                change.account_id,
                change.token_id,
                change.block_height,
                change.balance_before,
                change.balance_after,
                change.counterparty
            );
        } else {
            log::debug!(
                "Record for {}/{} at block {} already exists",
                change.account_id,
                change.token_id,
                change.block_height
            );
        }
        Ok(change)
    }

    /// Registry upkeep never fails the fill.
    async fn register_counterparties(&self, asset: &Asset, counterparty: &str) {
        if let Asset::FungibleToken { contract } = asset
            && let Err(e) = self.registry.ensure_token(contract).await
        {
            log::warn!("Could not register token {}: {}", contract, e);
        }
        if let Err(e) = self.registry.ensure_account(counterparty).await {
            log::warn!("Could not register counterparty {}: {}", counterparty, e);
        }
    }
}
