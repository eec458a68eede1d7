#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use near_api::{NetworkConfig, RPCEndpoint};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use ledger_be::handlers::balance_changes::block_info::BlockInfoService;
use ledger_be::handlers::balance_changes::counterparty::Counterparty;
use ledger_be::handlers::balance_changes::error::{LedgerError, LedgerResult};
use ledger_be::handlers::balance_changes::gap_detector::{BalanceGap, detect_gaps};
use ledger_be::handlers::balance_changes::gap_filler::{FillConfig, GapFiller};
use ledger_be::handlers::balance_changes::rpc::ArchivalRpc;
use ledger_be::handlers::balance_changes::store::BalanceLedger;
use ledger_be::handlers::balance_changes::types::{
    Asset, BalanceChange, FtMetadata, MonitoredAccount, ReceiptRecord,
};
use ledger_be::handlers::balance_changes::utils::RetryPolicy;

static INIT: Once = Once::new();

/// Load test environment variables. Safe to call multiple times - only runs once.
/// Loads .env first, then .env.test which overrides (e.g., DATABASE_URL for test database).
pub fn load_test_env() {
    INIT.call_once(|| {
        dotenvy::from_filename(".env").ok();
        dotenvy::from_filename_override(".env.test").ok();
    });
}

/// Create archival network config for tests with fastnear API key
pub fn create_archival_network() -> NetworkConfig {
    load_test_env();

    let fastnear_api_key =
        std::env::var("FASTNEAR_API_KEY").expect("FASTNEAR_API_KEY must be set in .env");

    NetworkConfig {
        rpc_endpoints: vec![
            RPCEndpoint::new(
                "https://archival-rpc.mainnet.fastnear.com/"
                    .parse()
                    .unwrap(),
            )
            .with_api_key(fastnear_api_key),
        ],
        ..NetworkConfig::mainnet()
    }
}

pub fn dec(value: &str) -> BigDecimal {
    value.parse().unwrap()
}

/// In-memory ledger with the same contract as the Postgres one.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<BalanceChange>>,
    counterparties: Mutex<HashMap<String, Counterparty>>,
    accounts: Mutex<Vec<MonitoredAccount>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account_id: &str) {
        let now = Utc::now();
        self.accounts.lock().unwrap().push(MonitoredAccount {
            account_id: account_id.to_string(),
            enabled: true,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        });
    }

    /// Records for one pair, ascending by block.
    pub fn records(&self, account_id: &str, token_id: &str) -> Vec<BalanceChange> {
        let mut records: Vec<BalanceChange> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.account_id == account_id && r.token_id == token_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.block_height);
        records
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn counterparty(&self, account_id: &str) -> Option<Counterparty> {
        self.counterparties.lock().unwrap().get(account_id).cloned()
    }

    pub fn last_synced(&self, account_id: &str) -> bool {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.account_id == account_id && a.last_synced_at.is_some())
    }
}

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn insert_balance_change(&self, change: &BalanceChange) -> LedgerResult<bool> {
        change.validate()?;
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|r| {
            r.account_id == change.account_id
                && r.token_id == change.token_id
                && r.block_height == change.block_height
        }) {
            return Ok(false);
        }
        records.push(change.clone());
        Ok(true)
    }

    async fn find_gaps(
        &self,
        account_id: &str,
        token_id: &str,
        up_to_block: u64,
    ) -> LedgerResult<Vec<BalanceGap>> {
        let records = self.records(account_id, token_id);
        Ok(detect_gaps(
            records.iter().filter(|r| r.block_height as u64 <= up_to_block),
        ))
    }

    async fn latest_change(
        &self,
        account_id: &str,
        token_id: &str,
        up_to_block: u64,
    ) -> LedgerResult<Option<BalanceChange>> {
        Ok(self
            .records(account_id, token_id)
            .into_iter()
            .filter(|r| r.block_height as u64 <= up_to_block)
            .last())
    }

    async fn earliest_change(
        &self,
        account_id: &str,
        token_id: &str,
    ) -> LedgerResult<Option<BalanceChange>> {
        Ok(self.records(account_id, token_id).into_iter().next())
    }

    async fn tracked_tokens(&self, account_id: &str) -> LedgerResult<Vec<String>> {
        let mut tokens: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.account_id == account_id)
            .map(|r| r.token_id.clone())
            .collect();
        tokens.sort();
        tokens.dedup();
        Ok(tokens)
    }

    async fn enabled_accounts(&self) -> LedgerResult<Vec<MonitoredAccount>> {
        let mut accounts: Vec<MonitoredAccount> = self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.enabled)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(accounts)
    }

    async fn monitored_account(&self, account_id: &str) -> LedgerResult<Option<MonitoredAccount>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.account_id == account_id)
            .cloned())
    }

    async fn mark_synced(&self, account_id: &str) -> LedgerResult<()> {
        for account in self.accounts.lock().unwrap().iter_mut() {
            if account.account_id == account_id {
                account.last_synced_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn get_counterparty(&self, account_id: &str) -> LedgerResult<Option<Counterparty>> {
        Ok(self.counterparty(account_id))
    }

    async fn upsert_counterparty(&self, counterparty: &Counterparty) -> LedgerResult<()> {
        self.counterparties
            .lock()
            .unwrap()
            .insert(counterparty.account_id.clone(), counterparty.clone());
        Ok(())
    }
}

/// Scripted chain: balances are step functions per (account, token id).
pub struct MockChain {
    latest: u64,
    steps: Mutex<HashMap<(String, String), Vec<(u64, BigDecimal)>>>,
    receipts: Mutex<HashMap<(String, u64), Vec<ReceiptRecord>>>,
    mt_holdings: Mutex<HashMap<String, Vec<String>>>,
    transient_failures: AtomicUsize,
    history_start: AtomicU64,
    broken_accounts: Mutex<HashSet<String>>,
    pub balance_calls: AtomicUsize,
}

impl MockChain {
    pub fn new(latest: u64) -> Self {
        Self {
            latest,
            steps: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            mt_holdings: Mutex::new(HashMap::new()),
            transient_failures: AtomicUsize::new(0),
            history_start: AtomicU64::new(0),
            broken_accounts: Mutex::new(HashSet::new()),
            balance_calls: AtomicUsize::new(0),
        }
    }

    /// From the end of `block` onwards, `account` holds `amount` of `asset`.
    pub fn set_balance(&self, account_id: &str, asset: &Asset, block: u64, amount: &str) {
        let mut steps = self.steps.lock().unwrap();
        let entry = steps
            .entry((account_id.to_string(), asset.token_id()))
            .or_default();
        entry.push((block, dec(amount)));
        entry.sort_by_key(|(b, _)| *b);
    }

    pub fn add_receipt(&self, executor: &str, block: u64, receipt: ReceiptRecord) {
        self.receipts
            .lock()
            .unwrap()
            .entry((executor.to_string(), block))
            .or_default()
            .push(receipt);
    }

    /// Token ids reported by `mt_tokens_for_owner`.
    pub fn set_mt_holdings(&self, account_id: &str, token_ids: &[&str]) {
        self.mt_holdings.lock().unwrap().insert(
            account_id.to_string(),
            token_ids.iter().map(|t| t.to_string()).collect(),
        );
    }

    /// The next `count` balance reads fail with a transport error.
    pub fn fail_next_balance_calls(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Balance reads below `block` fail the way a node without that history does.
    pub fn set_history_start(&self, block: u64) {
        self.history_start.store(block, Ordering::SeqCst);
    }

    /// Every balance read for `account_id` fails with a non-transient error.
    pub fn break_account(&self, account_id: &str) {
        self.broken_accounts.lock().unwrap().insert(account_id.to_string());
    }

    fn balance(&self, account_id: &str, token_id: &str, block: u64) -> LedgerResult<BigDecimal> {
        if block > self.latest || block < self.history_start.load(Ordering::SeqCst) {
            return Err(LedgerError::BlockNotFound(block));
        }
        if self.broken_accounts.lock().unwrap().contains(account_id) {
            return Err(LedgerError::Decode(format!("unexpected view result for {}", account_id)));
        }
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::RpcUnavailable("connection reset".to_string()));
        }
        let steps = self.steps.lock().unwrap();
        Ok(steps
            .get(&(account_id.to_string(), token_id.to_string()))
            .and_then(|s| s.iter().rev().find(|(b, _)| *b <= block))
            .map(|(_, amount)| amount.clone())
            .unwrap_or_else(|| BigDecimal::from(0)))
    }
}

#[async_trait]
impl ArchivalRpc for MockChain {
    async fn latest_block_height(&self) -> LedgerResult<u64> {
        Ok(self.latest)
    }

    async fn near_balance(&self, account_id: &str, block_height: u64) -> LedgerResult<BigDecimal> {
        self.balance(account_id, "near", block_height)
    }

    async fn ft_balance(
        &self,
        contract: &str,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<BigDecimal> {
        self.balance(account_id, contract, block_height)
    }

    async fn mt_balance(
        &self,
        contract: &str,
        account_id: &str,
        token_id: &str,
        block_height: u64,
    ) -> LedgerResult<BigDecimal> {
        self.balance(account_id, &format!("{}:{}", contract, token_id), block_height)
    }

    async fn mt_tokens_for_owner(
        &self,
        _contract: &str,
        account_id: &str,
        _block_height: u64,
    ) -> LedgerResult<Vec<String>> {
        Ok(self
            .mt_holdings
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mt_batch_balance_of(
        &self,
        contract: &str,
        account_id: &str,
        token_ids: &[String],
        block_height: u64,
    ) -> LedgerResult<Vec<BigDecimal>> {
        token_ids
            .iter()
            .map(|t| self.balance(account_id, &format!("{}:{}", contract, t), block_height))
            .collect()
    }

    async fn block_timestamp(&self, block_height: u64) -> LedgerResult<i64> {
        if block_height > self.latest {
            return Err(LedgerError::BlockNotFound(block_height));
        }
        Ok(1_700_000_000_000_000_000 + block_height as i64 * 1_000_000_000)
    }

    async fn block_receipts(
        &self,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<Vec<ReceiptRecord>> {
        if block_height > self.latest {
            return Err(LedgerError::BlockNotFound(block_height));
        }
        Ok(self
            .receipts
            .lock()
            .unwrap()
            .get(&(account_id.to_string(), block_height))
            .cloned()
            .unwrap_or_default())
    }

    async fn ft_metadata(&self, contract: &str) -> LedgerResult<FtMetadata> {
        Ok(FtMetadata {
            spec: Some("ft-1.0.0".to_string()),
            name: format!("Token {}", contract),
            symbol: contract.split('.').next().unwrap_or(contract).to_uppercase(),
            icon: None,
            decimals: 6,
        })
    }
}

/// Windows small enough for scripted chains.
pub fn test_config() -> FillConfig {
    FillConfig {
        seed_lookback_blocks: 5_000,
        past_lookback_blocks: 1_000,
        ..FillConfig::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
    }
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub chain: Arc<MockChain>,
    pub blocks: BlockInfoService,
    pub filler: Arc<GapFiller>,
}

pub fn harness(chain: MockChain) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let chain = Arc::new(chain);
    let blocks = BlockInfoService::new(chain.clone());
    let filler = GapFiller::new(ledger.clone(), chain.clone(), blocks.clone(), test_config())
        .with_retry_policy(fast_retry());
    Harness {
        ledger,
        chain,
        blocks,
        filler: Arc::new(filler),
    }
}

pub fn transfer_receipt(receipt_id: &str, block: u64, from: &str, to: &str) -> ReceiptRecord {
    ReceiptRecord {
        receipt_id: receipt_id.to_string(),
        block_height: block,
        predecessor_id: from.to_string(),
        receiver_id: to.to_string(),
        signer_id: Some(from.to_string()),
        transaction_hash: Some(format!("tx-{}", receipt_id)),
        ..Default::default()
    }
}

/// Every record satisfies `amount = after - before` and the chain has no breaks.
pub fn assert_ledger_consistent(records: &[BalanceChange]) {
    for record in records {
        assert_eq!(
            record.amount,
            &record.balance_after - &record.balance_before,
            "amount mismatch at block {}",
            record.block_height
        );
        assert!(!record.counterparty.is_empty());
    }
    assert!(
        detect_gaps(records.iter()).is_empty(),
        "ledger has gaps: {:?}",
        detect_gaps(records.iter())
    );
}
