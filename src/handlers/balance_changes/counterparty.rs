//! Counterparty resolution and the counterparty registry.
//!
//! Resolution attributes a balance change to the other party using the
//! receipts of the change block:
//! - native NEAR: the predecessor of an incoming receipt, else the receiver of
//!   an outgoing one;
//! - fungible tokens: NEP-141 `EVENT_JSON` logs, then `ft_transfer*` arguments;
//! - multi-tokens: NEP-245 `EVENT_JSON` logs, then the `receiver_id` of a call
//!   the account made itself. A change with no trace of the account at all is
//!   a third-party settlement and is attributed to `SNAPSHOT`.
//!
//! Anything that cannot be attributed resolves to `UNKNOWN`; malformed receipts
//! never abort the fill.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::{LedgerError, LedgerResult};
use super::rpc::ArchivalRpc;
use super::store::BalanceLedger;
use super::types::{Asset, ReceiptRecord, SNAPSHOT, SYSTEM, UNKNOWN};

const EVENT_JSON_PREFIX: &str = "EVENT_JSON:";

/// Outcome of attributing one balance change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedCounterparty {
    pub counterparty: String,
    pub signer_id: Option<String>,
    pub receiver_id: Option<String>,
    pub receipt_ids: Vec<String>,
    pub transaction_hashes: Vec<String>,
    /// Receipts whose logs could not be parsed.
    pub malformed: Vec<String>,
}

impl ResolvedCounterparty {
    fn from_receipt(counterparty: impl Into<String>, receipt: &ReceiptRecord) -> Self {
        Self {
            counterparty: counterparty.into(),
            signer_id: receipt.signer_id.clone(),
            receiver_id: Some(receipt.receiver_id.clone()),
            receipt_ids: vec![receipt.receipt_id.clone()],
            transaction_hashes: receipt.transaction_hash.iter().cloned().collect(),
            malformed: Vec::new(),
        }
    }

    fn unattributed(counterparty: &str, malformed: Vec<String>) -> Self {
        Self {
            counterparty: counterparty.to_string(),
            malformed,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct EventLog {
    pub standard: String,
    pub event: String,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

/// Parse a NEP-297 event log line. `None` when the line is not an event at all.
pub(super) fn parse_event_log(receipt_id: &str, log: &str) -> Option<Result<EventLog, LedgerError>> {
    let payload = log.strip_prefix(EVENT_JSON_PREFIX)?;
    Some(
        serde_json::from_str::<EventLog>(payload).map_err(|e| LedgerError::MalformedReceipt {
            receipt_id: receipt_id.to_string(),
            reason: format!("unparseable event log: {}", e),
        }),
    )
}

fn str_field<'a>(data: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|v| v.as_str())
}

/// The other party of a transfer/mint/burn event entry, when it involves `account_id`.
fn event_counterparty(
    account_id: &str,
    event: &str,
    data: &serde_json::Value,
    emitter: &str,
) -> Option<String> {
    match event {
        "ft_transfer" | "mt_transfer" => {
            let old_owner = str_field(data, "old_owner_id")?;
            let new_owner = str_field(data, "new_owner_id")?;
            if new_owner == account_id {
                Some(old_owner.to_string())
            } else if old_owner == account_id {
                Some(new_owner.to_string())
            } else {
                None
            }
        }
        "ft_mint" | "ft_burn" | "mt_mint" | "mt_burn" => {
            (str_field(data, "owner_id")? == account_id).then(|| emitter.to_string())
        }
        _ => None,
    }
}

fn event_mentions_token(data: &serde_json::Value, token_id: &str) -> bool {
    match data.get("token_ids").and_then(|v| v.as_array()) {
        Some(ids) => ids.iter().any(|id| id.as_str() == Some(token_id)),
        None => true,
    }
}

/// Scan event logs of `standard`; returns the first attribution and every malformed receipt.
fn scan_events(
    account_id: &str,
    standard: &str,
    token_id: Option<&str>,
    receipts: &[ReceiptRecord],
) -> (Option<ResolvedCounterparty>, Vec<String>) {
    let mut malformed = Vec::new();
    for receipt in receipts {
        for log in &receipt.logs {
            let event = match parse_event_log(&receipt.receipt_id, log) {
                None => continue,
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    log::warn!("{}", e);
                    malformed.push(receipt.receipt_id.clone());
                    continue;
                }
            };
            if event.standard != standard {
                continue;
            }
            for data in &event.data {
                if let Some(token_id) = token_id
                    && !event_mentions_token(data, token_id)
                {
                    continue;
                }
                if let Some(other) =
                    event_counterparty(account_id, &event.event, data, &receipt.receiver_id)
                {
                    return (Some(ResolvedCounterparty::from_receipt(other, receipt)), malformed);
                }
            }
        }
    }
    (None, malformed)
}

/// Fallback for tokens that do not emit events: `ft_transfer`/`ft_transfer_call` arguments.
fn scan_ft_transfer_args(account_id: &str, receipts: &[ReceiptRecord]) -> Option<ResolvedCounterparty> {
    for receipt in receipts {
        for call in &receipt.function_calls {
            if call.method_name != "ft_transfer" && call.method_name != "ft_transfer_call" {
                continue;
            }
            let Some(transfer_receiver) = call.args.as_ref().and_then(|a| str_field(a, "receiver_id"))
            else {
                continue;
            };
            if transfer_receiver == account_id {
                return Some(ResolvedCounterparty::from_receipt(
                    receipt.predecessor_id.clone(),
                    receipt,
                ));
            }
            if receipt.predecessor_id == account_id {
                return Some(ResolvedCounterparty::from_receipt(transfer_receiver, receipt));
            }
        }
    }
    None
}

/// A call the account made on the token contract: the `receiver_id` argument
/// when it names someone else, `UNKNOWN` otherwise.
fn resolve_account_initiated(account_id: &str, receipts: &[ReceiptRecord]) -> Option<ResolvedCounterparty> {
    let receipt = receipts
        .iter()
        .find(|r| r.predecessor_id == account_id || r.signer_id.as_deref() == Some(account_id))?;
    let other = receipt
        .function_calls
        .iter()
        .filter_map(|call| call.args.as_ref().and_then(|a| str_field(a, "receiver_id")))
        .find(|receiver| *receiver != account_id)
        .unwrap_or(UNKNOWN);
    Some(ResolvedCounterparty::from_receipt(other, receipt))
}

fn resolve_native(account_id: &str, receipts: &[ReceiptRecord]) -> Option<ResolvedCounterparty> {
    let incoming = receipts
        .iter()
        .find(|r| r.receiver_id == account_id && r.predecessor_id != account_id);
    if let Some(receipt) = incoming {
        return Some(ResolvedCounterparty::from_receipt(receipt.predecessor_id.clone(), receipt));
    }
    receipts
        .iter()
        .find(|r| r.predecessor_id == account_id && r.receiver_id != account_id)
        .map(|receipt| ResolvedCounterparty::from_receipt(receipt.receiver_id.clone(), receipt))
}

/// Attribute a change of `asset` held by `account_id` using the change block's receipts.
///
/// For fungible and multi-tokens, `receipts` are those executed on the token
/// contract. Never fails: the result is always a non-empty counterparty.
pub fn resolve(account_id: &str, asset: &Asset, receipts: &[ReceiptRecord]) -> ResolvedCounterparty {
    let resolved = match asset {
        Asset::Near => resolve_native(account_id, receipts)
            .unwrap_or_else(|| ResolvedCounterparty::unattributed(UNKNOWN, Vec::new())),
        Asset::FungibleToken { .. } => {
            let (found, malformed) = scan_events(account_id, "nep141", None, receipts);
            match found.or_else(|| scan_ft_transfer_args(account_id, receipts)) {
                Some(mut resolved) => {
                    resolved.malformed = malformed;
                    resolved
                }
                None => ResolvedCounterparty::unattributed(UNKNOWN, malformed),
            }
        }
        Asset::Intents { token_id, .. } => {
            let (found, malformed) = scan_events(account_id, "nep245", Some(token_id), receipts);
            match found.or_else(|| resolve_account_initiated(account_id, receipts)) {
                Some(mut resolved) => {
                    resolved.malformed = malformed;
                    resolved
                }
                None if !malformed.is_empty() => ResolvedCounterparty::unattributed(UNKNOWN, malformed),
                None => ResolvedCounterparty::unattributed(SNAPSHOT, malformed),
            }
        }
    };

    if resolved.counterparty.trim().is_empty() {
        return ResolvedCounterparty {
            counterparty: UNKNOWN.to_string(),
            ..resolved
        };
    }
    resolved
}

/// Category of a counterparty account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterpartyType {
    FtToken,
    StakingPool,
    Dao,
    System,
    Personal,
    Unknown,
}

impl CounterpartyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterpartyType::FtToken => "ft_token",
            CounterpartyType::StakingPool => "staking_pool",
            CounterpartyType::Dao => "dao",
            CounterpartyType::System => "system",
            CounterpartyType::Personal => "personal",
            CounterpartyType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ft_token" => CounterpartyType::FtToken,
            "staking_pool" => CounterpartyType::StakingPool,
            "dao" => CounterpartyType::Dao,
            "system" => CounterpartyType::System,
            "personal" => CounterpartyType::Personal,
            _ => CounterpartyType::Unknown,
        }
    }

    /// Classify by account naming conventions alone.
    pub fn from_account_id(account_id: &str) -> Self {
        if account_id == SYSTEM {
            CounterpartyType::System
        } else if account_id == SNAPSHOT || account_id == UNKNOWN {
            CounterpartyType::Unknown
        } else if account_id.ends_with(".poolv1.near") || account_id.ends_with(".pool.near") {
            CounterpartyType::StakingPool
        } else if account_id.ends_with(".sputnik-dao.near") {
            CounterpartyType::Dao
        } else {
            CounterpartyType::Personal
        }
    }
}

/// Registry row describing a counterparty account; token rows carry decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterparty {
    pub account_id: String,
    pub account_type: CounterpartyType,
    pub token_symbol: Option<String>,
    pub token_name: Option<String>,
    pub token_decimals: Option<u8>,
    pub token_icon: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
}

impl Counterparty {
    pub fn classified(account_id: &str) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.to_string(),
            account_type: CounterpartyType::from_account_id(account_id),
            token_symbol: None,
            token_name: None,
            token_decimals: None,
            token_icon: None,
            discovered_at: now,
            last_verified_at: now,
        }
    }
}

/// Convert a raw integer amount to display units; exact, no rounding.
pub fn format_amount(raw: &BigDecimal, decimals: u8) -> BigDecimal {
    let (digits, scale) = raw.as_bigint_and_exponent();
    BigDecimal::new(digits, scale + i64::from(decimals))
}

/// Keeps the counterparty registry populated as records are written.
#[derive(Clone)]
pub struct CounterpartyRegistry {
    ledger: Arc<dyn BalanceLedger>,
    rpc: Arc<dyn ArchivalRpc>,
}

impl CounterpartyRegistry {
    pub fn new(ledger: Arc<dyn BalanceLedger>, rpc: Arc<dyn ArchivalRpc>) -> Self {
        Self { ledger, rpc }
    }

    /// Register a token contract, fetching its metadata. Decimals are mandatory:
    /// a contract whose metadata cannot be read is not registered.
    pub async fn ensure_token(&self, contract: &str) -> LedgerResult<Counterparty> {
        if let Some(existing) = self.ledger.get_counterparty(contract).await?
            && existing.token_decimals.is_some()
        {
            return Ok(existing);
        }

        let metadata = self.rpc.ft_metadata(contract).await?;
        let mut counterparty = Counterparty::classified(contract);
        counterparty.account_type = CounterpartyType::FtToken;
        counterparty.token_symbol = Some(metadata.symbol);
        counterparty.token_name = Some(metadata.name);
        counterparty.token_decimals = Some(metadata.decimals);
        counterparty.token_icon = metadata.icon;

        self.ledger.upsert_counterparty(&counterparty).await?;
        log::info!(
            "Registered token {} ({} decimals)",
            contract,
            metadata.decimals
        );
        Ok(counterparty)
    }

    /// Register a plain account by naming heuristics. Reserved values are skipped.
    pub async fn ensure_account(&self, account_id: &str) -> LedgerResult<()> {
        if account_id == SNAPSHOT || account_id == UNKNOWN || account_id.is_empty() {
            return Ok(());
        }
        if self.ledger.get_counterparty(account_id).await?.is_some() {
            return Ok(());
        }
        self.ledger
            .upsert_counterparty(&Counterparty::classified(account_id))
            .await
    }
}
