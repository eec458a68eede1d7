//! Core ledger types: assets, balance change records, receipts and counterparties.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::LedgerError;

/// Canonical token id of the native asset.
pub const NEAR_TOKEN_ID: &str = "near";
/// Multi-token (NEP-245) ledger contract.
pub const INTENTS_CONTRACT: &str = "intents.near";

/// Reserved counterparty for observation boundaries.
pub const SNAPSHOT: &str = "SNAPSHOT";
/// Reserved counterparty when the receipts could not attribute the change.
pub const UNKNOWN: &str = "UNKNOWN";
/// Protocol-level actor (gas refunds, validator rewards).
pub const SYSTEM: &str = "system";

/// A balance-bearing asset held by a monitored account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Asset {
    Near,
    FungibleToken { contract: String },
    Intents { contract: String, token_id: String },
}

impl Asset {
    pub fn fungible(contract: impl Into<String>) -> Self {
        Asset::FungibleToken {
            contract: contract.into(),
        }
    }

    pub fn intents(token_id: impl Into<String>) -> Self {
        Asset::Intents {
            contract: INTENTS_CONTRACT.to_string(),
            token_id: token_id.into(),
        }
    }

    /// Canonical string stored in the `token_id` column.
    pub fn token_id(&self) -> String {
        self.to_string()
    }

    /// Account whose receipts carry the evidence for a change of this asset.
    pub fn receipt_executor<'a>(&'a self, account_id: &'a str) -> &'a str {
        match self {
            Asset::Near => account_id,
            Asset::FungibleToken { contract } => contract,
            Asset::Intents { contract, .. } => contract,
        }
    }

    /// Contract whose metadata describes the asset, if any.
    pub fn contract(&self) -> Option<&str> {
        match self {
            Asset::Near => None,
            Asset::FungibleToken { contract } => Some(contract),
            Asset::Intents { contract, .. } => Some(contract),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Near => write!(f, "{}", NEAR_TOKEN_ID),
            Asset::FungibleToken { contract } => write!(f, "{}", contract),
            Asset::Intents { contract, token_id } => write!(f, "{}:{}", contract, token_id),
        }
    }
}

impl FromStr for Asset {
    type Err = LedgerError;

    /// Parse a token id.
    ///
    /// `near`/`NEAR` is the native asset, `<contract>:<token>` is a multi-token
    /// holding (split on the first colon), anything else is a fungible token contract.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LedgerError::InvalidAsset(s.to_string()));
        }
        if s.eq_ignore_ascii_case(NEAR_TOKEN_ID) {
            return Ok(Asset::Near);
        }
        match s.split_once(':') {
            Some((contract, token_id)) => {
                if contract.is_empty() || token_id.is_empty() {
                    return Err(LedgerError::InvalidAsset(s.to_string()));
                }
                Ok(Asset::Intents {
                    contract: contract.to_string(),
                    token_id: token_id.to_string(),
                })
            }
            None => Ok(Asset::FungibleToken {
                contract: s.to_string(),
            }),
        }
    }
}

/// One immutable ledger entry: the balance of `token_id` held by `account_id`
/// moved from `balance_before` to `balance_after` within `block_height`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BalanceChange {
    pub account_id: String,
    pub token_id: String,
    pub block_height: i64,
    pub block_timestamp: i64,
    pub amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub counterparty: String,
    pub signer_id: Option<String>,
    pub receiver_id: Option<String>,
    pub transaction_hashes: Vec<String>,
    #[sqlx(rename = "receipt_id")]
    pub receipt_ids: Vec<String>,
    pub actions: Option<serde_json::Value>,
    pub raw_data: Option<serde_json::Value>,
}

impl BalanceChange {
    /// Build a record, deriving `amount` from the two balances.
    pub fn new(
        account_id: impl Into<String>,
        asset: &Asset,
        block_height: u64,
        block_timestamp: i64,
        balance_before: BigDecimal,
        balance_after: BigDecimal,
        counterparty: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            token_id: asset.token_id(),
            block_height: block_height as i64,
            block_timestamp,
            amount: &balance_after - &balance_before,
            balance_before,
            balance_after,
            counterparty: counterparty.into(),
            signer_id: None,
            receiver_id: None,
            transaction_hashes: Vec::new(),
            receipt_ids: Vec::new(),
            actions: None,
            raw_data: None,
        }
    }

    /// Zero-delta observation boundary at `block_height`.
    pub fn snapshot(
        account_id: impl Into<String>,
        asset: &Asset,
        block_height: u64,
        block_timestamp: i64,
        balance: BigDecimal,
    ) -> Self {
        Self::new(
            account_id,
            asset,
            block_height,
            block_timestamp,
            balance.clone(),
            balance,
            SNAPSHOT,
        )
    }

    pub fn is_snapshot(&self) -> bool {
        self.counterparty == SNAPSHOT
    }

    /// Reject records that would break the ledger invariants.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let invalid = |reason: &str| LedgerError::InvalidRecord {
            account_id: self.account_id.clone(),
            token_id: self.token_id.clone(),
            block_height: self.block_height,
            reason: reason.to_string(),
        };
        if self.counterparty.trim().is_empty() {
            return Err(invalid("counterparty is empty"));
        }
        if self.block_height < 0 {
            return Err(invalid("negative block height"));
        }
        if self.amount != &self.balance_after - &self.balance_before {
            return Err(invalid("amount does not equal balance_after - balance_before"));
        }
        Ok(())
    }
}

/// A function call carried by a receipt, with its JSON arguments when decodable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    pub method_name: String,
    pub args: Option<serde_json::Value>,
}

/// A receipt (or signed transaction) that touched an account within one block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub receipt_id: String,
    pub block_height: u64,
    pub predecessor_id: String,
    pub receiver_id: String,
    pub signer_id: Option<String>,
    pub transaction_hash: Option<String>,
    pub function_calls: Vec<FunctionCallRecord>,
    pub logs: Vec<String>,
}

impl ReceiptRecord {
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.function_calls.iter().map(|c| c.method_name.as_str())
    }
}

/// Account enrolled for continuous reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredAccount {
    pub account_id: String,
    pub enabled: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// NEP-148 metadata returned by `ft_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtMetadata {
    #[serde(default)]
    pub spec: Option<String>,
    pub name: String,
    pub symbol: String,
    #[serde(default)]
    pub icon: Option<String>,
    pub decimals: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_parsing() {
        assert_eq!("near".parse::<Asset>().unwrap(), Asset::Near);
        assert_eq!("NEAR".parse::<Asset>().unwrap(), Asset::Near);
        assert_eq!(
            "usdt.tether-token.near".parse::<Asset>().unwrap(),
            Asset::fungible("usdt.tether-token.near")
        );
        assert_eq!(
            "intents.near:nep141:btc.omft.near".parse::<Asset>().unwrap(),
            Asset::Intents {
                contract: "intents.near".to_string(),
                token_id: "nep141:btc.omft.near".to_string(),
            }
        );
        assert!("".parse::<Asset>().is_err());
        assert!(":nep141:x".parse::<Asset>().is_err());
    }

    #[test]
    fn test_asset_token_ids_are_canonical() {
        assert_eq!(Asset::Near.token_id(), "near");
        assert_eq!(
            Asset::intents("nep141:btc.omft.near").token_id(),
            "intents.near:nep141:btc.omft.near"
        );
        let asset: Asset = "NEAR".parse().unwrap();
        assert_eq!(asset.token_id(), "near");
    }

    #[test]
    fn test_receipt_executor() {
        assert_eq!(Asset::Near.receipt_executor("alice.near"), "alice.near");
        assert_eq!(
            Asset::fungible("wrap.near").receipt_executor("alice.near"),
            "wrap.near"
        );
        assert_eq!(
            Asset::intents("nep141:wrap.near").receipt_executor("alice.near"),
            "intents.near"
        );
    }

    #[test]
    fn test_new_record_derives_amount() {
        let change = BalanceChange::new(
            "alice.near",
            &Asset::Near,
            100,
            0,
            BigDecimal::from(80),
            BigDecimal::from(50),
            "bob.near",
        );
        assert_eq!(change.amount, BigDecimal::from(-30));
        assert!(change.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broken_records() {
        let mut change = BalanceChange::snapshot("alice.near", &Asset::Near, 1, 0, 10.into());
        assert!(change.validate().is_ok());

        change.counterparty = String::new();
        assert!(change.validate().is_err());

        let mut change = BalanceChange::new("alice.near", &Asset::Near, 1, 0, 1.into(), 2.into(), "x");
        change.amount = BigDecimal::from(5);
        assert!(change.validate().is_err());
    }
}
