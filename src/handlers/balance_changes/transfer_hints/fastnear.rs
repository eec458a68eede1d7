//! FastNear Transfers API Provider
//!
//! Implements [`TransferHintProvider`] on top of FastNear's transfers-api.
//! API Documentation: https://github.com/fastnear/transfers-api
//!
//! Supports native NEAR and NEP-141 tokens; multi-token holdings are not indexed.
//!
//! `POST https://transfers.main.fastnear.com/v0/transfers`

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{TransferHint, TransferHintProvider};
use crate::handlers::balance_changes::block_info::BlockInfoService;
use crate::handlers::balance_changes::error::{LedgerError, LedgerResult};
use crate::handlers::balance_changes::types::Asset;

pub const DEFAULT_BASE_URL: &str = "https://transfers.main.fastnear.com";
const PAGE_SIZE: u32 = 1000;

pub struct FastNearProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    /// Resolves block heights to the timestamps the API filters on
    blocks: BlockInfoService,
}

impl FastNearProvider {
    pub fn new(client: Client, blocks: BlockInfoService) -> Self {
        Self::with_base_url(client, blocks, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(client: Client, blocks: BlockInfoService, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: None,
            blocks,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    async fn block_timestamp_ms(&self, block_height: u64) -> LedgerResult<u64> {
        let timestamp_ns = self.blocks.timestamp_of(block_height).await?;
        Ok((timestamp_ns as u64) / 1_000_000)
    }

    async fn query_transfers(&self, request: &TransfersRequest) -> LedgerResult<TransfersResponse> {
        let url = format!("{}/v0/transfers", self.base_url);

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LedgerError::RpcUnavailable(format!("FastNear request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::RateLimited("FastNear".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::RpcUnavailable(format!(
                "FastNear API error: {} - {}",
                status, body
            )));
        }

        response
            .json::<TransfersResponse>()
            .await
            .map_err(|e| LedgerError::Decode(format!("FastNear response: {}", e)))
    }
}

#[async_trait]
impl TransferHintProvider for FastNearProvider {
    fn name(&self) -> &'static str {
        "FastNear"
    }

    async fn get_hints(
        &self,
        account_id: &str,
        asset: &Asset,
        from_block: u64,
        to_block: u64,
    ) -> LedgerResult<Vec<TransferHint>> {
        let token_id = asset.token_id();
        let from_timestamp_ms = self.block_timestamp_ms(from_block).await?;
        let to_timestamp_ms = self.block_timestamp_ms(to_block).await?;

        let mut hints = Vec::new();
        let mut resume_token: Option<String> = None;

        loop {
            let request = TransfersRequest {
                account_id: account_id.to_string(),
                from_timestamp_ms: Some(from_timestamp_ms),
                to_timestamp_ms: Some(to_timestamp_ms),
                limit: Some(PAGE_SIZE),
                desc: Some(false),
                resume_token: resume_token.clone(),
            };

            let response = self.query_transfers(&request).await?;

            hints.extend(
                response
                    .transfers
                    .iter()
                    .filter(|t| t.matches_token(&token_id))
                    .filter(|t| t.block_height >= from_block && t.block_height <= to_block)
                    .map(Transfer::to_hint),
            );

            match response.resume_token {
                Some(token) if !response.transfers.is_empty() => resume_token = Some(token),
                _ => break,
            }
        }

        hints.sort_by_key(|h| h.block_height);

        log::debug!(
            "FastNear returned {} hints for {}/{} in blocks {}-{}",
            hints.len(),
            account_id,
            token_id,
            from_block,
            to_block
        );

        Ok(hints)
    }

    fn supports(&self, asset: &Asset) -> bool {
        !matches!(asset, Asset::Intents { .. })
    }
}

/// Request body for the FastNear transfers API
#[derive(Debug, Serialize)]
struct TransfersRequest {
    account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_timestamp_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_timestamp_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    desc: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransfersResponse {
    transfers: Vec<Transfer>,
    resume_token: Option<String>,
}

/// Heights and timestamps arrive either as strings or numbers.
fn deserialize_string_or_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrU64Visitor;

    impl<'de> Visitor<'de> for StringOrU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or integer")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value.parse().map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(StringOrU64Visitor)
}

/// A single transfer record, e.g.
///
/// ```json
/// {
///   "account_id": "petersalomonsen.near",
///   "asset_id": "nep141:token.near",
///   "asset_type": "Ft",
///   "block_height": "140091715",
///   "block_timestamp": "1739954687907236131",
///   "amount": "9300000000",
///   "other_account_id": "pay.reqnetwork.near",
///   "predecessor_id": "pay.reqnetwork.near",
///   "receipt_id": "5rnW3axTPEsVWexkTSrhzUpivomwLQx5hL9TGA5QX9sf",
///   "signer_id": "nf-payments2.near",
///   "transaction_id": "GUev6hLpM4SYKNsX6YV9KRsr7jVkj4aAj2ZsMyKGE1e"
/// }
/// ```
#[derive(Debug, Deserialize)]
struct Transfer {
    #[serde(deserialize_with = "deserialize_string_or_u64")]
    block_height: u64,
    /// Nanoseconds
    #[serde(deserialize_with = "deserialize_string_or_u64")]
    block_timestamp: u64,
    receipt_id: Option<String>,
    transaction_id: Option<String>,
    other_account_id: Option<String>,
    predecessor_id: Option<String>,
    signer_id: Option<String>,
    /// "Near" or "Ft"
    asset_type: String,
    /// "nep141:contract.near" or just "contract.near"
    asset_id: Option<String>,
    amount: Option<String>,
    start_of_block_balance: Option<String>,
    end_of_block_balance: Option<String>,
}

impl Transfer {
    fn counterparty(&self) -> Option<&str> {
        self.other_account_id
            .as_deref()
            .or(self.predecessor_id.as_deref())
            .or(self.signer_id.as_deref())
    }

    fn timestamp_ms(&self) -> u64 {
        self.block_timestamp / 1_000_000
    }

    fn matches_token(&self, token_id: &str) -> bool {
        match self.asset_type.as_str() {
            "Near" => token_id.eq_ignore_ascii_case("near"),
            "Ft" => self.asset_id.as_deref().is_some_and(|asset_id| {
                asset_id
                    .strip_prefix("nep141:")
                    .unwrap_or(asset_id)
                    .eq_ignore_ascii_case(token_id)
            }),
            _ => false,
        }
    }

    fn to_hint(&self) -> TransferHint {
        let decimal = |v: &Option<String>| v.as_deref().and_then(|s| BigDecimal::from_str(s).ok());
        TransferHint {
            block_height: self.block_height,
            timestamp_ms: self.timestamp_ms(),
            amount: decimal(&self.amount),
            counterparty: self.counterparty().map(str::to_string),
            receipt_id: self.receipt_id.clone(),
            transaction_hash: self.transaction_id.clone(),
            start_of_block_balance: decimal(&self.start_of_block_balance),
            end_of_block_balance: decimal(&self.end_of_block_balance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_near_transfer() -> Transfer {
        Transfer {
            block_height: 1000,
            block_timestamp: 1739954687907236131,
            receipt_id: Some("receipt1".to_string()),
            transaction_id: Some("tx1".to_string()),
            other_account_id: Some("other.near".to_string()),
            predecessor_id: Some("sender.near".to_string()),
            signer_id: Some("signer.near".to_string()),
            asset_type: "Near".to_string(),
            asset_id: None,
            amount: Some("1000000000000000000000000".to_string()),
            start_of_block_balance: Some("5000000000000000000000000".to_string()),
            end_of_block_balance: Some("6000000000000000000000000".to_string()),
        }
    }

    fn make_ft_transfer(contract: &str) -> Transfer {
        Transfer {
            asset_type: "Ft".to_string(),
            asset_id: Some(format!("nep141:{}", contract)),
            amount: Some("1000000".to_string()),
            start_of_block_balance: Some("5000000".to_string()),
            end_of_block_balance: Some("6000000".to_string()),
            ..make_near_transfer()
        }
    }

    #[test]
    fn test_transfer_matches_token() {
        let near_transfer = make_near_transfer();
        assert!(near_transfer.matches_token("near"));
        assert!(!near_transfer.matches_token("wrap.near"));

        let ft_transfer = make_ft_transfer("wrap.near");
        assert!(ft_transfer.matches_token("wrap.near"));
        assert!(ft_transfer.matches_token("WRAP.NEAR"));
        assert!(!ft_transfer.matches_token("near"));

        let mut unprefixed = make_ft_transfer("wrap.near");
        unprefixed.asset_id = Some("wrap.near".to_string());
        assert!(unprefixed.matches_token("wrap.near"));
    }

    #[test]
    fn test_transfer_counterparty_priority() {
        let mut transfer = make_near_transfer();
        assert_eq!(transfer.counterparty(), Some("other.near"));

        transfer.other_account_id = None;
        assert_eq!(transfer.counterparty(), Some("sender.near"));

        transfer.predecessor_id = None;
        assert_eq!(transfer.counterparty(), Some("signer.near"));

        transfer.signer_id = None;
        assert_eq!(transfer.counterparty(), None);
    }

    #[test]
    fn test_transfer_to_hint() {
        let hint = make_near_transfer().to_hint();
        assert_eq!(hint.block_height, 1000);
        assert_eq!(hint.timestamp_ms, 1739954687907);
        assert_eq!(hint.counterparty.as_deref(), Some("other.near"));
        assert_eq!(
            hint.end_of_block_balance,
            Some("6000000000000000000000000".parse().unwrap())
        );
    }

    #[test]
    fn test_response_accepts_string_and_numeric_heights() {
        let body = r#"{
            "transfers": [
                {"block_height": "140091715", "block_timestamp": 1739954687907236131,
                 "asset_type": "Near", "receipt_id": null, "transaction_id": null,
                 "other_account_id": "bob.near", "predecessor_id": null, "signer_id": null,
                 "asset_id": null, "amount": "1", "start_of_block_balance": null,
                 "end_of_block_balance": null}
            ],
            "resume_token": null
        }"#;
        let response: TransfersResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.transfers[0].block_height, 140091715);
        assert!(response.resume_token.is_none());
    }
}
