//! Error taxonomy for the balance ledger.
//!
//! Archival RPC failures arrive as opaque client errors; [`LedgerError::from_rpc`]
//! classifies them by message so callers can decide between retrying in place,
//! falling back to another source, or abandoning the unit of work.

use bigdecimal::BigDecimal;
use thiserror::Error;

use super::utils::is_transport_error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("archival RPC unavailable: {0}")]
    RpcUnavailable(String),

    #[error("rate limited by {0}")]
    RateLimited(String),

    #[error("block {0} is not indexed by the archival node")]
    BlockNotIndexed(u64),

    #[error("block {0} not found")]
    BlockNotFound(u64),

    #[error("historical state unavailable at block {0}")]
    HistoricalStateUnavailable(u64),

    #[error("malformed receipt {receipt_id}: {reason}")]
    MalformedReceipt { receipt_id: String, reason: String },

    #[error("invalid asset identifier '{0}'")]
    InvalidAsset(String),

    #[error(
        "no balance change reaching {target} found for {account_id}/{token_id} in blocks [{from_block}, {to_block})"
    )]
    ChangeBlockNotFound {
        account_id: String,
        token_id: String,
        from_block: u64,
        to_block: u64,
        target: BigDecimal,
    },

    #[error("refusing snapshot for {account_id}/{token_id} at block {block_height}: balance moved {before} -> {after}")]
    SnapshotMismatch {
        account_id: String,
        token_id: String,
        block_height: u64,
        before: BigDecimal,
        after: BigDecimal,
    },

    #[error("{remaining} gap(s) left for {account_id}/{token_id} after {fills} fill(s) this run")]
    GapsRemaining {
        account_id: String,
        token_id: String,
        fills: usize,
        remaining: usize,
    },

    #[error("invalid balance change for {account_id}/{token_id} at block {block_height}: {reason}")]
    InvalidRecord {
        account_id: String,
        token_id: String,
        block_height: i64,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Classify an RPC client error raised while querying `block_height`.
    pub fn from_rpc<E: std::fmt::Debug + std::fmt::Display>(err: &E, block_height: u64) -> Self {
        let message = format!("{} ({:?})", err, err);
        classify_rpc_message(&message, block_height)
    }

    /// Errors worth retrying in place with a short backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::RpcUnavailable(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LedgerError::RateLimited(_))
    }
}

/// Map an RPC error message onto the ledger taxonomy.
pub fn classify_rpc_message(message: &str, block_height: u64) -> LedgerError {
    if message.contains("UnknownBlock") || message.contains("UNKNOWN_BLOCK") {
        return LedgerError::BlockNotFound(block_height);
    }
    if message.contains("GarbageCollected")
        || message.contains("garbage collected")
        || message.contains("MissingTrieValue")
        || message.contains("TrieNodeMissing")
    {
        return LedgerError::HistoricalStateUnavailable(block_height);
    }
    if message.contains("Too Many Requests") || message.contains("status code 429") {
        return LedgerError::RateLimited(message.to_string());
    }
    if message.contains("Unprocessable Entity") || message.contains("status code 422") {
        return LedgerError::BlockNotIndexed(block_height);
    }
    if is_transport_error(message) {
        return LedgerError::RpcUnavailable(message.to_string());
    }
    LedgerError::Decode(message.to_string())
}

/// Errors meaning the queried account or contract does not exist at that block.
/// Balance queries treat these as a zero balance.
pub fn is_missing_account_message(message: &str) -> bool {
    message.contains("UnknownAccount")
        || message.contains("does not exist while viewing")
        || message.contains("CodeDoesNotExist")
        || message.contains("NoContractCode")
        || message.contains("contract code is not deployed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rpc_messages() {
        assert!(matches!(
            classify_rpc_message("HTTP 429 Too Many Requests", 10),
            LedgerError::RateLimited(_)
        ));
        assert!(matches!(
            classify_rpc_message("server returned 422 Unprocessable Entity", 10),
            LedgerError::BlockNotIndexed(10)
        ));
        assert!(matches!(
            classify_rpc_message("Handler error: UnknownBlock { block_reference: .. }", 7),
            LedgerError::BlockNotFound(7)
        ));
        assert!(matches!(
            classify_rpc_message("state at block was GarbageCollected", 3),
            LedgerError::HistoricalStateUnavailable(3)
        ));
        assert!(matches!(
            classify_rpc_message("TransportError(SendError(..))", 1),
            LedgerError::RpcUnavailable(_)
        ));
        assert!(matches!(
            classify_rpc_message("something else entirely", 1),
            LedgerError::Decode(_)
        ));
    }

    #[test]
    fn test_retry_classification() {
        assert!(LedgerError::RpcUnavailable("timed out".into()).is_retryable());
        assert!(!LedgerError::BlockNotFound(1).is_retryable());
        assert!(LedgerError::RateLimited("fastnear".into()).is_rate_limited());
    }

    #[test]
    fn test_missing_account_detection() {
        assert!(is_missing_account_message(
            "UnknownAccount { requested_account_id: \"x.near\" }"
        ));
        assert!(!is_missing_account_message("connection reset"));
    }
}
