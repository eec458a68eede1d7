//! Transfer Hint Providers
//!
//! External transfer indexes can name the blocks where transfers happened,
//! sparing the binary search most of its probes. Hints are never trusted: the
//! gap filler verifies each one against archival balances before use.
//!
//! Providers form an ordered fallback chain. The first provider (in
//! registration order) that supports the asset and returns hints wins; a
//! provider that is rate limited, fails, or has nothing for the range hands
//! over to the next one. When the chain is exhausted the caller falls back to
//! binary search.

pub mod fastnear;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use super::error::LedgerResult;
use super::types::Asset;

/// A hint about where a balance change might have occurred
#[derive(Debug, Clone, PartialEq)]
pub struct TransferHint {
    pub block_height: u64,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Transfer amount (optional, for validation)
    pub amount: Option<BigDecimal>,
    /// The other party in the transfer (optional)
    pub counterparty: Option<String>,
    pub receipt_id: Option<String>,
    pub transaction_hash: Option<String>,
    /// Balance at start of block, if the provider reports it
    pub start_of_block_balance: Option<BigDecimal>,
    /// Balance at end of block, if the provider reports it
    pub end_of_block_balance: Option<BigDecimal>,
}

impl TransferHint {
    pub fn at_block(block_height: u64) -> Self {
        Self {
            block_height,
            timestamp_ms: 0,
            amount: None,
            counterparty: None,
            receipt_id: None,
            transaction_hash: None,
            start_of_block_balance: None,
            end_of_block_balance: None,
        }
    }

    /// Whether provider-reported balances rule this hint out without an RPC call.
    ///
    /// A hint whose start and end of block balances are both known and equal
    /// cannot be a change block; a known end balance other than `target`
    /// cannot be the block where the balance reached `target`.
    pub fn ruled_out_for(&self, target: &BigDecimal) -> bool {
        match (&self.start_of_block_balance, &self.end_of_block_balance) {
            (Some(start), Some(end)) if start == end => true,
            (_, Some(end)) => end != target,
            _ => false,
        }
    }
}

/// Provider that can suggest block heights where transfers occurred
#[async_trait]
pub trait TransferHintProvider: Send + Sync {
    /// Provider name for logging and debugging
    fn name(&self) -> &'static str;

    /// Hints for `account_id`/`asset` with `from_block <= block_height <= to_block`,
    /// sorted by block height ascending.
    async fn get_hints(
        &self,
        account_id: &str,
        asset: &Asset,
        from_block: u64,
        to_block: u64,
    ) -> LedgerResult<Vec<TransferHint>>;

    fn supports(&self, asset: &Asset) -> bool;
}

/// Ordered fallback chain of hint providers.
#[derive(Default)]
pub struct TransferHintService {
    providers: Vec<Box<dyn TransferHintProvider>>,
}

impl TransferHintService {
    pub fn new() -> Self {
        Self { providers: vec![] }
    }

    /// Append a provider; earlier providers take precedence.
    pub fn with_provider(mut self, provider: impl TransferHintProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Hints from the first provider in the chain that has any.
    ///
    /// An empty result means the whole chain came up empty and the caller
    /// should binary search.
    pub async fn get_hints(
        &self,
        account_id: &str,
        asset: &Asset,
        from_block: u64,
        to_block: u64,
    ) -> Vec<TransferHint> {
        for provider in self.providers.iter().filter(|p| p.supports(asset)) {
            match provider
                .get_hints(account_id, asset, from_block, to_block)
                .await
            {
                Ok(mut hints) => {
                    hints.retain(|h| h.block_height >= from_block && h.block_height <= to_block);
                    if hints.is_empty() {
                        log::debug!(
                            "Provider {} has no hints for {}/{}, trying next source",
                            provider.name(),
                            account_id,
                            asset
                        );
                        continue;
                    }
                    hints.sort_by_key(|h| h.block_height);
                    hints.dedup_by_key(|h| h.block_height);
                    log::debug!(
                        "Provider {} returned {} hints for {}/{} in [{}, {}]",
                        provider.name(),
                        hints.len(),
                        account_id,
                        asset,
                        from_block,
                        to_block
                    );
                    return hints;
                }
                Err(e) if e.is_rate_limited() => {
                    log::warn!(
                        "Provider {} rate limited for {}/{}, trying next source",
                        provider.name(),
                        account_id,
                        asset
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Provider {} failed for {}/{}: {} - trying next source",
                        provider.name(),
                        account_id,
                        asset,
                        e
                    );
                }
            }
        }

        Vec::new()
    }

    pub fn supports(&self, asset: &Asset) -> bool {
        self.providers.iter().any(|p| p.supports(asset))
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::balance_changes::error::LedgerError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behavior {
        Hints(Vec<u64>),
        RateLimited,
        Fails,
    }

    struct MockProvider {
        name: &'static str,
        near_only: bool,
        behavior: Behavior,
        calls: Arc<AtomicU32>,
    }

    impl MockProvider {
        fn new(name: &'static str, behavior: Behavior) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    name,
                    near_only: false,
                    behavior,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl TransferHintProvider for MockProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn get_hints(
            &self,
            _account_id: &str,
            _asset: &Asset,
            from_block: u64,
            to_block: u64,
        ) -> LedgerResult<Vec<TransferHint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Hints(blocks) => Ok(blocks
                    .iter()
                    .filter(|b| **b >= from_block && **b <= to_block)
                    .map(|b| TransferHint::at_block(*b))
                    .collect()),
                Behavior::RateLimited => Err(LedgerError::RateLimited(self.name.to_string())),
                Behavior::Fails => Err(LedgerError::RpcUnavailable("connection refused".into())),
            }
        }

        fn supports(&self, asset: &Asset) -> bool {
            !self.near_only || *asset == Asset::Near
        }
    }

    #[tokio::test]
    async fn test_empty_chain_returns_no_hints() {
        let service = TransferHintService::new();
        assert_eq!(service.provider_count(), 0);
        assert!(service.get_hints("test.near", &Asset::Near, 1000, 2000).await.is_empty());
    }

    #[tokio::test]
    async fn test_first_provider_with_hints_wins() {
        let (primary, primary_calls) = MockProvider::new("primary", Behavior::Hints(vec![1700, 1500]));
        let (secondary, secondary_calls) = MockProvider::new("secondary", Behavior::Hints(vec![1600]));
        let service = TransferHintService::new()
            .with_provider(primary)
            .with_provider(secondary);

        let hints = service.get_hints("test.near", &Asset::Near, 1000, 2000).await;

        let blocks: Vec<u64> = hints.iter().map(|h| h.block_height).collect();
        assert_eq!(blocks, vec![1500, 1700]);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_provider_falls_through() {
        let (primary, _) = MockProvider::new("primary", Behavior::RateLimited);
        let (secondary, secondary_calls) = MockProvider::new("secondary", Behavior::Hints(vec![1600]));
        let service = TransferHintService::new()
            .with_provider(primary)
            .with_provider(secondary);

        let hints = service.get_hints("test.near", &Asset::Near, 1000, 2000).await;

        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].block_height, 1600);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_and_empty_providers_exhaust_chain() {
        let (failing, _) = MockProvider::new("failing", Behavior::Fails);
        let (empty, empty_calls) = MockProvider::new("empty", Behavior::Hints(vec![]));
        let service = TransferHintService::new()
            .with_provider(failing)
            .with_provider(empty);

        assert!(service.get_hints("test.near", &Asset::Near, 1000, 2000).await.is_empty());
        assert_eq!(empty_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_providers_are_skipped() {
        let (mut near_only, near_calls) = MockProvider::new("near-only", Behavior::Hints(vec![1500]));
        near_only.near_only = true;
        let service = TransferHintService::new().with_provider(near_only);

        let asset = Asset::intents("nep141:btc.omft.near");
        assert!(!service.supports(&asset));
        assert!(service.get_hints("test.near", &asset, 1000, 2000).await.is_empty());
        assert_eq!(near_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_hints_are_dropped() {
        let (provider, _) = MockProvider::new("p", Behavior::Hints(vec![500, 1500, 2500]));
        let service = TransferHintService::new().with_provider(provider);

        let hints = service.get_hints("test.near", &Asset::Near, 1000, 2000).await;
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].block_height, 1500);
    }

    #[test]
    fn test_hint_ruled_out_by_reported_balances() {
        let target = BigDecimal::from(10);

        let mut unchanged = TransferHint::at_block(5);
        unchanged.start_of_block_balance = Some(BigDecimal::from(10));
        unchanged.end_of_block_balance = Some(BigDecimal::from(10));
        assert!(unchanged.ruled_out_for(&target));

        let mut wrong_end = TransferHint::at_block(5);
        wrong_end.end_of_block_balance = Some(BigDecimal::from(7));
        assert!(wrong_end.ruled_out_for(&target));

        let mut plausible = TransferHint::at_block(5);
        plausible.start_of_block_balance = Some(BigDecimal::from(3));
        plausible.end_of_block_balance = Some(BigDecimal::from(10));
        assert!(!plausible.ruled_out_for(&target));

        assert!(!TransferHint::at_block(5).ruled_out_for(&target));
    }
}
