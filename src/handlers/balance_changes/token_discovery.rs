//! Token Discovery Service
//!
//! Finds assets a monitored account holds beyond native NEAR:
//! - NEP-141 tokens, by inspecting the receipts around native balance changes
//!   (an FT call costs gas, so it always leaves a native trace, but the token
//!   receipt may execute a few blocks later);
//! - NEP-245 multi-tokens, by polling the multi-token contract, since those
//!   balances can change without any native trace.

use bigdecimal::BigDecimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::block_info::BlockInfoService;
use super::counterparty::parse_event_log;
use super::error::{LedgerError, LedgerResult};
use super::gap_filler::GapFiller;
use super::rpc::ArchivalRpc;
use super::types::{Asset, BalanceChange, INTENTS_CONTRACT, ReceiptRecord, SYSTEM};

/// Blocks after a native change whose receipts are inspected.
pub const FT_RECEIPT_LOOKAHEAD: u64 = 3;

/// Extract FT token contract addresses from a receipt
///
/// Matches NEP-141 event emitters and the FT method calls:
/// - ft_transfer / ft_transfer_call: the receiver is the token contract
/// - ft_on_transfer (callback): the predecessor is the token contract
pub fn extract_ft_tokens_from_receipt(receipt: &ReceiptRecord, account_id: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();

    for log in &receipt.logs {
        if let Some(Ok(event)) = parse_event_log(&receipt.receipt_id, log)
            && event.standard == "nep141"
        {
            tokens.insert(receipt.receiver_id.clone());
        }
    }

    for method in receipt.method_names() {
        match method {
            "ft_transfer" | "ft_transfer_call" => {
                tokens.insert(receipt.receiver_id.clone());
            }
            "ft_on_transfer" => {
                tokens.insert(receipt.predecessor_id.clone());
            }
            _ => {}
        }
    }

    tokens.retain(|t| t != account_id && t != SYSTEM && t != INTENTS_CONTRACT);
    tokens
}

#[derive(Clone)]
pub struct TokenDiscovery {
    rpc: Arc<dyn ArchivalRpc>,
    blocks: BlockInfoService,
    intents_contract: String,
}

impl TokenDiscovery {
    pub fn new(rpc: Arc<dyn ArchivalRpc>, blocks: BlockInfoService) -> Self {
        Self {
            rpc,
            blocks,
            intents_contract: INTENTS_CONTRACT.to_string(),
        }
    }

    /// FT contracts referenced by receipts in blocks `N..=N+3` of each native
    /// change, each with the earliest native change block that revealed it.
    ///
    /// Lookup failures are logged and skipped; discovery never blocks the cycle.
    pub async fn discover_ft_tokens(
        &self,
        account_id: &str,
        near_changes: &[BalanceChange],
    ) -> Vec<(Asset, u64)> {
        let mut contracts: BTreeMap<String, u64> = BTreeMap::new();

        for change in near_changes.iter().filter(|c| !c.is_snapshot()) {
            let start = change.block_height as u64;
            for block_height in start..=start + FT_RECEIPT_LOOKAHEAD {
                match self.blocks.receipts_for(account_id, block_height).await {
                    Ok(receipts) => {
                        for receipt in receipts.iter() {
                            for contract in extract_ft_tokens_from_receipt(receipt, account_id) {
                                let revealed_at = contracts.entry(contract).or_insert(start);
                                *revealed_at = (*revealed_at).min(start);
                            }
                        }
                    }
                    Err(LedgerError::BlockNotFound(_)) => break,
                    Err(e) => {
                        log::warn!(
                            "Token discovery: receipts for {} at block {} unavailable: {}",
                            account_id,
                            block_height,
                            e
                        );
                    }
                }
            }
        }

        if !contracts.is_empty() {
            log::info!(
                "Discovered {} FT contract(s) for {}: {:?}",
                contracts.len(),
                account_id,
                contracts.keys()
            );
        }

        contracts
            .into_iter()
            .map(|(contract, revealed_at)| (Asset::fungible(contract), revealed_at))
            .collect()
    }

    /// Multi-token holdings with a non-zero balance at `block_height`.
    pub async fn discover_intents_tokens(
        &self,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<Vec<(Asset, BigDecimal)>> {
        let token_ids = self
            .rpc
            .mt_tokens_for_owner(&self.intents_contract, account_id, block_height)
            .await?;
        if token_ids.is_empty() {
            return Ok(Vec::new());
        }

        let balances = self
            .rpc
            .mt_batch_balance_of(&self.intents_contract, account_id, &token_ids, block_height)
            .await?;

        let zero = BigDecimal::from(0);
        let holdings: Vec<(Asset, BigDecimal)> = token_ids
            .into_iter()
            .zip(balances)
            .filter(|(_, balance)| *balance != zero)
            .map(|(token_id, balance)| {
                (
                    Asset::Intents {
                        contract: self.intents_contract.clone(),
                        token_id,
                    },
                    balance,
                )
            })
            .collect();

        log::debug!(
            "{} holds {} multi-token asset(s) at block {}",
            account_id,
            holdings.len(),
            block_height
        );

        Ok(holdings)
    }

    /// Give a newly observed asset its first ledger row.
    ///
    /// A held asset gets a zero-delta snapshot at `block_height`, unless the
    /// balance moved within that very block (the regular seeding pass records
    /// that change instead). An asset the account no longer holds is anchored
    /// just before `revealed_at`, the block of the native change that revealed
    /// it, so the present and past passes can recover its history.
    pub async fn bootstrap_asset(
        &self,
        filler: &GapFiller,
        account_id: &str,
        asset: &Asset,
        block_height: u64,
        revealed_at: Option<u64>,
    ) -> LedgerResult<Vec<BalanceChange>> {
        let balance = filler.balance_at(account_id, asset, block_height).await?;
        if balance == BigDecimal::from(0) {
            return match revealed_at {
                Some(revealed_at) => self.anchor_touched_asset(filler, account_id, asset, revealed_at).await,
                None => Ok(Vec::new()),
            };
        }

        match filler.insert_snapshot(account_id, asset, block_height).await {
            Ok(snapshot) => {
                log::info!(
                    "Bootstrapped {}/{} with snapshot at block {} (balance {})",
                    account_id,
                    asset,
                    block_height,
                    snapshot.balance_after
                );
                Ok(vec![snapshot])
            }
            Err(LedgerError::SnapshotMismatch { .. }) => {
                log::info!(
                    "{}/{} changed at block {}, leaving it to the seeding pass",
                    account_id,
                    asset,
                    block_height
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn anchor_touched_asset(
        &self,
        filler: &GapFiller,
        account_id: &str,
        asset: &Asset,
        revealed_at: u64,
    ) -> LedgerResult<Vec<BalanceChange>> {
        let first = revealed_at.saturating_sub(1);
        let last = first.saturating_sub(FT_RECEIPT_LOOKAHEAD);

        for anchor in (last..=first).rev() {
            let snapshot = match filler.insert_snapshot(account_id, asset, anchor).await {
                Ok(snapshot) => snapshot,
                Err(LedgerError::SnapshotMismatch { .. }) => continue,
                Err(e) => return Err(e),
            };
            log::info!(
                "Anchored {}/{} (zero balance now) with snapshot at block {} (balance {})",
                account_id,
                asset,
                anchor,
                snapshot.balance_after
            );

            let mut records = vec![snapshot];
            // Held nothing before: the touch itself may be the only trace.
            if records[0].balance_after == BigDecimal::from(0) {
                records.extend(
                    filler
                        .fill_all(account_id, asset, revealed_at + FT_RECEIPT_LOOKAHEAD)
                        .await?,
                );
            }
            return Ok(records);
        }

        log::warn!(
            "No stable block before {} to anchor {}/{}",
            revealed_at,
            account_id,
            asset
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::balance_changes::types::FunctionCallRecord;

    fn receipt(predecessor: &str, receiver: &str, method: Option<&str>) -> ReceiptRecord {
        ReceiptRecord {
            receipt_id: "r".to_string(),
            block_height: 10,
            predecessor_id: predecessor.to_string(),
            receiver_id: receiver.to_string(),
            function_calls: method
                .map(|m| {
                    vec![FunctionCallRecord {
                        method_name: m.to_string(),
                        args: None,
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_outgoing_ft_transfer_names_contract() {
        let r = receipt("alice.near", "usdt.tether-token.near", Some("ft_transfer_call"));
        let tokens = extract_ft_tokens_from_receipt(&r, "alice.near");
        assert_eq!(tokens.into_iter().collect::<Vec<_>>(), vec!["usdt.tether-token.near"]);
    }

    #[test]
    fn test_ft_on_transfer_names_sender_contract() {
        let r = receipt("wrap.near", "alice.near", Some("ft_on_transfer"));
        let tokens = extract_ft_tokens_from_receipt(&r, "alice.near");
        assert_eq!(tokens.into_iter().collect::<Vec<_>>(), vec!["wrap.near"]);
    }

    #[test]
    fn test_nep141_event_emitter_is_a_token() {
        let mut r = receipt("bob.near", "token.v2.ref-finance.near", None);
        r.logs.push(
            r#"EVENT_JSON:{"standard":"nep141","version":"1.0.0","event":"ft_transfer","data":[{"old_owner_id":"bob.near","new_owner_id":"alice.near","amount":"1"}]}"#
                .to_string(),
        );
        let tokens = extract_ft_tokens_from_receipt(&r, "alice.near");
        assert!(tokens.contains("token.v2.ref-finance.near"));
    }

    #[test]
    fn test_plain_transfers_and_other_calls_are_ignored() {
        assert!(extract_ft_tokens_from_receipt(&receipt("bob.near", "alice.near", None), "alice.near").is_empty());
        assert!(
            extract_ft_tokens_from_receipt(&receipt("alice.near", "dao.near", Some("add_proposal")), "alice.near")
                .is_empty()
        );
    }
}
