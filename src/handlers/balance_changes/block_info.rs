//! Block Information Service
//!
//! Block metadata (timestamps) and the receipts that touched an account within
//! a block. Raw fetchers talk to the archival node; [`BlockInfoService`] puts
//! moka caches in front of the [`ArchivalRpc`] seam.

use base64::{Engine, engine::general_purpose};
use moka::future::Cache;
use near_api::{Chain, NetworkConfig, Reference};
use near_jsonrpc_client::methods;
use near_primitives::hash::CryptoHash;
use near_primitives::types::{BlockId, BlockReference, Finality, TransactionOrReceiptId};
use near_primitives::views::{ActionView, FinalExecutionOutcomeViewEnum, ReceiptEnumView};
use std::sync::Arc;

use super::error::{LedgerError, LedgerResult};
use super::rpc::ArchivalRpc;
use super::types::{FunctionCallRecord, ReceiptRecord};
use super::utils::with_transport_retry;
use crate::utils::jsonrpc::create_rpc_client;

/// Height of the latest final block.
pub async fn fetch_latest_block_height(network: &NetworkConfig) -> LedgerResult<u64> {
    let block = Chain::block()
        .fetch_from(network)
        .await
        .map_err(|e| LedgerError::from_rpc(&e, 0))?;
    Ok(block.header.height)
}

/// Block timestamp in nanoseconds since Unix epoch.
pub async fn fetch_block_timestamp(network: &NetworkConfig, block_height: u64) -> LedgerResult<i64> {
    let block = Chain::block()
        .at(Reference::AtBlock(block_height))
        .fetch_from(network)
        .await
        .map_err(|e| LedgerError::from_rpc(&e, block_height))?;
    Ok(block.header.timestamp as i64)
}

/// Decode the function calls of a receipt's actions.
///
/// `ActionView` serializes as `{"FunctionCall": {"args": "<base64>", ...}}`;
/// args that are not valid JSON are kept as `None`.
pub fn function_calls_from_actions(actions: &[ActionView]) -> Vec<FunctionCallRecord> {
    actions
        .iter()
        .filter_map(|action| {
            let ActionView::FunctionCall { method_name, .. } = action else {
                return None;
            };
            let args = serde_json::to_value(action)
                .ok()
                .and_then(|v| {
                    v.get("FunctionCall")
                        .and_then(|fc| fc.get("args"))
                        .and_then(|a| a.as_str())
                        .map(str::to_string)
                })
                .and_then(|b64| general_purpose::STANDARD.decode(b64).ok())
                .and_then(|bytes| serde_json::from_slice(&bytes).ok());
            Some(FunctionCallRecord {
                method_name: method_name.clone(),
                args,
            })
        })
        .collect()
}

/// Execution logs of one receipt and the block it executed in.
#[derive(Debug, Clone)]
pub struct ReceiptOutcomeLogs {
    pub receipt_id: String,
    pub block_hash: String,
    pub logs: Vec<String>,
}

/// Attach `outcome` logs to the matching record, unless the receipt executed in
/// another block than `block_hash`. Returns whether a record matched.
pub fn attach_outcome_logs(
    records: &mut [ReceiptRecord],
    block_hash: &str,
    outcome: &ReceiptOutcomeLogs,
    transaction_hash: Option<&str>,
) -> bool {
    if outcome.block_hash != block_hash {
        return false;
    }
    let Some(record) = records.iter_mut().find(|r| r.receipt_id == outcome.receipt_id) else {
        return false;
    };
    record.logs.extend(outcome.logs.iter().cloned());
    if let Some(tx_hash) = transaction_hash {
        record.transaction_hash.get_or_insert_with(|| tx_hash.to_string());
    }
    true
}

/// Receipts executed on `account_id` whose logs are still unknown.
///
/// Transaction records are excluded; their outcome comes from `tx_status`.
pub fn receipts_missing_logs<'a>(records: &'a [ReceiptRecord], account_id: &str) -> Vec<&'a ReceiptRecord> {
    records
        .iter()
        .filter(|r| {
            r.receiver_id == account_id
                && r.logs.is_empty()
                && r.transaction_hash.as_deref() != Some(r.receipt_id.as_str())
        })
        .collect()
}

/// Receipts and signed transactions in `block_height` where `account_id` is
/// the receiver or the predecessor.
///
/// Transactions appear as records whose predecessor is the signer and whose
/// id is the transaction hash. Execution logs come from the transaction
/// outcome for transactions found in the same block, and from the receipt's
/// own execution proof for receipts whose transaction landed earlier.
pub async fn fetch_block_receipts(
    network: &NetworkConfig,
    account_id: &str,
    block_height: u64,
) -> LedgerResult<Vec<ReceiptRecord>> {
    let client = create_rpc_client(network).map_err(|e| LedgerError::Decode(e.to_string()))?;

    let block = with_transport_retry("block", || {
        client.call(methods::block::RpcBlockRequest {
            block_reference: BlockReference::BlockId(BlockId::Height(block_height)),
        })
    })
    .await
    .map_err(|e| LedgerError::from_rpc(&e, block_height))?;

    let block_hash = block.header.hash;
    let block_hash_str = block_hash.to_string();
    let mut records = Vec::new();
    let mut executed_here = Vec::new();
    let mut transactions = Vec::new();

    for chunk_header in &block.chunks {
        let chunk_id: CryptoHash = chunk_header
            .chunk_hash
            .to_string()
            .parse()
            .map_err(|e| LedgerError::Decode(format!("invalid chunk hash: {:?}", e)))?;

        let chunk = with_transport_retry("chunk", || {
            client.call(methods::chunk::RpcChunkRequest {
                chunk_reference: methods::chunk::ChunkReference::ChunkHash { chunk_id },
            })
        })
        .await
        .map_err(|e| LedgerError::from_rpc(&e, block_height))?;

        for tx in &chunk.transactions {
            if tx.signer_id.as_str() != account_id && tx.receiver_id.as_str() != account_id {
                continue;
            }
            records.push(ReceiptRecord {
                receipt_id: tx.hash.to_string(),
                block_height,
                predecessor_id: tx.signer_id.to_string(),
                receiver_id: tx.receiver_id.to_string(),
                signer_id: Some(tx.signer_id.to_string()),
                transaction_hash: Some(tx.hash.to_string()),
                function_calls: function_calls_from_actions(&tx.actions),
                logs: Vec::new(),
            });
            transactions.push((tx.hash, tx.signer_id.clone()));
        }

        for receipt in &chunk.receipts {
            if receipt.receiver_id.as_str() != account_id
                && receipt.predecessor_id.as_str() != account_id
            {
                continue;
            }
            let (signer_id, function_calls) = match &receipt.receipt {
                ReceiptEnumView::Action {
                    signer_id, actions, ..
                } => (Some(signer_id.to_string()), function_calls_from_actions(actions)),
                _ => (None, Vec::new()),
            };
            records.push(ReceiptRecord {
                receipt_id: receipt.receipt_id.to_string(),
                block_height,
                predecessor_id: receipt.predecessor_id.to_string(),
                receiver_id: receipt.receiver_id.to_string(),
                signer_id,
                transaction_hash: None,
                function_calls,
                logs: Vec::new(),
            });
            if receipt.receiver_id.as_str() == account_id {
                executed_here.push((receipt.receipt_id, receipt.receiver_id.clone()));
            }
        }
    }

    for (tx_hash, sender) in transactions {
        let outcome = with_transport_retry("tx_status", || {
            client.call(methods::tx::RpcTransactionStatusRequest {
                transaction_info: methods::tx::TransactionInfo::TransactionId {
                    tx_hash,
                    sender_account_id: sender.clone(),
                },
                wait_until: near_primitives::views::TxExecutionStatus::Final,
            })
        })
        .await;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Failed to fetch outcome of tx {}: {} - logs unavailable", tx_hash, e);
                continue;
            }
        };

        let receipts_outcome = match &response.final_execution_outcome {
            Some(FinalExecutionOutcomeViewEnum::FinalExecutionOutcome(outcome)) => {
                &outcome.receipts_outcome
            }
            Some(FinalExecutionOutcomeViewEnum::FinalExecutionOutcomeWithReceipt(outcome)) => {
                &outcome.final_outcome.receipts_outcome
            }
            None => continue,
        };

        let tx_hash = tx_hash.to_string();
        for receipt_outcome in receipts_outcome {
            let outcome = ReceiptOutcomeLogs {
                receipt_id: receipt_outcome.id.to_string(),
                block_hash: receipt_outcome.block_hash.to_string(),
                logs: receipt_outcome.outcome.logs.clone(),
            };
            attach_outcome_logs(&mut records, &block_hash_str, &outcome, Some(&tx_hash));
        }
    }

    let pending: Vec<String> = receipts_missing_logs(&records, account_id)
        .into_iter()
        .map(|r| r.receipt_id.clone())
        .collect();
    if pending.is_empty() {
        return Ok(records);
    }

    // Execution proofs need a final head past the receipt's block.
    let head = with_transport_retry("final_block", || {
        client.call(methods::block::RpcBlockRequest {
            block_reference: BlockReference::Finality(Finality::Final),
        })
    })
    .await
    .map_err(|e| LedgerError::from_rpc(&e, block_height))?
    .header
    .hash;

    for (receipt_id, receiver_id) in executed_here {
        if !pending.contains(&receipt_id.to_string()) {
            continue;
        }
        let proof = with_transport_retry("light_client_proof", || {
            client.call(methods::light_client_proof::RpcLightClientExecutionProofRequest {
                id: TransactionOrReceiptId::Receipt {
                    receipt_id,
                    receiver_id: receiver_id.clone(),
                },
                light_client_head: head,
            })
        })
        .await;

        match proof {
            Ok(proof) => {
                let outcome = ReceiptOutcomeLogs {
                    receipt_id: proof.outcome_proof.id.to_string(),
                    block_hash: proof.outcome_proof.block_hash.to_string(),
                    logs: proof.outcome_proof.outcome.logs,
                };
                attach_outcome_logs(&mut records, &block_hash_str, &outcome, None);
            }
            Err(e) => {
                log::warn!("Failed to fetch outcome of receipt {}: {} - logs unavailable", receipt_id, e);
            }
        }
    }

    Ok(records)
}

/// Cached access to block timestamps and per-account block receipts.
#[derive(Clone)]
pub struct BlockInfoService {
    rpc: Arc<dyn ArchivalRpc>,
    timestamps: Cache<u64, i64>,
    receipts: Cache<(String, u64), Arc<Vec<ReceiptRecord>>>,
}

impl BlockInfoService {
    pub fn new(rpc: Arc<dyn ArchivalRpc>) -> Self {
        Self {
            rpc,
            timestamps: Cache::builder().max_capacity(100_000).build(),
            receipts: Cache::builder().max_capacity(10_000).build(),
        }
    }

    /// Timestamp (ns) of `block_height`. Fails with `BlockNotFound` past the chain head.
    pub async fn timestamp_of(&self, block_height: u64) -> LedgerResult<i64> {
        if let Some(timestamp) = self.timestamps.get(&block_height).await {
            return Ok(timestamp);
        }
        let timestamp = self.rpc.block_timestamp(block_height).await?;
        self.timestamps.insert(block_height, timestamp).await;
        Ok(timestamp)
    }

    /// Receipts in `block_height` touching `account_id`. An empty list is a valid answer.
    pub async fn receipts_for(
        &self,
        account_id: &str,
        block_height: u64,
    ) -> LedgerResult<Arc<Vec<ReceiptRecord>>> {
        let key = (account_id.to_string(), block_height);
        if let Some(receipts) = self.receipts.get(&key).await {
            return Ok(receipts);
        }
        let receipts = Arc::new(self.rpc.block_receipts(account_id, block_height).await?);
        self.receipts.insert(key, receipts.clone()).await;
        Ok(receipts)
    }

    pub async fn latest_block_height(&self) -> LedgerResult<u64> {
        self.rpc.latest_block_height().await
    }
}
