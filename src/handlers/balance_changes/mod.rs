//! Balance Change Ledger
//!
//! Reconciles an append-only ledger of balance changes per (account, asset)
//! against archival RPC state. The ledger is the only state: gaps in the
//! before/after chain are the work queue, and filling them is the only repair.

pub mod account_monitor;
pub mod balance;
pub mod binary_search;
pub mod block_info;
pub mod completeness;
pub mod counterparty;
pub mod error;
pub mod gap_detector;
pub mod gap_filler;
pub mod rpc;
pub mod store;
pub mod token_discovery;
pub mod transfer_hints;
pub mod types;
pub mod utils;

pub use error::{LedgerError, LedgerResult};
pub use types::{Asset, BalanceChange};
