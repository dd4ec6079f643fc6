//! # casquota
//!
//! LRU quota manager for cascache directories.
//!
//! ## Architecture
//! - **Ledger**: AHash map plus index-linked list, O(1) touch
//! - **Eviction**: volatile objects first, then least recently used
//! - **Pins**: pinned objects are never evicted, pins are bounded by the limit
//! - **Rebuild**: the ledger can be reconstructed from the files on disk

#![warn(missing_docs)]

mod lru;
mod manager;
mod stats;

pub use manager::LruQuotaManager;
pub use stats::QuotaStats;
