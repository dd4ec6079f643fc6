//! # cascache
//!
//! Local disk cache for immutable, content-addressed objects.
//!
//! ## Guarantees
//! - Objects appear atomically: staged in `txn/`, published by rename
//! - Every successful publish and open is reported to a pluggable quota manager
//! - A writable cache can be drained to read-only without losing in-flight writes

#![warn(missing_docs)]

mod config;
mod error;
mod fd;
mod hash;
mod manager;
mod memory;
mod posix;
mod quota;

pub use config::CacheConfig;
pub use error::{Error, Result};
pub use hash::{Algorithm, ObjectId, MAX_DIGEST_SIZE};
pub use manager::{CacheManager, Fd, TxnFlags};
pub use memory::{MemoryCacheManager, MemoryTxn};
pub use posix::{CacheMode, PosixCacheManager, Transaction, TXN_DIR};
pub use quota::{NoopQuotaManager, QuotaManager};
