//! Quota manager contract
//!
//! The cache manager reports every successful publish (`insert`,
//! `insert_volatile`) and every successful open (`touch`). Pinning, removal
//! and cleanup are driven by higher-level collaborators that share the same
//! quota manager instance.

use crate::hash::ObjectId;

/// Accounting and eviction policy for a cache directory
pub trait QuotaManager: Send + Sync {
    /// Whether the manager actually enforces a size limit
    fn is_enforcing(&self) -> bool;

    /// Register a newly published object
    fn insert(&self, id: &ObjectId, size: u64, description: &str);

    /// Register a newly published object that should be evicted early
    fn insert_volatile(&self, id: &ObjectId, size: u64, description: &str);

    /// Protect an object from eviction; false if it cannot be pinned
    fn pin(&self, id: &ObjectId, size: u64, description: &str, is_catalog: bool) -> bool;

    /// Release a pin
    fn unpin(&self, id: &ObjectId);

    /// Record an access
    fn touch(&self, id: &ObjectId);

    /// Forget an object and delete it from the cache
    fn remove(&self, id: &ObjectId);

    /// Evict until at most `leave_size` bytes remain; false if not reachable
    fn cleanup(&self, leave_size: u64) -> bool;

    /// Configured limit in bytes, 0 if unlimited
    fn capacity(&self) -> u64 {
        0
    }

    /// Bytes currently accounted
    fn size(&self) -> u64 {
        0
    }

    /// Bytes currently pinned
    fn size_pinned(&self) -> u64 {
        0
    }

    /// Descriptions of all tracked objects
    fn list(&self) -> Vec<String> {
        Vec::new()
    }

    /// Descriptions of all pinned objects
    fn list_pinned(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Quota manager that tracks nothing and never evicts
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopQuotaManager;

impl QuotaManager for NoopQuotaManager {
    fn is_enforcing(&self) -> bool {
        false
    }

    fn insert(&self, _id: &ObjectId, _size: u64, _description: &str) {}

    fn insert_volatile(&self, _id: &ObjectId, _size: u64, _description: &str) {}

    fn pin(&self, _id: &ObjectId, _size: u64, _description: &str, _is_catalog: bool) -> bool {
        true
    }

    fn unpin(&self, _id: &ObjectId) {}

    fn touch(&self, _id: &ObjectId) {}

    fn remove(&self, _id: &ObjectId) {}

    fn cleanup(&self, _leave_size: u64) -> bool {
        true
    }
}
