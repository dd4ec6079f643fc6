//! LruQuotaManager: LRU accounting over a cascache directory

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cascache::{ObjectId, QuotaManager, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::lru::LruList;
use crate::stats::QuotaStats;

/// Ledger record of one object
#[derive(Debug, Clone)]
struct Entry {
    size: u64,
    description: String,
    pinned: bool,
    is_catalog: bool,
    volatile: bool,
}

#[derive(Default)]
struct Ledger {
    lru: LruList<ObjectId, Entry>,
    size: u64,
    pinned: u64,
}

/// Quota manager evicting least recently used objects from a cache root
///
/// Volatile objects go first, pinned objects never. Evicted objects are
/// unlinked from `<cache_root>/<shard>/<rest>`.
pub struct LruQuotaManager {
    cache_root: PathBuf,
    limit: u64,
    cleanup_threshold: u64,
    ledger: Mutex<Ledger>,
    stats: QuotaStats,
}

impl LruQuotaManager {
    /// Create a manager for the cache at `cache_root`
    ///
    /// # Arguments
    /// * `cache_root` - Root directory of the cache
    /// * `limit` - Size limit in bytes, 0 disables enforcement
    /// * `cleanup_threshold` - Size to shrink to once the limit is exceeded
    pub fn new<P: AsRef<Path>>(cache_root: P, limit: u64, cleanup_threshold: u64) -> Self {
        Self {
            cache_root: cache_root.as_ref().to_path_buf(),
            limit,
            cleanup_threshold: cleanup_threshold.min(limit),
            ledger: Mutex::new(Ledger::default()),
            stats: QuotaStats::new(),
        }
    }

    /// Command statistics
    pub fn stats(&self) -> &QuotaStats {
        &self.stats
    }

    /// Size the cache shrinks to when the limit is exceeded
    pub fn cleanup_threshold(&self) -> u64 {
        self.cleanup_threshold
    }

    /// Number of tracked objects
    pub fn len(&self) -> usize {
        self.ledger.lock().lru.len()
    }

    /// Whether no object is tracked
    pub fn is_empty(&self) -> bool {
        self.ledger.lock().lru.is_empty()
    }

    /// Whether an object is tracked
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.ledger.lock().lru.peek(id).is_some()
    }

    /// Whether an object is pinned
    pub fn is_pinned(&self, id: &ObjectId) -> bool {
        self.ledger
            .lock()
            .lru
            .peek(id)
            .map(|entry| entry.pinned)
            .unwrap_or(false)
    }

    /// Replace the ledger with the objects currently on disk.
    ///
    /// Older files (by modification time) end up colder. Pins are lost.
    pub fn rebuild(&self) -> Result<usize> {
        let mut found: Vec<(SystemTime, ObjectId, u64)> = Vec::new();

        for shard in 0..=u8::MAX {
            let shard_name = format!("{:02x}", shard);
            let entries = match fs::read_dir(self.cache_root.join(&shard_name)) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                let entry = entry?;
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                let file_name = entry.file_name();
                let Some(rest) = file_name.to_str() else {
                    continue;
                };
                match format!("{}{}", shard_name, rest).parse::<ObjectId>() {
                    Ok(id) => {
                        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
                        found.push((mtime, id, meta.len()));
                    }
                    Err(_) => debug!("Skipping foreign file {:?}", entry.path()),
                }
            }
        }

        found.sort_by_key(|(mtime, _, _)| *mtime);

        let mut ledger = self.ledger.lock();
        ledger.lru.clear();
        ledger.size = 0;
        ledger.pinned = 0;
        for (_, id, size) in &found {
            ledger.size += size;
            ledger.lru.insert(
                *id,
                Entry {
                    size: *size,
                    description: id.to_string(),
                    pinned: false,
                    is_catalog: false,
                    volatile: false,
                },
            );
        }

        info!(
            "Rebuilt quota ledger for {}: {} objects, {} bytes",
            self.cache_root.display(),
            found.len(),
            ledger.size
        );
        Ok(found.len())
    }

    fn insert_entry(&self, id: &ObjectId, size: u64, description: &str, volatile: bool) {
        let mut ledger = self.ledger.lock();

        let entry = match ledger.lru.peek(id).cloned() {
            Some(mut entry) => {
                ledger.size -= entry.size;
                if entry.pinned {
                    ledger.pinned = ledger.pinned - entry.size + size;
                }
                entry.size = size;
                entry.description = description.to_string();
                entry.volatile = volatile;
                entry
            }
            None => Entry {
                size,
                description: description.to_string(),
                pinned: false,
                is_catalog: false,
                volatile,
            },
        };
        ledger.size += size;
        ledger.lru.insert(*id, entry);
        self.stats.record_insert();

        if self.is_enforcing() && ledger.size > self.limit {
            debug!(
                "Cache over limit ({} > {}), cleaning up",
                ledger.size, self.limit
            );
            self.evict_until(&mut ledger, self.cleanup_threshold);
        }
    }

    fn evict_until(&self, ledger: &mut Ledger, leave_size: u64) -> bool {
        if ledger.size <= leave_size {
            return true;
        }

        let victims: Vec<ObjectId> = {
            let volatile = ledger
                .lru
                .iter_cold()
                .filter(|(_, entry)| !entry.pinned && entry.volatile);
            let regular = ledger
                .lru
                .iter_cold()
                .filter(|(_, entry)| !entry.pinned && !entry.volatile);
            volatile.chain(regular).map(|(id, _)| *id).collect()
        };

        for id in victims {
            if ledger.size <= leave_size {
                break;
            }
            if let Some(entry) = ledger.lru.remove(&id) {
                ledger.size -= entry.size;
                self.unlink(&id);
                self.stats.record_eviction(entry.size);
                debug!("Evicted {} ({})", id, entry.description);
            }
        }

        let reached = ledger.size <= leave_size;
        if !reached {
            warn!(
                "Cleanup stopped at {} bytes, {} requested ({} pinned)",
                ledger.size, leave_size, ledger.pinned
            );
        }
        reached
    }

    fn unlink(&self, id: &ObjectId) {
        let path = self.cache_root.join(id.make_path());
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

impl QuotaManager for LruQuotaManager {
    fn is_enforcing(&self) -> bool {
        self.limit > 0
    }

    fn insert(&self, id: &ObjectId, size: u64, description: &str) {
        self.insert_entry(id, size, description, false);
    }

    fn insert_volatile(&self, id: &ObjectId, size: u64, description: &str) {
        self.insert_entry(id, size, description, true);
    }

    fn pin(&self, id: &ObjectId, size: u64, description: &str, is_catalog: bool) -> bool {
        let mut ledger = self.ledger.lock();

        let existing = ledger.lru.peek(id).cloned();
        if existing.as_ref().map(|entry| entry.pinned).unwrap_or(false) {
            return true;
        }

        let pin_size = existing.as_ref().map(|entry| entry.size).unwrap_or(size);
        if self.is_enforcing() && ledger.pinned + pin_size > self.limit {
            warn!(
                "Cannot pin {} ({} bytes, {} already pinned)",
                description, pin_size, ledger.pinned
            );
            self.stats.record_pin(false);
            return false;
        }

        match ledger.lru.peek_mut(id) {
            Some(entry) => {
                entry.pinned = true;
                entry.is_catalog = is_catalog;
            }
            None => {
                ledger.lru.insert(
                    *id,
                    Entry {
                        size,
                        description: description.to_string(),
                        pinned: true,
                        is_catalog,
                        volatile: false,
                    },
                );
                ledger.size += size;
            }
        }
        ledger.pinned += pin_size;
        self.stats.record_pin(true);
        true
    }

    fn unpin(&self, id: &ObjectId) {
        let mut ledger = self.ledger.lock();
        let released = match ledger.lru.peek_mut(id) {
            Some(entry) if entry.pinned => {
                entry.pinned = false;
                entry.size
            }
            _ => return,
        };
        ledger.pinned -= released;
    }

    fn touch(&self, id: &ObjectId) {
        if self.ledger.lock().lru.touch(id) {
            self.stats.record_touch();
        }
    }

    fn remove(&self, id: &ObjectId) {
        let mut ledger = self.ledger.lock();
        if let Some(entry) = ledger.lru.remove(id) {
            ledger.size -= entry.size;
            if entry.pinned {
                ledger.pinned -= entry.size;
            }
        }
        self.unlink(id);
    }

    fn cleanup(&self, leave_size: u64) -> bool {
        let mut ledger = self.ledger.lock();
        self.evict_until(&mut ledger, leave_size)
    }

    fn capacity(&self) -> u64 {
        self.limit
    }

    fn size(&self) -> u64 {
        self.ledger.lock().size
    }

    fn size_pinned(&self) -> u64 {
        self.ledger.lock().pinned
    }

    fn list(&self) -> Vec<String> {
        self.ledger
            .lock()
            .lru
            .iter_cold()
            .map(|(_, entry)| entry.description.clone())
            .collect()
    }

    fn list_pinned(&self) -> Vec<String> {
        self.ledger
            .lock()
            .lru
            .iter_cold()
            .filter(|(_, entry)| entry.pinned)
            .map(|(_, entry)| entry.description.clone())
            .collect()
    }
}
