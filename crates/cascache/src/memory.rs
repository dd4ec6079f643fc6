//! In-memory cache manager
//!
//! Keeps every object on the heap. Handles index a descriptor table, so a
//! closed handle reports `BadDescriptor` just like a closed file descriptor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::manager::{CacheManager, Fd, TxnFlags};
use crate::quota::{NoopQuotaManager, QuotaManager};

/// Staged object of a [`MemoryCacheManager`]
#[derive(Debug)]
pub struct MemoryTxn {
    id: ObjectId,
    buf: Vec<u8>,
    description: String,
    flags: TxnFlags,
}

impl MemoryTxn {
    /// Target object id
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Bytes staged so far
    pub fn size(&self) -> u64 {
        self.buf.len() as u64
    }
}

/// Open objects indexed by handle, with slot reuse
#[derive(Default)]
struct HandleTable {
    slots: Vec<Option<Arc<[u8]>>>,
    free_list: Vec<usize>,
}

impl HandleTable {
    fn insert(&mut self, data: Arc<[u8]>) -> Fd {
        let idx = match self.free_list.pop() {
            Some(idx) => {
                self.slots[idx] = Some(data);
                idx
            }
            None => {
                self.slots.push(Some(data));
                self.slots.len() - 1
            }
        };
        idx as Fd
    }

    fn get(&self, fd: Fd) -> Result<Arc<[u8]>> {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.slots.get(idx))
            .and_then(|slot| slot.clone())
            .ok_or(Error::BadDescriptor)
    }

    fn remove(&mut self, fd: Fd) -> Result<()> {
        let idx = usize::try_from(fd).map_err(|_| Error::BadDescriptor)?;
        match self.slots.get_mut(idx) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free_list.push(idx);
                Ok(())
            }
            _ => Err(Error::BadDescriptor),
        }
    }

    fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Cache manager holding all objects in memory
pub struct MemoryCacheManager {
    objects: RwLock<HashMap<ObjectId, Arc<[u8]>>>,
    handles: Mutex<HandleTable>,
    quota: RwLock<Arc<dyn QuotaManager>>,
}

impl MemoryCacheManager {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            handles: Mutex::new(HandleTable::default()),
            quota: RwLock::new(Arc::new(NoopQuotaManager)),
        }
    }

    /// Whether an object is published
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Number of published objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether no object is published
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Number of handles currently open
    pub fn open_handles(&self) -> usize {
        self.handles.lock().open_count()
    }

    /// Drop a published object; open handles keep reading the old bytes.
    pub fn evict(&self, id: &ObjectId) -> bool {
        self.objects.write().remove(id).is_some()
    }
}

impl Default for MemoryCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager for MemoryCacheManager {
    type Txn = MemoryTxn;

    fn open(&self, id: &ObjectId) -> Result<Fd> {
        let data = self
            .objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let fd = self.handles.lock().insert(data);
        self.quota_manager().touch(id);
        Ok(fd)
    }

    fn get_size(&self, fd: Fd) -> Result<u64> {
        Ok(self.handles.lock().get(fd)?.len() as u64)
    }

    fn close(&self, fd: Fd) -> Result<()> {
        self.handles.lock().remove(fd)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.handles.lock().get(fd)?;
        let start = match usize::try_from(offset) {
            Ok(start) if start < data.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn start_txn(&self, id: &ObjectId) -> Result<MemoryTxn> {
        Ok(MemoryTxn {
            id: *id,
            buf: Vec::new(),
            description: String::new(),
            flags: TxnFlags::NONE,
        })
    }

    fn ctrl_txn(&self, txn: &mut MemoryTxn, description: &str, flags: TxnFlags) {
        txn.description = description.to_string();
        txn.flags = flags;
    }

    fn write(&self, txn: &mut MemoryTxn, buf: &[u8]) -> Result<usize> {
        txn.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn reset(&self, txn: &mut MemoryTxn) -> Result<()> {
        txn.buf.clear();
        Ok(())
    }

    fn abort_txn(&self, txn: MemoryTxn, dump_path: Option<&Path>) -> Result<()> {
        if let Some(dump) = dump_path {
            std::fs::write(dump, &txn.buf)?;
        }
        debug!("Aborted in-memory transaction for {}", txn.id);
        Ok(())
    }

    fn open_from_txn(&self, txn: &MemoryTxn) -> Result<Fd> {
        Ok(self.handles.lock().insert(Arc::from(txn.buf.as_slice())))
    }

    fn commit_txn(&self, txn: MemoryTxn) -> Result<()> {
        let size = txn.size();
        self.objects
            .write()
            .insert(txn.id, Arc::from(txn.buf.into_boxed_slice()));

        let quota = self.quota_manager();
        if txn.flags.contains(TxnFlags::VOLATILE) {
            quota.insert_volatile(&txn.id, size, &txn.description);
        } else {
            quota.insert(&txn.id, size, &txn.description);
        }
        Ok(())
    }

    fn quota_manager(&self) -> Arc<dyn QuotaManager> {
        self.quota.read().clone()
    }

    fn set_quota_manager(&self, quota: Arc<dyn QuotaManager>) {
        *self.quota.write() = quota;
    }
}
