//! Cache manager contract shared by all backends

use std::io;
use std::ops::BitOr;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::quota::QuotaManager;

/// Handle to an open cache object; meaning is backend-specific
pub type Fd = i32;

/// Control flags attached to a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnFlags(u32);

impl TxnFlags {
    /// No flags
    pub const NONE: TxnFlags = TxnFlags(0);
    /// Publish with `insert_volatile` so the object is evicted early
    pub const VOLATILE: TxnFlags = TxnFlags(1);

    /// Whether all bits of `other` are set
    pub fn contains(self, other: TxnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TxnFlags {
    type Output = TxnFlags;

    fn bitor(self, rhs: TxnFlags) -> TxnFlags {
        TxnFlags(self.0 | rhs.0)
    }
}

/// Storage backend for immutable content-addressed objects.
///
/// Writers stage an object in a transaction and publish it atomically with
/// `commit_txn`; readers open published objects by id. Implementations are
/// shared between threads and must be safe to call concurrently.
pub trait CacheManager: Send + Sync {
    /// In-flight write owned by the caller until aborted or committed
    type Txn: Send;

    /// Open a published object for reading and record the access.
    fn open(&self, id: &ObjectId) -> Result<Fd>;

    /// Size in bytes of the object behind `fd`.
    fn get_size(&self, fd: Fd) -> Result<u64>;

    /// Release a handle returned by `open` or `open_from_txn`.
    fn close(&self, fd: Fd) -> Result<()>;

    /// Read into `buf` starting at `offset`; 0 at end of object.
    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Begin staging the object `id`.
    fn start_txn(&self, id: &ObjectId) -> Result<Self::Txn>;

    /// Attach the description and flags reported to the quota manager.
    fn ctrl_txn(&self, txn: &mut Self::Txn, description: &str, flags: TxnFlags);

    /// Append to the staged object; empty writes return 0.
    fn write(&self, txn: &mut Self::Txn, buf: &[u8]) -> Result<usize>;

    /// Discard everything written so far.
    fn reset(&self, txn: &mut Self::Txn) -> Result<()>;

    /// Drop the staged object, optionally keeping a copy at `dump_path`.
    fn abort_txn(&self, txn: Self::Txn, dump_path: Option<&Path>) -> Result<()>;

    /// Independent read handle onto the staged, unpublished object.
    fn open_from_txn(&self, txn: &Self::Txn) -> Result<Fd>;

    /// Publish the staged object under its id.
    fn commit_txn(&self, txn: Self::Txn) -> Result<()>;

    /// Quota manager notified by this cache
    fn quota_manager(&self) -> Arc<dyn QuotaManager>;

    /// Replace the quota manager
    fn set_quota_manager(&self, quota: Arc<dyn QuotaManager>);

    /// Stage, write and publish a complete buffer.
    ///
    /// # Arguments
    /// * `id` - Object id
    /// * `buf` - Complete object content
    /// * `description` - Human-readable name for the quota manager
    fn commit_from_mem(&self, id: &ObjectId, buf: &[u8], description: &str) -> Result<()> {
        let mut txn = self.start_txn(id)?;
        self.ctrl_txn(&mut txn, description, TxnFlags::NONE);

        let written = match self.write(&mut txn, buf) {
            Ok(n) => n,
            Err(e) => {
                let _ = self.abort_txn(txn, None);
                return Err(e);
            }
        };
        if written != buf.len() {
            let _ = self.abort_txn(txn, None);
            return Err(Error::Io(io::Error::from(io::ErrorKind::WriteZero)));
        }

        self.commit_txn(txn)
    }

    /// Read a complete object into memory.
    ///
    /// The null id always yields an empty buffer without touching storage.
    fn open_to_mem(&self, id: &ObjectId) -> Result<Vec<u8>> {
        if id.is_null() {
            return Ok(Vec::new());
        }

        let fd = self.open(id)?;
        let result = read_whole(self, fd);
        let closed = self.close(fd);
        let buf = result?;
        closed?;
        Ok(buf)
    }
}

fn read_whole<C: CacheManager + ?Sized>(cache: &C, fd: Fd) -> Result<Vec<u8>> {
    let size = cache.get_size(fd)? as usize;
    let mut buf = vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = cache.pread(fd, &mut buf[done..], done as u64)?;
        if n == 0 {
            return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        done += n;
    }
    Ok(buf)
}
