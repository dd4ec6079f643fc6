//! Disk-backed cache manager
//!
//! Directory layout:
//! - `<root>/00` .. `<root>/ff`: one shard per first digest byte
//! - `<root>/<shard>/<rest-hex>`: published objects
//! - `<root>/txn/`: staged objects of in-flight transactions
//!
//! A transaction stages into its own temp file under `txn/` and publishes by
//! renaming that file onto the object path, so readers never observe a
//! partially written object.

use std::ffi::CString;
use std::fs::{self, DirBuilder, File, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::fd;
use crate::hash::ObjectId;
use crate::manager::{CacheManager, Fd, TxnFlags};
use crate::quota::{NoopQuotaManager, QuotaManager};

/// Name of the transaction directory below the cache root
pub const TXN_DIR: &str = "txn";

/// Prefix of staged files in the transaction directory
const TXN_PREFIX: &str = "fetch.";

/// Upper bound on a single drain wait before re-checking the counter
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Write mode of a disk cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheMode {
    /// Transactions are accepted
    ReadWrite = 0,
    /// New transactions are refused, in-flight ones still finish
    Draining = 1,
    /// No transactions
    ReadOnly = 2,
}

impl CacheMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CacheMode::ReadWrite,
            1 => CacheMode::Draining,
            _ => CacheMode::ReadOnly,
        }
    }
}

/// Cache mode and active transaction count shared with every transaction
struct Drain {
    mode: AtomicU8,
    active: AtomicUsize,
    lock: Mutex<()>,
    idle: Condvar,
}

impl Drain {
    fn new(mode: CacheMode) -> Self {
        Self {
            mode: AtomicU8::new(mode as u8),
            active: AtomicUsize::new(0),
            lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    fn mode(&self) -> CacheMode {
        CacheMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    // Counter increment and mode check are both SeqCst, so either this call
    // sees the drain request or the drain sees the increment.
    fn acquire(self: &Arc<Self>) -> Result<TxnSlot> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let slot = TxnSlot(Arc::clone(self));
        if self.mode() != CacheMode::ReadWrite {
            return Err(Error::ReadOnly);
        }
        Ok(slot)
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.lock.lock();
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut guard = self.lock.lock();
        while self.active.load(Ordering::SeqCst) != 0 {
            self.idle.wait_for(&mut guard, DRAIN_POLL_INTERVAL);
        }
    }
}

/// Occupies one active-transaction slot until dropped
struct TxnSlot(Arc<Drain>);

impl Drop for TxnSlot {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// In-flight write of one object
///
/// Owns the staged temp file and its descriptor. Dropping a transaction
/// without aborting or committing it discards the staged file.
pub struct Transaction {
    id: ObjectId,
    fd: RawFd,
    tmp_path: PathBuf,
    size: u64,
    description: String,
    flags: TxnFlags,
    _slot: TxnSlot,
}

impl Transaction {
    /// Target object id
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Descriptor of the staged file
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Path of the staged file
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Logical size written since start or the last reset
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Description reported to the quota manager
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Control flags
    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    fn take_fd(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, -1)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.fd < 0 {
            return;
        }
        warn!("Transaction for {} dropped unfinished, discarding", self.id);
        let _ = fd::close(self.take_fd());
        let _ = fs::remove_file(&self.tmp_path);
    }
}

/// Cache manager over a local directory tree
pub struct PosixCacheManager {
    root: PathBuf,
    txn_dir: PathBuf,
    alien_cache: bool,
    alien_cache_on_nfs: bool,
    file_mode: u32,
    drain: Arc<Drain>,
    quota: RwLock<Arc<dyn QuotaManager>>,
}

impl PosixCacheManager {
    /// Create the directory skeleton and open the cache.
    ///
    /// # Arguments
    /// * `config` - Cache root and permission profile
    ///
    /// # Returns
    /// * `Result<PosixCacheManager>` - Fails if the root is not a writable
    ///   directory or a shard name is taken by a non-directory
    pub fn create(config: CacheConfig) -> Result<Self> {
        let root = config.cache_root.clone();
        let (dir_mode, file_mode) = if config.alien_cache {
            (0o770, 0o660)
        } else {
            (0o700, 0o600)
        };

        match fs::metadata(&root) {
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::InvalidRoot(format!(
                    "{} is not a directory",
                    root.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(dir_mode)
                    .create(&root)
                    .map_err(|e| {
                        Error::InvalidRoot(format!("cannot create {}: {}", root.display(), e))
                    })?;
            }
            Err(e) => return Err(Error::from_io(e)),
        }

        if !config.read_only && !is_writable(&root) {
            return Err(Error::InvalidRoot(format!(
                "{} is not writable",
                root.display()
            )));
        }

        for shard in 0..=u8::MAX {
            make_cache_dir(&root.join(format!("{:02x}", shard)), dir_mode)?;
        }
        let txn_dir = root.join(TXN_DIR);
        make_cache_dir(&txn_dir, dir_mode)?;

        // A shared root may hold other processes' live transactions.
        if !config.alien_cache && !config.read_only {
            purge_txn_dir(&txn_dir)?;
        }

        let mode = if config.read_only {
            CacheMode::ReadOnly
        } else {
            CacheMode::ReadWrite
        };

        info!(
            "Cache at {} opened ({}, {:?})",
            root.display(),
            if config.alien_cache { "alien" } else { "exclusive" },
            mode
        );

        Ok(Self {
            root,
            txn_dir,
            alien_cache: config.alien_cache,
            alien_cache_on_nfs: config.effective_nfs(),
            file_mode,
            drain: Arc::new(Drain::new(mode)),
            quota: RwLock::new(Arc::new(NoopQuotaManager)),
        })
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Transaction directory
    pub fn txn_dir(&self) -> &Path {
        &self.txn_dir
    }

    /// Whether the root is shared with other processes
    pub fn is_alien(&self) -> bool {
        self.alien_cache
    }

    /// Whether publishing uses link/unlink instead of rename
    pub fn alien_cache_on_nfs(&self) -> bool {
        self.alien_cache_on_nfs
    }

    /// Current write mode
    pub fn cache_mode(&self) -> CacheMode {
        self.drain.mode()
    }

    /// Number of transactions started but not yet finished
    pub fn active_txns(&self) -> usize {
        self.drain.active.load(Ordering::SeqCst)
    }

    /// Absolute path of a published object
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.make_path())
    }

    /// Move a file within the cache tree.
    ///
    /// On network filesystems the move is a link followed by an unlink. An
    /// existing target is replaced like `rename(2)` would, and a same-path
    /// move is skipped once the source is known to exist.
    pub fn rename(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        if !self.alien_cache_on_nfs {
            return fs::rename(old_path, new_path).map_err(Error::from_io);
        }

        if old_path == new_path {
            fs::symlink_metadata(old_path)?;
            debug!("Skipping same-path rename of {}", old_path.display());
            return Ok(());
        }

        loop {
            match fs::hard_link(old_path, new_path) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Replacing {}", new_path.display());
                    match fs::remove_file(new_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(Error::from_io(e)),
                    }
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
        fs::remove_file(old_path)?;
        Ok(())
    }

    /// Refuse new transactions, wait for in-flight ones, switch to read-only.
    ///
    /// Blocks without timeout. Returns immediately if no transaction is active.
    pub fn tear_down_to_read_only(&self) {
        let requested = self.drain.mode.compare_exchange(
            CacheMode::ReadWrite as u8,
            CacheMode::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if requested.is_ok() {
            info!(
                "Draining cache at {} ({} active transactions)",
                self.root.display(),
                self.active_txns()
            );
        }

        self.drain.wait_idle();
        self.drain
            .mode
            .store(CacheMode::ReadOnly as u8, Ordering::SeqCst);
        info!("Cache at {} is read-only", self.root.display());
    }
}

impl CacheManager for PosixCacheManager {
    type Txn = Transaction;

    fn open(&self, id: &ObjectId) -> Result<Fd> {
        let file = File::open(self.object_path(id)).map_err(Error::from_io)?;
        self.quota_manager().touch(id);
        Ok(file.into_raw_fd())
    }

    fn get_size(&self, fd: Fd) -> Result<u64> {
        fd::size(fd)
    }

    fn close(&self, fd: Fd) -> Result<()> {
        fd::close(fd)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        fd::pread(fd, buf, offset)
    }

    fn start_txn(&self, id: &ObjectId) -> Result<Transaction> {
        let slot = self.drain.acquire()?;

        let staged = tempfile::Builder::new()
            .prefix(TXN_PREFIX)
            .tempfile_in(&self.txn_dir)?;
        let (file, tmp_path) = staged.keep().map_err(|e| Error::from_io(e.error))?;
        if let Err(e) = file.set_permissions(Permissions::from_mode(self.file_mode)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::from_io(e));
        }

        Ok(Transaction {
            id: *id,
            fd: file.into_raw_fd(),
            tmp_path,
            size: 0,
            description: String::new(),
            flags: TxnFlags::NONE,
            _slot: slot,
        })
    }

    fn ctrl_txn(&self, txn: &mut Transaction, description: &str, flags: TxnFlags) {
        txn.description = description.to_string();
        txn.flags = flags;
    }

    fn write(&self, txn: &mut Transaction, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let written = fd::write_all(txn.fd, buf)?;
        txn.size += written as u64;
        Ok(written)
    }

    fn reset(&self, txn: &mut Transaction) -> Result<()> {
        fd::truncate(txn.fd)?;
        txn.size = 0;
        Ok(())
    }

    fn abort_txn(&self, mut txn: Transaction, dump_path: Option<&Path>) -> Result<()> {
        let _ = fd::close(txn.take_fd());

        let dumped = match dump_path {
            Some(dump) => dump_staged(&txn.tmp_path, dump),
            None => Ok(()),
        };
        let removed = fs::remove_file(&txn.tmp_path).map_err(Error::from_io);

        if let Some(e) = dumped.as_ref().err().or(removed.as_ref().err()) {
            warn!("Aborting transaction for {} failed: {}", txn.id, e);
        } else {
            debug!("Aborted transaction for {}", txn.id);
        }
        drop(txn);
        dumped.and(removed)
    }

    fn open_from_txn(&self, txn: &Transaction) -> Result<Fd> {
        fd::size(txn.fd)?;
        let file = File::open(&txn.tmp_path).map_err(Error::from_io)?;
        Ok(file.into_raw_fd())
    }

    fn commit_txn(&self, mut txn: Transaction) -> Result<()> {
        let fd = txn.take_fd();
        let synced = fd::sync(fd);
        let closed = fd::close(fd);
        if let Err(e) = synced.and(closed) {
            warn!("Flushing transaction for {} failed: {}", txn.id, e);
            let _ = fs::remove_file(&txn.tmp_path);
            return Err(e);
        }

        let final_path = self.object_path(&txn.id);
        if let Err(e) = self.rename(&txn.tmp_path, &final_path) {
            warn!("Publishing {} failed: {}", txn.id, e);
            let _ = fs::remove_file(&txn.tmp_path);
            return Err(e);
        }

        let quota = self.quota_manager();
        if txn.flags.contains(TxnFlags::VOLATILE) {
            quota.insert_volatile(&txn.id, txn.size, &txn.description);
        } else {
            quota.insert(&txn.id, txn.size, &txn.description);
        }
        debug!("Committed {} ({} bytes)", txn.id, txn.size);
        Ok(())
    }

    fn quota_manager(&self) -> Arc<dyn QuotaManager> {
        self.quota.read().clone()
    }

    fn set_quota_manager(&self, quota: Arc<dyn QuotaManager>) {
        *self.quota.write() = quota;
    }
}

fn is_writable(path: &Path) -> bool {
    match CString::new(path.as_os_str().as_bytes()) {
        Ok(c_path) => unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 },
        Err(_) => false,
    }
}

fn make_cache_dir(path: &Path, mode: u32) -> Result<()> {
    match DirBuilder::new().mode(mode).create(path) {
        Ok(()) => {
            fs::set_permissions(path, Permissions::from_mode(mode))?;
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if fs::metadata(path)?.is_dir() {
                Ok(())
            } else {
                Err(Error::InvalidRoot(format!(
                    "stray file {} occupies a cache directory name",
                    path.display()
                )))
            }
        }
        Err(e) => Err(Error::InvalidRoot(format!(
            "cannot create {}: {}",
            path.display(),
            e
        ))),
    }
}

fn purge_txn_dir(txn_dir: &Path) -> Result<()> {
    let mut purged = 0;
    for entry in fs::read_dir(txn_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            purged += 1;
        }
    }
    if purged > 0 {
        info!("Removed {} stale staged files from {}", purged, txn_dir.display());
    }
    Ok(())
}

fn dump_staged(tmp_path: &Path, dump_path: &Path) -> Result<()> {
    fs::copy(tmp_path, dump_path)?;
    File::open(dump_path)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use crate::quota::testing::{Command, RecordingQuotaManager};
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn id(first: u8, last: u8) -> ObjectId {
        let mut digest = [0u8; 20];
        digest[0] = first;
        digest[19] = last;
        ObjectId::new(Algorithm::Sha1, &digest).unwrap()
    }

    fn one() -> ObjectId {
        id(1, 0)
    }

    struct Fixture {
        dir: TempDir,
        cache: PosixCacheManager,
        alien: PosixCacheManager,
    }

    impl Fixture {
        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn object(&self, id: &ObjectId) -> PathBuf {
            self.root().join(id.make_path())
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if std::thread::panicking() {
                return;
            }
            let txn_dir = self.root().join(TXN_DIR);
            let leftovers = fs::read_dir(&txn_dir).unwrap().count();
            assert_eq!(leftovers, 0, "transaction directory not empty");
        }
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = PosixCacheManager::create(CacheConfig::new(dir.path())).unwrap();
        let alien = PosixCacheManager::create(CacheConfig::new(dir.path()).alien(true)).unwrap();

        cache.commit_from_mem(&ObjectId::null(), &[], "null").unwrap();
        cache.commit_from_mem(&one(), b"A", "one").unwrap();

        Fixture { dir, cache, alien }
    }

    fn recording(cache: &PosixCacheManager) -> Arc<RecordingQuotaManager> {
        let quota = Arc::new(RecordingQuotaManager::default());
        cache.set_quota_manager(quota.clone());
        quota
    }

    fn mode_bits(path: &Path) -> u32 {
        fs::metadata(path).unwrap().mode() & 0o777
    }

    #[test]
    fn test_commit_from_mem() {
        let fx = fixture();
        let rnd = id(0xab, 7);

        fx.cache.commit_from_mem(&rnd, b"1", "1").unwrap();
        assert_eq!(fx.cache.open_to_mem(&rnd).unwrap(), b"1");

        fs::remove_file(fx.object(&ObjectId::null())).unwrap();
        fs::remove_file(fx.object(&one())).unwrap();
        fs::remove_file(fx.object(&rnd)).unwrap();
        fs::remove_dir(fx.root().join("ab")).unwrap();
        assert!(fx.cache.commit_from_mem(&rnd, b"1", "1").is_err());
    }

    #[test]
    fn test_open_to_mem() {
        let fx = fixture();

        let missing = fx.cache.open_to_mem(&ObjectId::zero(Algorithm::Md5));
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let null = fx.cache.open_to_mem(&ObjectId::null()).unwrap();
        assert!(null.is_empty());
        assert_eq!(null.capacity(), 0);

        assert_eq!(fx.cache.open_to_mem(&one()).unwrap(), b"A");
    }

    #[test]
    fn test_open_to_mem_null_skips_storage() {
        let fx = fixture();
        fs::remove_file(fx.object(&ObjectId::null())).unwrap();
        let quota = recording(&fx.cache);

        assert!(fx.cache.open_to_mem(&ObjectId::null()).unwrap().is_empty());
        assert_eq!(quota.last().cmd, Command::Unknown);
    }

    #[test]
    fn test_abort_txn() {
        let fx = fixture();

        let txn = fx.cache.start_txn(&ObjectId::null()).unwrap();
        fx.cache.abort_txn(txn, None).unwrap();

        let txn = fx.cache.start_txn(&one()).unwrap();
        let txn_dir = fx.root().join(TXN_DIR);
        fs::remove_dir_all(&txn_dir).unwrap();
        fs::create_dir(&txn_dir).unwrap();
        assert!(matches!(
            fx.cache.abort_txn(txn, None),
            Err(Error::NotFound(_))
        ));

        let dump_path = fx.root().join("dump");
        let payload = dump_path.to_string_lossy().into_owned();
        let mut txn = fx.cache.start_txn(&ObjectId::null()).unwrap();
        assert_eq!(
            fx.cache.write(&mut txn, payload.as_bytes()).unwrap(),
            payload.len()
        );
        fx.cache.abort_txn(txn, Some(&dump_path)).unwrap();
        assert_eq!(fs::read(&dump_path).unwrap(), payload.as_bytes());
        assert_eq!(fx.cache.active_txns(), 0);
    }

    #[test]
    fn test_abort_leaves_final_path_alone() {
        let fx = fixture();
        let rnd = id(0xab, 1);

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.write(&mut txn, b"discard me").unwrap();
        fx.cache.abort_txn(txn, None).unwrap();

        assert!(matches!(fx.cache.open(&rnd), Err(Error::NotFound(_))));
        assert!(!fx.object(&rnd).exists());
    }

    #[test]
    fn test_commit_txn() {
        let fx = fixture();
        let rnd = id(0xab, 2);

        assert!(matches!(fx.cache.open(&rnd), Err(Error::NotFound(_))));

        let txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.commit_txn(txn).unwrap();
        let fd = fx.cache.open(&rnd).unwrap();
        assert_eq!(fx.cache.get_size(fd).unwrap(), 0);
        fx.cache.close(fd).unwrap();

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        assert_eq!(fx.cache.write(&mut txn, b"A").unwrap(), 1);
        fx.cache.commit_txn(txn).unwrap();
        let fd = fx.cache.open(&rnd).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fx.cache.get_size(fd).unwrap(), 1);
        assert_eq!(fx.cache.pread(fd, &mut buf, 0).unwrap(), 1);
        assert_eq!(&buf, b"A");
        fx.cache.close(fd).unwrap();
    }

    #[test]
    fn test_commit_file_modes() {
        let fx = fixture();
        let rnd = id(0xab, 3);

        let txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.commit_txn(txn).unwrap();
        assert_eq!(mode_bits(&fx.object(&rnd)), 0o600);

        let txn = fx.alien.start_txn(&rnd).unwrap();
        fx.alien.commit_txn(txn).unwrap();
        assert_eq!(mode_bits(&fx.object(&rnd)), 0o660);
    }

    #[test]
    fn test_commit_quota_notifications() {
        let fx = fixture();
        let rnd = id(0xab, 4);
        let quota = recording(&fx.cache);

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.write(&mut txn, b"A").unwrap();
        fx.cache.commit_txn(txn).unwrap();
        let last = quota.last();
        assert_eq!(last.cmd, Command::Insert);
        assert_eq!(last.id, rnd);
        assert_eq!(last.size, 1);

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.ctrl_txn(&mut txn, "desc", TxnFlags::VOLATILE);
        fx.cache.write(&mut txn, b"A").unwrap();
        fx.cache.commit_txn(txn).unwrap();
        let last = quota.last();
        assert_eq!(last.cmd, Command::InsertVolatile);
        assert_eq!(last.id, rnd);
        assert_eq!(last.size, 1);
        assert_eq!(last.description, "desc");
    }

    #[test]
    fn test_commit_twice_last_wins() {
        let fx = fixture();
        let rnd = id(0xab, 5);

        fx.cache.commit_from_mem(&rnd, b"first", "v1").unwrap();
        fx.cache.commit_from_mem(&rnd, b"second", "v2").unwrap();
        assert_eq!(fx.cache.open_to_mem(&rnd).unwrap(), b"second");
    }

    #[test]
    fn test_commit_rename_fail() {
        let fx = fixture();
        let rnd = id(0xab, 6);
        let quota = recording(&fx.cache);

        let txn = fx.cache.start_txn(&rnd).unwrap();
        fs::remove_dir(fx.root().join("ab")).unwrap();
        assert!(matches!(
            fx.cache.commit_txn(txn),
            Err(Error::NotFound(_))
        ));
        assert_eq!(fx.cache.active_txns(), 0);
        assert_eq!(quota.last().cmd, Command::Unknown);
    }

    #[test]
    fn test_create() {
        let fx = fixture();

        assert!(PosixCacheManager::create(CacheConfig::new("/dev/null")).is_err());
        assert!(PosixCacheManager::create(CacheConfig::new("/dev/null").alien(true)).is_err());

        let path = fx.root().join("test");
        let cache = PosixCacheManager::create(CacheConfig::new(&path)).unwrap();
        assert!(path.join("ff").is_dir());
        assert_eq!(mode_bits(&path.join("ff")), 0o700);
        assert_eq!(cache.cache_mode(), CacheMode::ReadWrite);
        drop(cache);

        let path2 = fx.root().join("test2");
        let alien = PosixCacheManager::create(CacheConfig::new(&path2).alien(true)).unwrap();
        assert!(alien.is_alien());
        assert_eq!(mode_bits(&path2.join("ff")), 0o770);
        assert_eq!(mode_bits(&path2.join(TXN_DIR)), 0o770);
    }

    #[test]
    fn test_create_stray_file() {
        let fx = fixture();
        let path = fx.root().join("stray");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("7f"), b"not a shard").unwrap();

        assert!(matches!(
            PosixCacheManager::create(CacheConfig::new(&path)),
            Err(Error::InvalidRoot(_))
        ));
    }

    #[test]
    fn test_create_purges_stale_staged_files() {
        let fx = fixture();
        let stale = fx.root().join(TXN_DIR).join("fetch.crashed");
        fs::write(&stale, b"partial").unwrap();

        let _again = PosixCacheManager::create(CacheConfig::new(fx.root())).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_create_read_only() {
        let fx = fixture();
        let ro = PosixCacheManager::create(CacheConfig::new(fx.root()).read_only(true)).unwrap();
        assert_eq!(ro.cache_mode(), CacheMode::ReadOnly);
        assert!(matches!(ro.start_txn(&one()), Err(Error::ReadOnly)));
        assert_eq!(ro.active_txns(), 0);
        assert_eq!(ro.open_to_mem(&one()).unwrap(), b"A");
    }

    #[test]
    fn test_get_size() {
        let fx = fixture();

        let fd = fx.cache.open(&ObjectId::null()).unwrap();
        assert_eq!(fx.cache.get_size(fd).unwrap(), 0);
        fx.cache.close(fd).unwrap();

        let fd = fx.cache.open(&one()).unwrap();
        assert_eq!(fx.cache.get_size(fd).unwrap(), 1);
        fx.cache.close(fd).unwrap();
    }

    #[test]
    fn test_open_touches() {
        let fx = fixture();
        let quota = recording(&fx.cache);

        assert!(matches!(fx.cache.open(&id(0xab, 9)), Err(Error::NotFound(_))));
        assert_eq!(quota.last().cmd, Command::Unknown);

        let fd = fx.cache.open(&ObjectId::null()).unwrap();
        fx.cache.close(fd).unwrap();
        let last = quota.last();
        assert_eq!(last.cmd, Command::Touch);
        assert_eq!(last.id, ObjectId::null());
    }

    #[test]
    fn test_open_from_txn() {
        let fx = fixture();
        let rnd = id(0xab, 10);

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.write(&mut txn, b"A").unwrap();

        let fd = fx.cache.open_from_txn(&txn).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fx.cache.get_size(fd).unwrap(), 1);
        assert_eq!(fx.cache.pread(fd, &mut buf, 0).unwrap(), 1);
        assert_eq!(&buf, b"A");
        fx.cache.close(fd).unwrap();

        fs::remove_file(txn.tmp_path()).unwrap();
        assert!(matches!(
            fx.cache.open_from_txn(&txn),
            Err(Error::NotFound(_))
        ));
        assert!(fx.cache.abort_txn(txn, None).is_err());
    }

    #[test]
    fn test_pread() {
        let fx = fixture();
        let mut buf = [0u8; 1024];

        let fd = fx.cache.open(&one()).unwrap();
        assert_eq!(fx.cache.pread(fd, &mut buf, 0).unwrap(), 1);
        assert_eq!(buf[0], b'A');
        assert_eq!(fx.cache.pread(fd, &mut buf, 1024).unwrap(), 0);
        assert_eq!(fx.cache.pread(fd, &mut buf[..0], 0).unwrap(), 0);
        assert_eq!(fx.cache.pread(fd, &mut [], 0).unwrap(), 0);
        assert_eq!(fx.cache.pread(fd, &mut buf[..4], u64::MAX).unwrap(), 0);
        assert_eq!(fx.cache.pread(fd, &mut [], 1 << 63).unwrap(), 0);
        fx.cache.close(fd).unwrap();
    }

    #[test]
    fn test_pread_empty_null_object() {
        let fx = fixture();
        let mut buf = [0u8; 64];

        let fd = fx.cache.open(&ObjectId::null()).unwrap();
        assert_eq!(fx.cache.pread(fd, &mut buf, 0).unwrap(), 0);
        assert_eq!(fx.cache.pread(fd, &mut buf, 4096).unwrap(), 0);
        fx.cache.close(fd).unwrap();
    }

    #[test]
    fn test_rename() {
        let fx = fixture();
        let path_null = fx.object(&ObjectId::null());
        let path_one = fx.object(&one());

        fx.cache.rename(&path_null, &path_one).unwrap();
        assert!(!path_null.exists());
        assert!(path_one.exists());
        fx.cache.rename(&path_one, &path_one).unwrap();
        assert!(path_one.exists());
        assert!(matches!(
            fx.cache.rename(&path_null, &path_one),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_on_nfs() {
        let fx = fixture();
        let nfs =
            PosixCacheManager::create(CacheConfig::new(fx.root()).alien(true).on_nfs(true)).unwrap();
        assert!(nfs.alien_cache_on_nfs());

        let path_null = fx.object(&ObjectId::null());
        let path_one = fx.object(&one());

        nfs.rename(&path_null, &path_one).unwrap();
        assert!(!path_null.exists());
        assert!(path_one.exists());

        nfs.rename(&path_one, &path_one).unwrap();
        assert!(path_one.exists());

        nfs.rename(&path_one, &path_null).unwrap();
        assert!(path_null.exists());
        assert!(!path_one.exists());

        assert!(matches!(
            nfs.rename(&path_one, &path_null),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            nfs.rename(&path_one, &path_one),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_commit_twice_on_nfs() {
        let fx = fixture();
        let nfs =
            PosixCacheManager::create(CacheConfig::new(fx.root()).alien(true).on_nfs(true)).unwrap();
        let rnd = id(0xcd, 7);

        nfs.commit_from_mem(&rnd, b"first", "").unwrap();
        nfs.commit_from_mem(&rnd, b"second", "").unwrap();
        assert_eq!(nfs.open_to_mem(&rnd).unwrap(), b"second");

        let mut txn = nfs.start_txn(&rnd).unwrap();
        nfs.write(&mut txn, b"third").unwrap();
        nfs.commit_txn(txn).unwrap();
        assert_eq!(nfs.open_to_mem(&rnd).unwrap(), b"third");
    }

    #[test]
    fn test_reset() {
        let fx = fixture();
        let rnd = id(0xab, 11);
        let mut large = vec![0u8; 5000];
        large[0] = b'A';

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        assert_eq!(fx.cache.write(&mut txn, &large).unwrap(), 5000);
        fx.cache.reset(&mut txn).unwrap();
        assert_eq!(txn.size(), 0);
        assert_eq!(fx.cache.write(&mut txn, &large[..1]).unwrap(), 1);
        fx.cache.commit_txn(txn).unwrap();
        assert_eq!(fx.cache.open_to_mem(&rnd).unwrap(), b"A");

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.reset(&mut txn).unwrap();
        fx.cache.commit_txn(txn).unwrap();
        let fd = fx.cache.open(&rnd).unwrap();
        assert_eq!(fx.cache.get_size(fd).unwrap(), 0);
        fx.cache.close(fd).unwrap();
    }

    #[test]
    fn test_reset_discards_first_write() {
        let fx = fixture();
        let rnd = id(0xab, 12);

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.write(&mut txn, b"first payload").unwrap();
        fx.cache.reset(&mut txn).unwrap();
        fx.cache.write(&mut txn, b"b2").unwrap();
        fx.cache.commit_txn(txn).unwrap();
        assert_eq!(fx.cache.open_to_mem(&rnd).unwrap(), b"b2");
    }

    #[test]
    fn test_start_txn() {
        let fx = fixture();
        let rnd = id(0xab, 13);

        let txn = fx.cache.start_txn(&rnd).unwrap();
        assert_eq!(fx.cache.get_size(txn.fd()).unwrap(), 0);
        assert_eq!(fx.cache.active_txns(), 1);
        assert!(txn.tmp_path().starts_with(fx.root().join(TXN_DIR)));
        fx.cache.abort_txn(txn, None).unwrap();
        assert_eq!(fx.cache.active_txns(), 0);

        let txn_dir = fx.root().join(TXN_DIR);
        fs::remove_dir(&txn_dir).unwrap();
        assert!(matches!(fx.cache.start_txn(&rnd), Err(Error::NotFound(_))));
        assert_eq!(fx.cache.active_txns(), 0);
        fs::create_dir(&txn_dir).unwrap();
    }

    #[test]
    fn test_dropped_txn_is_discarded() {
        let fx = fixture();
        let rnd = id(0xab, 14);

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        fx.cache.write(&mut txn, b"lost").unwrap();
        let tmp_path = txn.tmp_path().to_path_buf();
        drop(txn);

        assert!(!tmp_path.exists());
        assert_eq!(fx.cache.active_txns(), 0);
        assert!(!fx.object(&rnd).exists());
    }

    #[test]
    fn test_write() {
        let fx = fixture();
        let rnd = id(0xab, 15);
        let large = vec![7u8; 10000];
        let page = vec![3u8; 4096];

        let mut txn = fx.cache.start_txn(&rnd).unwrap();
        assert_eq!(fx.cache.write(&mut txn, &page).unwrap(), 4096);
        assert_eq!(fx.cache.write(&mut txn, &large).unwrap(), 10000);
        assert_eq!(fx.cache.write(&mut txn, &large[..0]).unwrap(), 0);
        assert_eq!(fx.cache.write(&mut txn, &[]).unwrap(), 0);
        fx.cache.commit_txn(txn).unwrap();

        let fd = fx.cache.open(&rnd).unwrap();
        assert_eq!(fx.cache.get_size(fd).unwrap(), 14096);
        fx.cache.close(fd).unwrap();
    }

    #[test]
    fn test_tear_down_without_txns() {
        let fx = fixture();

        fx.cache.tear_down_to_read_only();
        assert_eq!(fx.cache.cache_mode(), CacheMode::ReadOnly);
        assert!(matches!(
            fx.cache.start_txn(&ObjectId::null()),
            Err(Error::ReadOnly)
        ));

        // Second request is a no-op
        fx.cache.tear_down_to_read_only();
        assert_eq!(fx.cache.cache_mode(), CacheMode::ReadOnly);
        assert_eq!(fx.cache.open_to_mem(&one()).unwrap(), b"A");
    }
}
