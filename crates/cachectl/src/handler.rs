//! Subcommand implementations over an opened cache

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cascache::{
    CacheConfig, CacheManager, CacheMode, ObjectId, PosixCacheManager, QuotaManager, TxnFlags,
    TXN_DIR,
};
use casquota::LruQuotaManager;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of a `check` run
#[derive(Debug, Default)]
pub struct CheckReport {
    pub missing_shards: Vec<String>,
    pub missing_txn_dir: bool,
    pub stale_txns: Vec<PathBuf>,
    pub objects: usize,
    pub bytes: u64,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.missing_shards.is_empty() && !self.missing_txn_dir && self.stale_txns.is_empty()
    }
}

pub struct CommandHandler {
    cache: PosixCacheManager,
    quota: Arc<LruQuotaManager>,
}

impl CommandHandler {
    /// Open (creating if needed) the cache and load its quota ledger.
    ///
    /// The ledger shrinks to half the limit once the limit is exceeded.
    pub fn open(config: CacheConfig, limit: u64) -> Result<Self> {
        let root = config.cache_root.clone();
        let cache = PosixCacheManager::create(config)
            .with_context(|| format!("failed to open cache at {}", root.display()))?;

        let quota = Arc::new(LruQuotaManager::new(&root, limit, limit / 2));
        let objects = quota
            .rebuild()
            .with_context(|| format!("failed to scan {}", root.display()))?;
        debug!("Loaded {} objects into the quota ledger", objects);
        cache.set_quota_manager(quota.clone());

        Ok(Self { cache, quota })
    }

    pub fn cache(&self) -> &PosixCacheManager {
        &self.cache
    }

    pub fn quota(&self) -> &LruQuotaManager {
        &self.quota
    }

    /// Store `file` (or stdin for `-`) under `id`; returns the object size
    pub fn put(
        &self,
        id: &str,
        file: &Path,
        description: Option<&str>,
        volatile: bool,
    ) -> Result<u64> {
        let id = parse_id(id)?;
        let mut input: Box<dyn Read> = if file == Path::new("-") {
            Box::new(io::stdin())
        } else {
            Box::new(File::open(file).with_context(|| format!("cannot read {}", file.display()))?)
        };

        let mut txn = self.cache.start_txn(&id)?;
        let flags = if volatile { TxnFlags::VOLATILE } else { TxnFlags::NONE };
        let description = description.map(str::to_string).unwrap_or_else(|| id.to_string());
        self.cache.ctrl_txn(&mut txn, &description, flags);

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = self.cache.abort_txn(txn, None);
                    return Err(e).context("reading input failed");
                }
            };
            if let Err(e) = self.cache.write(&mut txn, &buf[..n]) {
                let _ = self.cache.abort_txn(txn, None);
                return Err(e).context("staging object failed");
            }
        }

        let size = txn.size();
        self.cache
            .commit_txn(txn)
            .with_context(|| format!("committing {} failed", id))?;
        info!("Stored {} ({} bytes)", id, size);
        Ok(size)
    }

    /// Copy object `id` into `out`; returns the number of bytes
    pub fn get(&self, id: &str, out: &mut dyn Write) -> Result<usize> {
        let id = parse_id(id)?;
        let data = self
            .cache
            .open_to_mem(&id)
            .with_context(|| format!("cannot load {}", id))?;
        out.write_all(&data)?;
        out.flush()?;
        Ok(data.len())
    }

    /// Size and location of object `id`
    pub fn stat(&self, id: &str) -> Result<(u64, PathBuf)> {
        let id = parse_id(id)?;
        let fd = self
            .cache
            .open(&id)
            .with_context(|| format!("cannot open {}", id))?;
        let size = self.cache.get_size(fd);
        self.cache.close(fd)?;
        Ok((size?, self.cache.object_path(&id)))
    }

    /// Evict until `leave_size` bytes remain; false if pins prevent it
    pub fn cleanup(&self, leave_size: u64) -> bool {
        let before = self.quota.size();
        let reached = self.quota.cleanup(leave_size);
        info!(
            "Cleanup freed {} bytes, {} remain",
            before - self.quota.size(),
            self.quota.size()
        );
        reached
    }

    /// Switch this process's cache manager to read-only once its own
    /// transactions finished
    pub fn drain(&self) -> CacheMode {
        self.cache.tear_down_to_read_only();
        self.cache.cache_mode()
    }
}

/// Inspect a cache root without modifying it.
///
/// Looks for all 256 shard directories and for leftover files in the
/// transaction directory, then tallies the objects on disk.
pub fn check(root: &Path) -> Result<CheckReport> {
    if !root.is_dir() {
        bail!("{} is not a cache directory", root.display());
    }

    let mut report = CheckReport::default();
    for shard in 0..=u8::MAX {
        let name = format!("{:02x}", shard);
        if !root.join(&name).is_dir() {
            report.missing_shards.push(name);
        }
    }

    let txn_dir = root.join(TXN_DIR);
    match fs::read_dir(&txn_dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    report.stale_txns.push(entry.path());
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            report.missing_txn_dir = true;
        }
        Err(e) => return Err(e).with_context(|| format!("cannot list {}", txn_dir.display())),
    }

    let ledger = LruQuotaManager::new(root, 0, 0);
    report.objects = ledger.rebuild()?;
    report.bytes = ledger.size();

    if !report.is_clean() {
        warn!(
            "{}: {} missing shards, transaction directory {}, {} stale transactions",
            root.display(),
            report.missing_shards.len(),
            if report.missing_txn_dir { "missing" } else { "present" },
            report.stale_txns.len()
        );
    }
    Ok(report)
}

fn parse_id(id: &str) -> Result<ObjectId> {
    id.parse::<ObjectId>()
        .with_context(|| format!("invalid object id '{}'", id))
}
