//! cachectl - operator CLI for cascache directories

mod handler;

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;

use anyhow::{Context, Result};
use cascache::{CacheConfig, QuotaManager, TXN_DIR};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::handler::CommandHandler;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache root directory
    #[arg(short, long, global = true, default_value = "./cache")]
    root: PathBuf,

    /// Shared cache with group-writable permissions
    #[arg(long, global = true)]
    alien: bool,

    /// Shared cache lives on NFS (publish with link instead of rename)
    #[arg(long, global = true)]
    nfs: bool,

    /// TOML configuration file, replaces --root/--alien/--nfs
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Quota limit in bytes (0 = unlimited)
    #[arg(short, long, global = true, default_value_t = 0)]
    limit: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the cache directory layout
    Init,
    /// Store a file (or `-` for stdin) under an object id
    Put {
        id: String,
        file: PathBuf,
        /// Evict before regular objects
        #[arg(long)]
        volatile: bool,
        /// Description recorded in the quota ledger
        #[arg(long)]
        desc: Option<String>,
    },
    /// Print an object to stdout or a file
    Get {
        id: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Show size and path of an object
    Stat { id: String },
    /// Verify the directory layout without changing it
    Check,
    /// Evict objects until at most LEAVE_SIZE bytes remain
    Cleanup { leave_size: u64 },
    /// Drain this process's cache manager and report the read-only switch.
    ///
    /// Only transactions of this invocation are waited for; writers in other
    /// processes are not seen and the read-only state ends when it exits.
    Drain,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::new(&args.root).alien(args.alien).on_nfs(args.nfs),
    };
    let config_root = config.cache_root.clone();

    let limit = args.limit;
    let open = move || CommandHandler::open(config.clone(), limit);

    match args.command {
        Command::Init => {
            let handler = open()?;
            info!("Cache ready at {}", handler.cache().root().display());
        }
        Command::Put {
            id,
            file,
            volatile,
            desc,
        } => {
            let size = open()?.put(&id, &file, desc.as_deref(), volatile)?;
            println!("{} {}", id, size);
        }
        Command::Get { id, out } => {
            let handler = open()?;
            match out {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    handler.get(&id, &mut BufWriter::new(file))?;
                }
                None => {
                    handler.get(&id, &mut io::stdout().lock())?;
                }
            }
        }
        Command::Stat { id } => {
            let (size, path) = open()?.stat(&id)?;
            println!("{} {} {}", id, size, path.display());
        }
        Command::Check => {
            // Opening would create missing directories and purge stale transactions
            let report = handler::check(&config_root)?;
            println!("objects: {}", report.objects);
            println!("bytes:   {}", report.bytes);
            for shard in &report.missing_shards {
                println!("missing: {}", shard);
            }
            if report.missing_txn_dir {
                println!("missing: {} (transaction directory)", TXN_DIR);
            }
            for txn in &report.stale_txns {
                println!("stale:   {}", txn.display());
            }
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
        Command::Cleanup { leave_size } => {
            let handler = open()?;
            let reached = handler.cleanup(leave_size);
            println!(
                "size: {} pinned: {}",
                handler.quota().size(),
                handler.quota().size_pinned()
            );
            if !reached {
                std::process::exit(1);
            }
        }
        Command::Drain => {
            let mode = open()?.drain();
            println!("{:?}", mode);
        }
    }

    Ok(())
}
