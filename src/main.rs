use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use stashfs::{load_config, LocalStore, OpenMode, Proxy, Result};

#[derive(Parser)]
#[command(
    name = "stashfs",
    about = "Caching file-access proxy over an authoritative file store",
    version
)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local cache directory (overrides config)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Authoritative store root (overrides config)
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    /// Cache capacity in entries (overrides config)
    #[arg(long, global = true)]
    capacity: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a file through the caching proxy and print it to stdout
    Cat { path: String },
    /// Write stdin to a file through the caching proxy
    Put { path: String },
    /// Remove a file from the cache
    Rm { path: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("STASHFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(dir) = args.cache_dir {
        config.cache.dir = Some(dir.to_string_lossy().to_string());
    }
    if let Some(root) = args.store_root {
        config.store.root = Some(root.to_string_lossy().to_string());
    }
    if let Some(capacity) = args.capacity {
        config.cache.capacity = Some(capacity);
    }

    let store = Arc::new(LocalStore::new(config.store.get_root())?);
    let proxy = Proxy::new(&config, store)?;
    let session = proxy.new_session()?;

    match args.command {
        Commands::Cat { path } => {
            let fd = session.open(&path, OpenMode::ReadOnly)?;
            let mut buf = vec![0u8; 64 * 1024];
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            loop {
                let n = session.read(fd, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).map_err(stashfs::StashError::Io)?;
            }
            session.close(fd)?;
        }
        Commands::Put { path } => {
            let mut bytes = Vec::new();
            std::io::stdin()
                .read_to_end(&mut bytes)
                .map_err(stashfs::StashError::Io)?;

            let fd = session.open(&path, OpenMode::CreateIfMissing)?;
            session.write(fd, &bytes)?;
            session.close(fd)?;
        }
        Commands::Rm { path } => {
            session.unlink(&path)?;
        }
    }

    Ok(0)
}
