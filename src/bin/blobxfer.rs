use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use blobxfer::cache::{BlobInfoCache, DiskBlobInfoCache, MemoryBlobInfoCache};
use blobxfer::chunk;
use blobxfer::config::{load_config, validate_config, TransferConfig};
use blobxfer::dest::DirectoryStore;
use blobxfer::digest::{self, Algorithm};
use blobxfer::source::{FileSource, ImageRef, RegistrySource, SeekableSource};
use blobxfer::{BlobInfo, Digest};

#[derive(Parser)]
#[command(
    name = "blobxfer",
    version,
    about = "Copy content-addressed blobs into a local store, fetching only missing ranges"
)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(long, global = true, env = "BLOBXFER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory store root (overrides the configuration file)
    #[arg(long, global = true, env = "BLOBXFER_STORE")]
    store: Option<PathBuf>,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a local file as one blob
    Put {
        #[arg(long)]
        file: PathBuf,
        /// Expected digest; computed from the file when omitted
        #[arg(long)]
        digest: Option<Digest>,
    },
    /// Pull a blob by ranges, resuming from what the store already holds
    Fetch {
        /// A directory store, a single file, or a registry image reference
        #[arg(long)]
        source: String,
        #[arg(long)]
        digest: Digest,
        #[arg(long)]
        size: u64,
    },
    /// List complete blobs and unfinished partial pulls
    Inspect,
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TransferConfig::default(),
    }
    .with_env_overrides();
    if let Some(store) = &cli.store {
        config.store = store.clone();
    }
    validate_config(&config)?;

    match cli.command {
        Command::Put { file, digest } => cmd_put(&config, &file, digest).await?,
        Command::Fetch {
            source,
            digest,
            size,
        } => cmd_fetch(&config, &source, digest, size).await?,
        Command::Inspect => cmd_inspect(&config).await?,
        Command::Version => println!("blobxfer {}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "blobxfer.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn open_cache(config: &TransferConfig) -> Arc<dyn BlobInfoCache> {
    match &config.cache {
        Some(path) => Arc::new(DiskBlobInfoCache::open(path)),
        None => Arc::new(MemoryBlobInfoCache::new()),
    }
}

/// Round to milliseconds so humantime prints something readable.
fn elapsed(start: Instant) -> humantime::FormattedDuration {
    let ms = start.elapsed().as_millis() as u64;
    humantime::format_duration(Duration::from_millis(ms))
}

async fn cmd_put(
    config: &TransferConfig,
    file: &Path,
    digest: Option<Digest>,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let digest = match digest {
        Some(d) => d,
        None => digest::digest_file(file, Algorithm::Sha256).await?,
    };

    let store = DirectoryStore::new(&config.store);
    let cache = open_cache(config);
    let reader = tokio::fs::File::open(file).await?;
    let stored = store
        .put_blob(&CancellationToken::new(), Box::pin(reader), &BlobInfo::new(digest))
        .await?;
    cache.record_known_location(&stored.digest, store.location());

    println!("digest: {}", stored.digest);
    println!("size: {}", stored.size.unwrap_or_default());
    println!("path: {}", store.blob_path(&stored.digest).display());
    println!("elapsed: {}", elapsed(start));
    Ok(())
}

async fn cmd_fetch(
    config: &TransferConfig,
    source: &str,
    digest: Digest,
    size: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let info = BlobInfo::new(digest.clone()).with_size(size);
    let source = open_source(config, source, &digest)?;

    let store = DirectoryStore::new(&config.store);
    let cache = open_cache(config);
    let before = store.partial_ranges(&digest).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let stored = store
        .put_blob_partial(&cancel, &*source, &info, &*cache)
        .await?;
    let stats = store.stats();

    println!("digest: {}", stored.digest);
    println!("size: {}", stored.size.unwrap_or_default());
    if let Some(ledger) = before {
        let resumed = chunk::covered_len(&ledger.chunks);
        println!("resumed: {} bytes already staged", resumed);
    }
    println!("fetched: {} bytes", stats.bytes_written);
    println!("elapsed: {}", elapsed(start));
    Ok(())
}

fn open_source(
    config: &TransferConfig,
    source: &str,
    digest: &Digest,
) -> Result<Box<dyn SeekableSource>, Box<dyn std::error::Error>> {
    let path = Path::new(source);
    if path.is_dir() {
        return Ok(Box::new(
            FileSource::from_store(path).with_concurrency(config.chunk_concurrency),
        ));
    }
    if path.is_file() {
        return Ok(Box::new(
            FileSource::from_file(digest.clone(), path).with_concurrency(config.chunk_concurrency),
        ));
    }

    let image = ImageRef::parse(source)?;
    let mut registry = RegistrySource::with_user_agent(image, &config.user_agent)?
        .with_concurrency(config.chunk_concurrency);
    if let Some(token) = config.bearer_token() {
        registry = registry.bearer_token(token);
    }
    Ok(Box::new(registry))
}

async fn cmd_inspect(config: &TransferConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = DirectoryStore::new(&config.store);

    let blobs = store.list_blobs().await?;
    println!("store: {}", store.root().display());
    println!("blobs: {}", blobs.len());
    for blob in &blobs {
        println!("  {}  {}", blob.digest, blob.size.unwrap_or_default());
    }

    let partials = store.list_partials().await?;
    if !partials.is_empty() {
        println!("partial: {}", partials.len());
        for (digest, ledger) in &partials {
            let have = chunk::covered_len(&ledger.chunks);
            println!("  {}  {}/{}", digest, have, ledger.size);
        }
    }
    Ok(())
}
