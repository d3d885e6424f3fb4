//! sfstore daemon.
//!
//! Opens the metadata store (running migration and the compatibility
//! check) and keeps the garbage collector scanning until interrupted.
//! The S3 front-end runs as a separate service on top of the same
//! crate; this binary is the storage-side core.

use clap::Parser;
use tracing::info;

/// Command-line arguments for the sfstore daemon.
#[derive(Parser, Debug)]
#[command(name = "sfstore", version, about = "S3-compatible object store core")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the data directory.
    #[arg(short, long)]
    data_path: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            sfstore::config::load_config(path)?
        }
        None => sfstore::StoreConfig::default(),
    };
    if let Some(data_path) = cli.data_path {
        config.data_path = data_path;
    }

    let store = sfstore::Store::open(config)?;
    info!(data_path = %store.data_path().display(), "store opened");

    store.gc().initialize();

    // runs until the init system stops the process; handles stay open
    // for the life of each thread and SQLite in WAL mode recovers
    // cleanly from a kill
    loop {
        std::thread::park();
    }
}
