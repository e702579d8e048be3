//! Tessera Metadata Service
//!
//! Single-node driver for the metadata apply pipeline. Client requests are
//! read as JSON lines from stdin, sequenced into log indices, applied and
//! answered on stdout once durable.

mod driver;

use anyhow::{Context, Result};
use clap::Parser;
use driver::{Driver, DriverStats};
use std::path::PathBuf;
use std::sync::Arc;
use tessera_common::{MetaConfig, UserInfo};
use tessera_meta_apply::RequestPipeline;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tessera-meta")]
#[command(about = "Tessera Metadata Service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tessera/meta.toml")]
    config: PathBuf,

    /// Database path (overrides the configuration file)
    #[arg(long, env = "TESSERA_DB_PATH")]
    db_path: Option<PathBuf>,

    /// User recorded as the caller of every request
    #[arg(long, default_value = "admin")]
    user: String,

    /// Remote address recorded with the caller
    #[arg(long)]
    remote_address: Option<String>,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long)]
    metrics: bool,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Layer the optional config file and `TESSERA__*` environment variables
fn load_config(args: &Args) -> Result<MetaConfig> {
    let mut config: MetaConfig = config::Config::builder()
        .add_source(config::File::from(args.config.as_path()).required(false))
        .add_source(
            config::Environment::with_prefix("TESSERA")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(db_path) = &args.db_path {
        config.store.db_path.clone_from(db_path);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries replies
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(
            args.log_json
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!args.log_json)
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();

    info!("Starting Tessera Metadata Service");

    let config = load_config(&args)?;
    if let Some(dir) = config.store.db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    info!("Opening metadata store at {}", config.store.db_path.display());

    let pipeline = Arc::new(
        RequestPipeline::open(&config).context("failed to open metadata store")?,
    );
    let flusher = pipeline.buffer().start();

    let mut caller = UserInfo::new(args.user.as_str());
    if let Some(address) = &args.remote_address {
        caller = caller.with_remote_address(address.as_str());
    }
    let mut driver = Driver::new(Arc::clone(&pipeline), caller)?;
    info!("Accepting requests from index {}", driver.next_index());

    let result = tokio::select! {
        result = driver.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
            Ok(DriverStats::default())
        }
    };

    pipeline.buffer().shutdown();
    flusher.await.context("flush loop panicked")?;

    let stats = result?;
    info!(
        "Processed {} entries ({} rejected, {} malformed), flushed up to index {}",
        stats.applied,
        stats.rejected,
        stats.malformed,
        pipeline.buffer().stats().flushed_index
    );
    if args.metrics {
        eprint!("{}", pipeline.export_metrics());
    }

    info!("Metadata Service shut down gracefully");
    Ok(())
}
