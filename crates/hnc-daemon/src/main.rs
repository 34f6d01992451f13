//! hnc-daemon - namespace hierarchy controller
//!
//! Loads a TOML configuration, seeds an in-memory store from a JSON fixture,
//! reconciles every namespace and prints the converged objects as JSON.
//!
//! By default the controller drains its queue once and exits. With `--serve`
//! it runs the worker pool until Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hnc_core::{ExclusionPolicy, HncConfig};
use hnc_daemon::{ClusterSnapshot, Controller, ControllerConfig, MemoryStore, ObjectStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// hnc daemon - namespace hierarchy controller
#[derive(Parser, Debug)]
#[command(name = "hnc-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply if it does not exist)
    #[arg(short, long, default_value = "hnc.toml")]
    config: PathBuf,

    /// JSON fixture of namespaces and hierarchy configurations to load
    #[arg(short, long)]
    fixture: Option<PathBuf>,

    /// Number of reconciliation workers (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,

    /// Excluded namespace; repeat to exclude several (replaces the configured
    /// list)
    #[arg(long = "exclude", value_name = "NAMESPACE")]
    exclude: Vec<String>,

    /// Keep running until Ctrl-C instead of exiting once converged
    #[arg(long)]
    serve: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        // Stdout carries the JSON result.
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<HncConfig> {
    let mut config = if args.config.exists() {
        HncConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "Config file not found; using defaults");
        HncConfig::default()
    };

    if let Some(workers) = args.workers {
        config.controller.workers = workers;
    }
    if !args.exclude.is_empty() {
        config.exclusion.excluded_namespaces.clone_from(&args.exclude);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_fixture(path: Option<&Path>) -> Result<ClusterSnapshot> {
    let Some(path) = path else {
        warn!("No fixture given; starting with an empty store");
        return Ok(ClusterSnapshot::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse fixture {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = load_config(&args)?;
    let exclusions = config.exclusion.to_exclusion_set()?;
    let snapshot = load_fixture(args.fixture.as_deref())?;
    info!(
        namespaces = snapshot.namespaces.len(),
        hierarchies = snapshot.hierarchies.len(),
        workers = config.controller.workers,
        "Starting hnc-daemon"
    );

    let store = Arc::new(MemoryStore::from_snapshot(snapshot));
    let controller = Arc::new(Controller::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        ExclusionPolicy::new(exclusions),
        ControllerConfig::from_config(&config),
    ));

    if args.serve {
        Arc::clone(&controller)
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
            })
            .await
            .context("controller failed")?;
    } else {
        let mut events = controller.subscribe();
        controller.resync().await.context("initial resync failed")?;
        let passes = controller
            .run_until_idle(&mut events)
            .await
            .context("controller failed to converge")?;
        info!(passes, "Hierarchy converged");
    }

    let output = serde_json::to_string_pretty(&store.snapshot())
        .context("failed to serialize result")?;
    println!("{output}");
    Ok(())
}
