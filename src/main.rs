use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use log::{info, LevelFilter};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use event_exporter::{Config, EventSource, ExporterRegistry, JsonLinesFeed, Registry, RegistryConfig, Router};

#[derive(Parser)]
#[command(name = "kube-event-exporter", version, about = "Export Kubernetes events to telemetry sinks")]
struct Cli {
    /// Path to the config file; the bundled default is used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error, fatal or panic
    #[arg(short, long, global = true, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start watching and exporting events
    Start {
        /// Read the JSON-lines feed from this file instead of stdin
        #[arg(long)]
        feed: Option<PathBuf>,
    },
}

fn level_filter(verbosity: &str) -> Result<LevelFilter> {
    Ok(match verbosity.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" | "fatal" | "panic" => LevelFilter::Error,
        other => eyre::bail!("unknown verbosity level {:?}", other),
    })
}

fn setup_logging(verbosity: &str) -> Result<()> {
    // RUST_LOG env var takes precedence over the flag
    let mut builder = env_logger::Builder::new();
    if std::env::var("RUST_LOG").is_ok() {
        builder.parse_default_env();
    } else {
        builder.filter_level(level_filter(verbosity)?);
    }
    builder.init();
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn start(config: Config, feed: Option<PathBuf>) -> Result<()> {
    let lifetime = CancellationToken::new();
    let registry = Arc::new(Registry::new(RegistryConfig::default()));
    let exporters = ExporterRegistry::with_builtin(Arc::clone(&registry))?;

    let router = Router::build(&config, &exporters, Arc::clone(&registry), &lifetime)
        .await
        .context("Failed to build the pipeline")?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &feed {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open feed {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut source = JsonLinesFeed::new(reader, registry);
    let events = source.start(&lifetime).await?;

    let shutdown = lifetime.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutting down");
        shutdown.cancel();
    });

    info!("exporter started with {} routes", router.route_count());
    router.run(events, lifetime).await;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Starting kube-event-exporter with config from: {:?}", cli.config);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the tokio runtime")?;
    match cli.command {
        Commands::Start { feed } => runtime.block_on(start(config, feed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_and_panic_map_to_error() {
        assert_eq!(level_filter("fatal").unwrap(), LevelFilter::Error);
        assert_eq!(level_filter("PANIC").unwrap(), LevelFilter::Error);
        assert_eq!(level_filter("debug").unwrap(), LevelFilter::Debug);
        assert!(level_filter("loud").is_err());
    }

    #[test]
    fn test_cli_parses_start() {
        let cli = Cli::try_parse_from(["kube-event-exporter", "-v", "debug", "start", "--feed", "events.jsonl"]).unwrap();
        assert_eq!(cli.verbosity, "debug");
        assert!(matches!(cli.command, Commands::Start { feed: Some(_) }));
    }
}
