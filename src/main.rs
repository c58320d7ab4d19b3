use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, EnvFilter};

use asflow::agent::Agent;
use asflow::catalog::InterfaceCatalog;
use asflow::config::{LoggingConfig, Settings};

/// Per-ASN interface bandwidth collector.
#[derive(Parser)]
#[command(name = "asflow", about)]
struct Cli {
    /// Path to the YAML settings file.
    #[arg(short, long, default_value = "settings.yaml")]
    config: PathBuf,

    /// Path to the YAML interface catalog.
    #[arg(short, long, default_value = "interfaces.yaml")]
    interfaces: PathBuf,

    /// Logging filter, overriding logging.level (e.g. info, asflow=debug).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("asflow {}", version::full());
        return Ok(());
    }

    let settings = Settings::load(&cli.config)?;

    init_tracing(&settings.logging, cli.log_level.as_deref())?;

    let catalog = InterfaceCatalog::load(&cli.interfaces)
        .with_context(|| format!("loading interfaces from {}", cli.interfaces.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        interfaces = catalog.len(),
        "starting asflow",
    );
    if catalog.is_empty() {
        tracing::warn!("interface catalog is empty, no flows will be recorded");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(settings, catalog))
}

/// Installs the global subscriber. Output goes to stdout and, when
/// `logging.file` is set, is appended to that file as well.
fn init_tracing(cfg: &LoggingConfig, override_level: Option<&str>) -> Result<()> {
    let level = override_level.unwrap_or(&cfg.level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    let builder = fmt().with_env_filter(filter).with_target(true);

    if cfg.file.is_empty() {
        builder.init();
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.file)
        .with_context(|| format!("opening log file {}", cfg.file))?;

    builder
        .with_ansi(false)
        .with_writer(std::io::stdout.and(Mutex::new(file)))
        .init();

    Ok(())
}

async fn run(settings: Settings, catalog: InterfaceCatalog) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(settings, Arc::new(catalog))?;
    agent.start().await?;

    let outcome = tokio::select! {
        _ = shutdown_rx => Ok(()),
        res = agent.wait() => {
            if let Err(e) = &res {
                tracing::error!(error = %format!("{e:#}"), "pipeline stopped unexpectedly");
            }
            res
        }
    };

    agent.stop().await?;

    tracing::info!("asflow stopped");

    outcome
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            None
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        Some(_) = async {
            match sigterm.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending().await,
            }
        } => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
