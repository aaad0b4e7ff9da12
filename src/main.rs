//! CLI entry point for periph-board
//!
//! ```bash
//! # Validate a config file
//! periph-board check --config board.toml
//!
//! # Bring a board up and keep it running until Ctrl-C
//! periph-board run --config board.toml
//!
//! # Same, against the in-memory platform, reconfiguring on file changes
//! periph-board run --config board.toml --mock --watch
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use periph_board::config::AppConfig;
use periph_board::logging::{self, TracingConfig};
use periph_board::platform::{MockPlatform, Platform};
use periph_board::{Board, ModelRegistry};

#[derive(Parser)]
#[command(name = "periph-board")]
#[command(about = "Live-reconfigurable board driver host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the board and keep it up until interrupted
    Run {
        /// Board config file (TOML or JSON)
        #[arg(long)]
        config: PathBuf,

        /// Use the in-memory platform instead of real hardware
        #[arg(long)]
        mock: bool,

        /// Reconfigure the board when the config file changes
        #[arg(long)]
        watch: bool,
    },

    /// Load and validate a config file, then exit
    Check {
        /// Board config file (TOML or JSON)
        #[arg(long)]
        config: PathBuf,

        /// Print the effective config (file plus environment overrides)
        #[arg(long, value_enum)]
        print: Option<PrintFormat>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PrintFormat {
    Toml,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            mock,
            watch,
        } => run(&config, mock, watch).await,
        Commands::Check { config, print } => check(&config, print),
    }
}

fn check(path: &Path, print: Option<PrintFormat>) -> Result<()> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    ModelRegistry::new().get(&config.board.model)?;
    match print {
        Some(PrintFormat::Toml) => println!("{}", toml::to_string_pretty(&config)?),
        Some(PrintFormat::Json) => println!("{}", serde_json::to_string_pretty(&config)?),
        None => {}
    }
    println!(
        "{}: ok ({} spi, {} i2c, {} analog, {} digital interrupt)",
        path.display(),
        config.board.attributes.spis.len(),
        config.board.attributes.i2cs.len(),
        config.board.attributes.analogs.len(),
        config.board.attributes.digital_interrupts.len(),
    );
    Ok(())
}

async fn run(path: &Path, mock: bool, watch: bool) -> Result<()> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    logging::init(TracingConfig::from_section(&config.logging)?)?;

    let platform = platform_for(&config, mock)?;
    let models = ModelRegistry::new();
    let board = Board::from_app_config(&config, &models, platform)
        .await
        .context("failed to build board")?;
    log_resources(&board).await;

    if watch {
        watch_until_interrupted(&board, path).await?;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    board.close().await;
    Ok(())
}

fn platform_for(config: &AppConfig, mock: bool) -> Result<Arc<dyn Platform>> {
    if mock {
        let pins = config
            .board
            .attributes
            .digital_interrupts
            .iter()
            .map(|d| d.pin.clone());
        return Ok(Arc::new(MockPlatform::with_lines(pins)));
    }
    native_platform()
}

#[cfg(target_os = "linux")]
fn native_platform() -> Result<Arc<dyn Platform>> {
    Ok(Arc::new(periph_board::platform::SysfsPlatform::new()))
}

#[cfg(not(target_os = "linux"))]
fn native_platform() -> Result<Arc<dyn Platform>> {
    anyhow::bail!("no hardware platform on this OS; pass --mock")
}

async fn log_resources(board: &Board) {
    info!(
        board = %board.name(),
        spis = ?board.spi_names().await,
        i2cs = ?board.i2c_names().await,
        analogs = ?board.analog_names().await,
        digital_interrupts = ?board.digital_interrupt_names().await,
        "resources"
    );
}

async fn reload(board: &Board, path: &Path) {
    let config = match AppConfig::load_from(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring invalid config change");
            return;
        }
    };
    match board.reconfigure(&config.board.attributes).await {
        Ok(summary) if summary.is_noop() => {}
        Ok(_) => log_resources(board).await,
        Err(e) => warn!(error = %e, "reconfigure failed; fix the config and save again"),
    }
}

#[cfg(feature = "hot_reload")]
async fn watch_until_interrupted(board: &Board, path: &Path) -> Result<()> {
    use notify::{Event, EventKind, RecursiveMode, Watcher};
    use tokio::sync::mpsc;

    let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(16);
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.blocking_send(res);
    })?;
    // Editors often replace the file, so watch the directory.
    let target = path.canonicalize()?;
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %target.display(), "watching config for changes");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                return Ok(());
            }
            Some(event) = rx.recv() => match event {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event.paths.iter().any(|p| p.file_name() == target.file_name());
                    if relevant {
                        reload(board, &target).await;
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            },
        }
    }
}

#[cfg(not(feature = "hot_reload"))]
async fn watch_until_interrupted(board: &Board, path: &Path) -> Result<()> {
    warn!("built without the hot_reload feature; --watch reloads on SIGHUP only");
    watch_sighup(board, path).await
}

#[cfg(all(not(feature = "hot_reload"), unix))]
async fn watch_sighup(board: &Board, path: &Path) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                return Ok(());
            }
            _ = hangup.recv() => reload(board, path).await,
        }
    }
}

#[cfg(all(not(feature = "hot_reload"), not(unix)))]
async fn watch_sighup(_board: &Board, _path: &Path) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
