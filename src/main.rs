//! Norx - A network intrusion detection system with live rule swap
//!
//! This is the main entry point for the Norx application.

use anyhow::{Context, Result};
use clap::Parser;
use norx::config::{ConfTree, ConfigError, ConfigSource, FileConfigSource, NorxConfig, StaticConfigSource};
use norx::core::packet::NorxPacket;
use norx::core::{NorxEngine, PacketDispatcher};
use norx::rules::RuleFileLoader;
use norx::swap::ReloadTrigger;
use norx::utils::logger;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn, Level};

/// Command line arguments for Norx
#[derive(Parser, Debug)]
#[clap(author = "Norx Team", version, about = "A network intrusion detection system with live rule swap")]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = "config/norx.toml")]
    config: String,

    /// Path to the rules directory
    #[clap(short, long)]
    rules_path: Option<String>,

    /// Number of detect worker threads
    #[clap(short, long)]
    threads: Option<usize>,

    /// Replay file to feed through the workers, one packet per line
    #[clap(long)]
    replay: Option<String>,

    /// Verbose output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn config_source(args: &Args) -> Arc<dyn ConfigSource> {
    if Path::new(&args.config).exists() {
        let mut source: FileConfigSource = FileConfigSource::new(&args.config);
        if let Some(rules_path) = &args.rules_path {
            source = source.with_override("general.rules_path", rules_path.as_str());
        }
        if let Some(threads) = args.threads {
            source = source.with_override("general.threads", threads as i64);
        }
        Arc::new(source)
    } else {
        let mut tree: ConfTree = ConfTree::new();
        if let Some(rules_path) = &args.rules_path {
            tree.set("general.rules_path", rules_path.as_str());
        }
        if let Some(threads) = args.threads {
            tree.set("general.threads", threads as i64);
        }
        Arc::new(StaticConfigSource::new(tree))
    }
}

/// Reload the rules on every SIGUSR2
#[cfg(unix)]
fn listen_for_reload(trigger: Arc<ReloadTrigger>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr2 = signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;
    tokio::spawn(async move {
        while usr2.recv().await.is_some() {
            info!("SIGUSR2 received, reloading rules");
            trigger.request();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn listen_for_reload(_trigger: Arc<ReloadTrigger>) -> Result<()> {
    warn!("Rule reload by signal is not supported on this platform");
    Ok(())
}

fn replay(path: &str, dispatcher: PacketDispatcher) -> Result<usize> {
    let source: String = std::fs::read_to_string(path).with_context(|| format!("Failed to read replay file {}", path))?;
    let mut sent: usize = 0;
    for line in source.lines() {
        let Some(packet) = NorxPacket::from_replay_line(line) else {
            continue;
        };
        dispatcher.dispatch(packet)?;
        sent += 1;
    }
    Ok(sent)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let cli_level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let source: Arc<dyn ConfigSource> = config_source(&args);
    let settings: Result<NorxConfig, ConfigError> = source.load().and_then(|tree| NorxConfig::from_tree(&tree));

    // Initialize logging with configuration, -v wins over the file
    let (log_level, log_file): (Level, Option<String>) = match &settings {
        Ok(settings) if args.verbose == 0 => (
            settings.logging.log_level.parse::<Level>().unwrap_or(cli_level),
            settings.logging.log_file.clone(),
        ),
        Ok(settings) => (cli_level, settings.logging.log_file.clone()),
        Err(_) => (cli_level, None),
    };
    logger::init_logging(log_level, log_file.as_deref())?;

    if !Path::new(&args.config).exists() {
        warn!("Configuration file {} not found, using default configuration", args.config);
    }
    let settings: NorxConfig = settings.context("Failed to load configuration")?;

    info!("Starting Norx - Network Intrusion Detection System");
    info!("Rules path: {}", settings.general.rules_path);

    // Create and initialize the Norx engine
    let mut engine: NorxEngine = NorxEngine::new(source, Arc::new(RuleFileLoader::new()));
    engine.init().await?;
    engine.start().await?;
    listen_for_reload(engine.reload_trigger())?;

    info!("Norx started successfully");

    if let (Some(path), Some(dispatcher)) = (args.replay.clone(), engine.dispatcher()) {
        tokio::task::spawn_blocking(move || match replay(&path, dispatcher) {
            Ok(sent) => info!("Replayed {} packets from {}", sent, path),
            Err(e) => error!("Replay failed: {:#}", e),
        });
    }

    // Wait for Ctrl+C
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>> = Arc::new(Mutex::new(Some(tx)));

    ctrlc::set_handler(move || {
        if let Some(tx) = tx.lock().ok().and_then(|mut tx| tx.take()) {
            let _ = tx.send(());
        }
    })
    .context("Error setting Ctrl-C handler")?;

    // Wait for shutdown signal or a fatal swap error
    let fatal: Option<anyhow::Error> = tokio::select! {
        _ = rx => None,
        result = engine.wait_service() => match result {
            Ok(_) => None,
            Err(e) => Some(e),
        },
    };
    info!("Shutting down...");

    // Stop the engine
    engine.stop().await?;

    if let Some(e) = fatal {
        error!("Norx stopped after a fatal error: {:#}", e);
        return Err(e);
    }

    info!("Norx stopped successfully");
    Ok(())
}
