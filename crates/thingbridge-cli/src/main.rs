//! Command-line interface for the ThingBridge gateway.

mod config;
mod loader;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use thingbridge_core::{CancellationToken, HandlerRegistry};
use thingbridge_devices::{MissionControl, MqttTransport, Registry};
use thingbridge_storage::DriverRegistry;
use tracing::{error, info};

use crate::config::{Config, MqttConfig, StorageConfig};

/// ThingBridge - bridge MQTT devices to described things.
#[derive(Parser, Debug)]
#[command(name = "thingbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform. Defaults to `run`.
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory with thing definitions.
    #[arg(short, long, global = true)]
    things: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and run until interrupted.
    Run(RunArgs),
    /// Load and validate thing definitions, then exit.
    Check,
}

#[derive(ClapArgs, Debug, Default)]
struct RunArgs {
    /// MQTT broker, `tcp://host:port`. May be repeated; the first one is used.
    #[arg(long = "broker")]
    brokers: Vec<String>,

    /// MQTT client ID.
    #[arg(long)]
    client_id: Option<String>,

    /// MQTT username.
    #[arg(long)]
    username: Option<String>,

    /// MQTT password.
    #[arg(long)]
    password: Option<String>,

    /// Storage driver name.
    #[arg(long)]
    storage: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n=== PANIC ===");
        if let Some(location) = panic_info.location() {
            eprintln!("Location: {}:{}:{}", location.file(), location.line(), location.column());
        } else {
            eprintln!("Location: <unknown>");
        }
        eprintln!("Message: {}", panic_info);
        eprintln!("==============\n");
    }));

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run(RunArgs::default()));

    let mut flags = Config {
        log_level: args.log_level,
        things_dir: args.things,
        ..Default::default()
    };
    if let Command::Run(run) = &command {
        flags.mqtt = MqttConfig {
            brokers: run.brokers.clone(),
            client_id: run.client_id.clone(),
            username: run.username.clone(),
            password: run.password.clone(),
            keep_alive_secs: None,
        };
        if let Some(driver) = &run.storage {
            flags.storage = StorageConfig {
                driver: driver.clone(),
                ..Default::default()
            };
        }
    }
    flags.validate()?;

    let config = match &args.config {
        Some(path) => flags.merge(Config::load(path)?),
        None => flags,
    };

    init_logging(config.log_level.as_deref());

    match command {
        Command::Run(_) => run(config).await,
        Command::Check => check(&config),
    }
}

fn init_logging(level: Option<&str>) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var("THINGBRIDGE_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    // An explicit level wins over RUST_LOG
    let env_filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(format!("thingbridge={}", level)),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("thingbridge=info")),
    };

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

/// Validate every thing definition and print a summary.
fn check(config: &Config) -> Result<()> {
    let dir = config
        .things_dir
        .as_ref()
        .context("no things directory configured (use --things or things_dir)")?;

    let handlers = HandlerRegistry::with_builtins();
    let things = loader::load_things(dir, &handlers)?;

    for thing in &things {
        println!("ok: {} ({} properties)", thing.id, thing.properties.len());
    }
    println!("{} things valid", things.len());
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let drivers = DriverRegistry::with_builtins();
    let registry = Arc::new(
        Registry::open(&drivers, &config.storage.driver, &config.storage.options)
            .with_context(|| format!("failed to open storage driver '{}'", config.storage.driver))?,
    );

    let shutdown = CancellationToken::new();
    if let Some(dir) = &config.things_dir {
        let things = loader::load_things(dir, &handlers)?;
        for thing in things {
            let id = thing.id.clone();
            registry
                .create(&shutdown, thing)
                .await
                .with_context(|| format!("failed to register thing '{}'", id))?;
        }
        info!(dir = %dir.display(), "Thing definitions loaded");
    }

    let settings = config.mqtt_settings()?;
    let transport = Arc::new(MqttTransport::connect(&settings, CancellationToken::new()));
    let mission = MissionControl::new(transport.clone(), registry.clone(), handlers);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received");
                    shutdown.cancel();
                }
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
        });
    }

    let result = mission.run(shutdown).await;

    registry.drain().await;
    transport.shutdown().await;

    result?;
    info!("ThingBridge stopped");
    Ok(())
}
