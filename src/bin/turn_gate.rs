use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sharp_turn_gate::{generate_auth_key, init_logging, GateConfig, MemoryCredentialStore, TurnGate, VERSION};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "SHARP TURN gate", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gate until Ctrl-C
    Run {
        /// JSON configuration file, defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON array of users to load into the memory store
        #[arg(short, long)]
        users: PathBuf,

        /// Log level, overrides the configuration file
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Print the hex long-term credential key for a user
    AuthKey {
        #[arg(short, long)]
        username: String,

        #[arg(short, long, default_value = "sharp-turn")]
        realm: String,

        #[arg(short, long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    match Args::parse().command {
        Command::Run {
            config,
            users,
            log_level,
        } => run(config, users, log_level).await,
        Command::AuthKey {
            username,
            realm,
            password,
        } => {
            println!("{}", generate_auth_key(&username, &realm, &password));
            Ok(())
        }
    }
}

async fn run(config: Option<PathBuf>, users: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match config {
        Some(path) => GateConfig::from_json_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => GateConfig::default(),
    };

    let store = MemoryCredentialStore::from_json_file(config.realm.clone(), &users)
        .with_context(|| format!("failed to load users from {}", users.display()))?;

    let user_count = store.len();
    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    let format = config.logging.format;
    let gate = TurnGate::builder(config).store(Arc::new(store)).build()?;
    // The dumper layer needs the built gate, so nothing logged before this line is kept
    init_logging(&level, format, Some(gate.dumper()))?;

    info!(
        version = VERSION,
        users = user_count,
        realm = %gate.config().realm,
        policy = gate.get_stats().policy,
        "SHARP TURN gate starting"
    );
    gate.start();

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    gate.shutdown().await;
    let stats = gate.get_stats();
    info!(stats = %serde_json::to_string(&stats)?, "Final statistics");
    Ok(())
}
