use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tally_core::model::ItemLimits;
use tally_core::{Session, SettledSession};
use tally_settings::TallySettings;
use tally_store::{Database, MemorySessionStore, SessionStore, SqliteSessionStore};
use tally_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "tally", version, about = "Group food-ordering sessions with live cost settlement")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP + WebSocket server.
    Serve {
        /// Settings file (defaults to ~/.tally/settings.json).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        /// SQLite path, or `:memory:`.
        #[arg(long)]
        db: Option<String>,
    },
    /// Print the settlement of a session JSON document.
    Settle {
        #[arg(long)]
        file: PathBuf,
        /// Print the combined order and CSV instead of JSON.
        #[arg(long)]
        text: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Serve { config, port, db } => serve(config, port, db).await,
        Command::Settle { file, text } => settle(&file, text),
    }
}

async fn serve(config: Option<PathBuf>, port: Option<u16>, db: Option<String>) -> anyhow::Result<()> {
    let mut settings = match &config {
        Some(path) => tally_settings::load_settings_from_path(path),
        None => tally_settings::load_settings(),
    }
    .context("load settings")?;
    if let Some(port) = port {
        settings.server.port = port;
    }
    if let Some(db) = db {
        settings.server.database_path = db;
    }

    let telemetry = TelemetryConfig::from_settings(&settings.logging)?;
    let _telemetry = init_telemetry(telemetry)?;

    let store = open_store(&settings)?;
    let handle = tally_server::start(&settings, store)
        .await
        .context("start server")?;
    tracing::info!(port = handle.port, "tally server ready");

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

fn open_store(settings: &TallySettings) -> anyhow::Result<Arc<dyn SessionStore>> {
    if settings.server.uses_memory_store() {
        tracing::warn!("using in-memory store; sessions are lost on restart");
        return Ok(Arc::new(MemorySessionStore::new()));
    }
    let path = PathBuf::from(&settings.server.database_path);
    let db = Database::open(&path).with_context(|| format!("open database {}", path.display()))?;
    Ok(Arc::new(SqliteSessionStore::new(db)))
}

fn settle(file: &PathBuf, text: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let session: Session = serde_json::from_str(&raw).context("parse session document")?;
    let session = session
        .validated(&ItemLimits::default())
        .context("invalid session document")?;
    let view = SettledSession::new(session).view();

    if text {
        println!("{}", tally_sync::combined_order_text(&view));
        println!();
        print!("{}", tally_sync::settlement_csv(&view));
    } else {
        println!("{}", serde_json::to_string_pretty(&view)?);
    }
    Ok(())
}
