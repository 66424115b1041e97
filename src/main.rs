use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aureli::config::Config;
use aureli::db::{DbHandle, LeadsDb};
use aureli::dispatch::Dispatcher;
use aureli::server;

#[derive(Parser)]
#[command(name = "aureli", version, about = "Lead-management backend with webhook automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and the background dispatch worker
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Seconds between dispatch cycles
        #[arg(long)]
        dispatch_interval: Option<u64>,
        /// Permissive CORS for a local frontend dev server
        #[arg(long)]
        dev: bool,
    },
    /// Create the database file and schema, then exit
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Run a single dispatch cycle, then exit (for cron-style operation)
    Dispatch {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        Command::Serve {
            port,
            db_path,
            dispatch_interval,
            dev,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            if let Some(secs) = dispatch_interval {
                config.dispatch_interval = Duration::from_secs(secs);
            }
            if dev {
                config.dev_mode = true;
            }
            server::start_server(config).await
        }
        Command::InitDb { db_path } => {
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            server::ensure_db_dir(&config)?;
            LeadsDb::new(&config.db_path)?;
            println!("Initialized database at {}", config.db_path.display());
            Ok(())
        }
        Command::Dispatch { db_path } => {
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            server::ensure_db_dir(&config)?;
            let db = DbHandle::open(&config.db_path)?;
            let dispatcher = Dispatcher::new(db, &config)?;
            let stats = dispatcher.dispatch_pending().await?;
            println!(
                "Dispatched: {} attempted, {} sent, {} failed, {} pending retry",
                stats.attempted, stats.sent, stats.failed, stats.retried
            );
            Ok(())
        }
    }
}
