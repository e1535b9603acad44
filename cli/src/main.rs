//! Weft gateway binary.
//!
//! `weft serve` loads `.env` + environment settings, initializes tracing, and
//! runs the HTTP gateway until SIGTERM/ctrl-c. Exit codes: 0 on clean
//! shutdown, 2 on fatal configuration errors, 1 on bind/serve failure.

use clap::{Parser, Subcommand};
use config::Settings;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(about = "Weft — multi-tenant LLM gateway")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Bind address (default 127.0.0.1:8080 or WEFT_ADDR)
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,

        /// SQLite database path (default weft.db or WEFT_DB)
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = config::load_and_apply(None) {
        eprintln!("weft: failed to load .env: {e}");
        std::process::exit(2);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("fatal configuration error: {}", e);
            std::process::exit(2);
        }
    };

    match args.cmd {
        Command::Serve { addr, db } => {
            if let Some(addr) = addr {
                settings.addr = addr;
            }
            if let Some(db) = db {
                settings.db_path = db;
            }
            if let Err(e) = serve::run_serve(&settings).await {
                tracing::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
