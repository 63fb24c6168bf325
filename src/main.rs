//! # API Scribe CLI (`scribe`)
//!
//! ## Usage
//!
//! ```bash
//! scribe --config ./config/scribe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scribe init` | Create the SQLite database and run schema migrations |
//! | `scribe ingest` | Ingest gateway logs for a time window |
//! | `scribe build` | Merge new samples into request/response structures |
//! | `scribe apis` | List discovered Apis |
//! | `scribe doc <id>` | Print the OpenAPI document for one Api |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest a specific morning
//! scribe ingest --start 2024-11-29T07:00:00Z --end 2024-11-29T12:00:00Z
//!
//! # Second page of Apis
//! scribe apis --limit 50 --offset 50
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use api_scribe::{apis, build, config, doc, ingest, logging, migrate};

/// API Scribe: OpenAPI documents inferred from gateway traffic.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/scribe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "scribe",
    about = "API Scribe: infer OpenAPI documents from archived gateway logs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/scribe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest gateway logs from blob storage.
    ///
    /// Without flags the window comes from `[ingest]`, or defaults to the
    /// previous whole hour.
    Ingest {
        /// Window start (RFC 3339), floored to the hour.
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Window end (RFC 3339), exclusive.
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },

    /// Fold new samples into each Api's request and response structures.
    Build,

    /// List discovered Apis.
    Apis {
        #[arg(long, default_value = "20")]
        limit: i64,

        #[arg(long, default_value = "0")]
        offset: i64,
    },

    /// Print the OpenAPI document for one Api.
    Doc {
        /// Api UUID (see `scribe apis`).
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { start, end } => {
            ingest::run_ingest(&cfg, start, end).await?;
        }
        Commands::Build => {
            build::run_build(&cfg).await?;
        }
        Commands::Apis { limit, offset } => {
            apis::list_apis(&cfg, limit, offset).await?;
        }
        Commands::Doc { id } => {
            doc::print_document(&cfg, &id).await?;
        }
    }

    Ok(())
}
