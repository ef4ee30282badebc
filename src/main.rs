//! # docai CLI
//!
//! ## Usage
//!
//! ```bash
//! docai --config ./config/docai.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docai init` | Create the database schema and the storage bucket |
//! | `docai serve` | Start the HTTP API and background analysis workers |
//! | `docai upload <path>` | Ingest a local file |
//! | `docai analyze <id>` | Analyze a stored document |
//! | `docai get <id>` | Print a document record as JSON |
//! | `docai extract <path>` | Print the text extracted from a local file |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docai::{app, config, logging, server};

/// docai: document ingestion and AI analysis.
///
/// All commands except `extract` read a TOML configuration file given by
/// `--config`. See `config/docai.example.toml`.
#[derive(Parser)]
#[command(
    name = "docai",
    about = "Document ingestion and AI analysis service",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docai.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset (e.g. `debug`, `docai=trace`).
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and the storage bucket.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and runs until Ctrl-C.
    Serve,

    /// Upload a local file through the ingestion workflow.
    ///
    /// A file whose name was uploaded before returns the existing record.
    Upload {
        path: PathBuf,

        /// MIME type to record; inferred from the extension when omitted.
        #[arg(long)]
        content_type: Option<String>,

        /// Analyze the document right after uploading it.
        #[arg(long)]
        analyze: bool,
    },

    /// Run language-model analysis on a stored document.
    Analyze { id: String },

    /// Print a document record as JSON.
    Get { id: String },

    /// Print the text extracted from a local file. Nothing is stored.
    Extract { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log.as_deref())?;

    // Commands that don't require config
    if let Commands::Extract { path } = &cli.command {
        return app::run_extract(path);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => app::run_init(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Upload {
            path,
            content_type,
            analyze,
        } => app::run_upload(&cfg, &path, content_type.as_deref(), analyze).await?,
        Commands::Analyze { id } => app::run_analyze(&cfg, &id).await?,
        Commands::Get { id } => app::run_get(&cfg, &id).await?,
        Commands::Extract { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}
