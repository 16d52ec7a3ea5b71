//! # HealthFlow CLI (`healthflow`)
//!
//! The `healthflow` binary runs the HTTP API and exposes the ingestion and
//! retrieval pipeline for local use and operations.
//!
//! ## Usage
//!
//! ```bash
//! healthflow --config ./config/healthflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `healthflow init` | Create the SQLite database and run schema migrations |
//! | `healthflow serve` | Start the HTTP API |
//! | `healthflow upload <path>` | Store a file as a new document |
//! | `healthflow ingest <id>` | Extract, chunk and embed a document |
//! | `healthflow retry <id>` | Re-embed the queued chunks of a partially completed document |
//! | `healthflow search "<query>"` | Semantic search over one owner's documents |
//! | `healthflow get <id>` | Show a document and its chunks |
//! | `healthflow token <subject>` | Issue an access token for a configured subject |
//! | `healthflow hash-password <password>` | Print the salted hash lines for `[[auth.users]]` |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use healthflow::identity::{hash_password, HmacIdentity, PBKDF2_ITERATIONS};
use healthflow::{config, get, ingest_cmd, migrate, search, server};
use healthflow_core::models::DocumentType;

/// HealthFlow: personal health record ingestion, search and chat.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/healthflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "healthflow",
    about = "HealthFlow: personal health record ingestion, semantic search and grounded chat",
    version,
    long_about = "HealthFlow stores uploaded medical documents, extracts and chunks their text, \
    embeds the chunks, and serves owner-scoped semantic search and document-grounded chat \
    over an authenticated HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/healthflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it against an existing database is safe.
    Init,

    /// Start the HTTP API on `[server] bind`.
    Serve,

    /// Store a local file as a new document.
    Upload {
        /// File to upload.
        path: PathBuf,

        /// Owner subject the document belongs to.
        #[arg(long)]
        owner: String,

        /// Document type (e.g. `lab_report`, `prescription`).
        #[arg(long = "type", default_value = "other")]
        document_type: DocumentType,

        /// MIME type; inferred from the extension when omitted.
        #[arg(long)]
        mime: Option<String>,

        /// Run ingestion immediately instead of leaving the document pending.
        #[arg(long)]
        ingest: bool,
    },

    /// Extract, chunk and embed a document.
    Ingest {
        /// Document UUID.
        id: String,

        #[arg(long)]
        owner: String,

        /// Rebuild a completed or partially completed document from scratch.
        #[arg(long)]
        force: bool,
    },

    /// Re-embed chunks that failed during a previous run.
    Retry {
        /// Document UUID.
        id: String,

        #[arg(long)]
        owner: String,
    },

    /// Semantic search over one owner's documents.
    Search {
        /// The search query string.
        query: String,

        #[arg(long)]
        owner: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity in [0, 1].
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Retrieve a document by its UUID.
    Get {
        /// Document UUID.
        id: String,

        #[arg(long)]
        owner: String,
    },

    /// Issue an access token for a subject.
    ///
    /// Requires the signing key environment variable named by
    /// `[auth] signing_key_env`.
    Token {
        subject: String,
    },

    /// Print a salted PBKDF2 hash of a password as `[[auth.users]]` lines.
    HashPassword {
        password: String,

        /// PBKDF2-HMAC-SHA256 rounds
        #[arg(long, default_value_t = PBKDF2_ITERATIONS)]
        iterations: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::HashPassword {
        password,
        iterations,
    } = &cli.command
    {
        if *iterations == 0 {
            anyhow::bail!("--iterations must be > 0");
        }
        let hashed = hash_password(password, *iterations);
        println!("password_salt = \"{}\"", hashed.salt);
        println!("password_hash = \"{}\"", hashed.hash);
        println!("pbkdf2_iterations = {}", hashed.iterations);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Upload {
            path,
            owner,
            document_type,
            mime,
            ingest,
        } => {
            ingest_cmd::run_upload(&cfg, &owner, &path, document_type, mime.as_deref(), ingest)
                .await?;
        }
        Commands::Ingest { id, owner, force } => {
            ingest_cmd::run_ingest(&cfg, &owner, &id, force).await?;
        }
        Commands::Retry { id, owner } => {
            ingest_cmd::run_retry(&cfg, &owner, &id).await?;
        }
        Commands::Search {
            query,
            owner,
            limit,
            threshold,
        } => {
            search::run_search(&cfg, &owner, &query, limit, threshold).await?;
        }
        Commands::Get { id, owner } => {
            get::run_get(&cfg, &owner, &id).await?;
        }
        Commands::Token { subject } => {
            let identity = HmacIdentity::from_config(&cfg.auth)?;
            println!("{}", identity.issue_access_token(&subject)?);
        }
        Commands::HashPassword { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
