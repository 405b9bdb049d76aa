//! # Content Finder CLI (`finder`)
//!
//! ## Usage
//!
//! ```bash
//! finder --config ./config/finder.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `finder init` | Create the SQLite database and run schema migrations |
//! | `finder ingest <file>` | Ingest a JSON or JSON-lines batch of metadata records |
//! | `finder search "<query>"` | Hybrid lexical + semantic search |
//! | `finder ask "<query>"` | One conversational turn with a generated answer |
//! | `finder similar <type> <id>` | Objects nearest to a stored object's embedding |
//! | `finder embed pending` | Backfill missing or stale embeddings |
//! | `finder embed rebuild` | Delete and regenerate all embeddings |
//! | `finder stats` | Index statistics |
//! | `finder serve` | Start the HTTP JSON API |
//!
//! ## Examples
//!
//! ```bash
//! finder init
//! finder ingest ./exports/site-s1.jsonl --site s1
//! finder search "sales dashboard" --type workbook --explain
//! finder ask "where is quarterly revenue?" --history ./session.json
//! ```
//!
//! Logs go to stderr and honour `RUST_LOG`; `--verbose` raises the default
//! level to `debug`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use content_finder::models::{ObjectType, SearchFilters};
use content_finder::{config, db, embed_cmd, ingest, migrate, search, server, stats};

/// Content Finder: hybrid retrieval over dashboard, workbook and datasource
/// metadata.
#[derive(Parser)]
#[command(
    name = "finder",
    about = "Content Finder: hybrid lexical + semantic search over BI content metadata",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/finder.toml")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Ingest a batch of raw metadata records.
    ///
    /// Accepts a JSON array or JSON lines. Invalid records are skipped;
    /// objects of the batch's sites missing from the batch are marked
    /// inactive.
    Ingest {
        /// Path to the records file.
        file: PathBuf,

        /// Reject records for any other site.
        #[arg(long)]
        site: Option<String>,

        /// Report what would change without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Search indexed objects.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Only objects of this type (view, workbook, datasource).
        #[arg(long = "type")]
        object_type: Option<ObjectType>,

        /// Only objects whose project name contains this (case-insensitive).
        #[arg(long)]
        project: Option<String>,

        /// Only objects of this site.
        #[arg(long)]
        site: Option<String>,

        /// Print per-path scores and candidate counts.
        #[arg(long)]
        explain: bool,
    },

    /// Ask a question and get an answer with results.
    Ask {
        query: String,

        /// JSON file holding the conversation so far; updated in place.
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Find objects similar to a stored one.
    Similar {
        object_type: ObjectType,
        object_id: String,

        /// Site of the object; required when the id exists on several sites.
        #[arg(long)]
        site: Option<String>,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP JSON API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed objects whose vector is missing, stale or from another model.
    Pending {
        /// Maximum number of objects to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    Rebuild,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            site,
            dry_run,
        } => {
            ingest::run_ingest(&cfg, &file, site, dry_run).await?;
        }
        Commands::Search {
            query,
            top_k,
            object_type,
            project,
            site,
            explain,
        } => {
            let filters = SearchFilters {
                site_id: site,
                object_type,
                project_name: project,
            };
            search::run_search(&cfg, &query, filters, top_k, explain).await?;
        }
        Commands::Ask { query, history } => {
            search::run_ask(&cfg, &query, history.as_deref()).await?;
        }
        Commands::Similar {
            object_type,
            object_id,
            site,
            limit,
        } => {
            search::run_similar(&cfg, object_type, &object_id, site, limit).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                embed_cmd::run_embed_pending(&cfg, limit, dry_run).await?;
            }
            EmbedAction::Rebuild => {
                embed_cmd::run_embed_rebuild(&cfg).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
