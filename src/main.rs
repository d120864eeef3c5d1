//! # refindex CLI (`refx`)
//!
//! Command-line front end for the reference catalog.
//!
//! ## Usage
//!
//! ```bash
//! refx --config ./config/refx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `refx init` | Create the SQLite database and run schema migrations |
//! | `refx add <url>` | Fetch a page and store it as a reference |
//! | `refx reindex <id>` | Re-fetch and re-index a reference |
//! | `refx get <id>` | Print a reference with its keywords |
//! | `refx list` | List references, optionally by keyword intersection |
//! | `refx contents <id>` | Print the raw contents of a reference |
//! | `refx delete <id>` | Delete a reference |
//! | `refx keywords [<id>]` | List all keywords, or those of one reference |
//! | `refx counts` | Keyword frequencies, optionally over an intersection |
//! | `refx serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! refx init
//! refx add https://example.com/cats --wait
//! refx list --keyword cats --keyword dogs
//! refx counts --tag cats
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use refindex::config;
use refindex::db;
use refindex::migrate;
use refindex::references::ReferenceStore;
use refindex::server;

/// refindex: ingest web pages, extract titles, summaries and keywords in
/// the background, and query the catalog by keyword intersection.
#[derive(Parser)]
#[command(name = "refx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/refx.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Fetch a URL and add it as a reference.
    ///
    /// An already-known URL returns the existing reference.
    Add {
        url: String,

        /// Wait for background indexing to finish before exiting.
        #[arg(long)]
        wait: bool,
    },

    /// Re-fetch a reference's contents and index it again.
    Reindex {
        id: String,

        /// Wait for background indexing to finish before exiting.
        #[arg(long)]
        wait: bool,
    },

    /// Print a reference with its keywords.
    Get {
        id: String,

        /// Include the raw contents.
        #[arg(long)]
        contents: bool,
    },

    /// List references, newest first.
    List {
        /// Only references carrying this keyword. Repeat to intersect.
        #[arg(long = "keyword", short = 'k')]
        keywords: Vec<String>,

        /// Include the raw contents.
        #[arg(long)]
        contents: bool,
    },

    /// Print the raw contents of a reference.
    Contents { id: String },

    /// Delete a reference, its keyword associations and passages.
    Delete { id: String },

    /// List every keyword, or the keywords of one reference.
    Keywords { id: Option<String> },

    /// Keyword frequencies, highest first.
    Counts {
        /// Count only over references carrying this tag. Repeat to intersect.
        #[arg(long = "tag", short = 't')]
        tags: Vec<String>,
    },

    /// Start the HTTP API server on `[server].bind`.
    Serve,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg).await?;
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }
    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let refs = ReferenceStore::open(&cfg).await?;

    match cli.command {
        Commands::Init | Commands::Serve => {}
        Commands::Add { url, wait } => {
            let added = refs.add("url", &url).await?;
            if wait {
                refs.wait_idle().await;
                match refs.get(&added.id, false, true).await? {
                    Some(r) => print_json(&r)?,
                    None => print_json(&added)?,
                }
            } else {
                print_json(&added)?;
                if !added.indexed {
                    eprintln!("Indexing was scheduled but runs only while refx is alive; use --wait to index now.");
                }
            }
        }
        Commands::Reindex { id, wait } => {
            let reference = refs.reindex(&id).await?;
            if wait {
                refs.wait_idle().await;
                match refs.get(&id, false, true).await? {
                    Some(r) => print_json(&r)?,
                    None => print_json(&reference)?,
                }
            } else {
                print_json(&reference)?;
            }
        }
        Commands::Get { id, contents } => match refs.get(&id, contents, true).await? {
            Some(r) => print_json(&r)?,
            None => anyhow::bail!("reference not found: {}", id),
        },
        Commands::List { keywords, contents } => {
            let list = refs.list(contents, &keywords).await?;
            print_json(&list)?;
        }
        Commands::Contents { id } => match refs.get_contents(&id).await? {
            Some(text) => println!("{}", text),
            None => anyhow::bail!("reference not found: {}", id),
        },
        Commands::Delete { id } => {
            refs.delete(&id).await?;
            println!("Deleted {}", id);
        }
        Commands::Keywords { id } => {
            let keywords = match id {
                Some(id) => refs.keywords_for(&id).await?,
                None => refs.keywords().list_all().await?,
            };
            for k in keywords {
                println!("{}", k);
            }
        }
        Commands::Counts { tags } => {
            for (keyword, count) in refs.keyword_counts(&tags).await? {
                println!("{:>6}  {}", count, keyword);
            }
        }
    }

    Ok(())
}
