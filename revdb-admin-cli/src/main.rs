//! RevDB Administration CLI

mod load;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revdb_core::{ChangesOptions, Database, DatabaseConfig, RevisionId, map_from_json};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "revdb-admin")]
#[command(author = "RevDB Contributors")]
#[command(version = "0.1.0")]
#[command(about = "RevDB database administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a database directory and write its default config
    Init {
        path: PathBuf,
        #[arg(long)]
        max_rev_tree_depth: Option<u32>,
    },

    /// Save a document revision from a JSON object
    Put {
        #[arg(short, long)]
        db: PathBuf,
        id: String,
        /// JSON object with the document properties
        json: String,
        /// Revision being replaced
        #[arg(short, long)]
        rev: Option<String>,
        #[arg(long)]
        delete: bool,
    },

    /// Print the current revision of a document, or a specific one
    Get {
        #[arg(short, long)]
        db: PathBuf,
        id: String,
        #[arg(short, long)]
        rev: Option<String>,
        /// Also print conflicting revisions
        #[arg(long)]
        conflicts: bool,
    },

    /// Print the retained history of a document's current revision
    History {
        #[arg(short, long)]
        db: PathBuf,
        id: String,
    },

    /// Print the change feed
    Changes {
        #[arg(short, long)]
        db: PathBuf,
        #[arg(short, long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        conflicts: bool,
        #[arg(long)]
        docs: bool,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Prune revision trees and collect unreferenced attachments
    Compact {
        #[arg(short, long)]
        db: PathBuf,
        /// Set the maximum revision tree depth before compacting
        #[arg(long)]
        max_rev_tree_depth: Option<u32>,
    },

    /// Print database statistics
    Info {
        #[arg(short, long)]
        db: PathBuf,
    },

    /// Load newline-delimited JSON documents in one transaction
    Load {
        #[arg(short, long)]
        db: PathBuf,
        /// Input file, or `-` for stdin
        #[arg(short, long)]
        file: String,
    },
}

fn open(path: &Path) -> Result<Database> {
    let config = DatabaseConfig::load(path).with_context(|| format!("Failed to load config from {:?}", path))?;
    Database::open(config).with_context(|| format!("Failed to open database at {:?}", path))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init { path, max_rev_tree_depth } => {
            println!("Initializing database at {:?}", path);
            let mut config = DatabaseConfig::at(&path);
            if let Some(depth) = max_rev_tree_depth {
                config.max_rev_tree_depth = depth;
            }
            config.save(&path)?;
            let db = Database::open(config)?;
            println!("Database '{}' initialized successfully (UUID: {})", db.name(), db.uuid());
            db.close()?;
        }

        Commands::Put { db, id, json, rev, delete } => {
            let db = open(&db)?;
            let json: serde_json::Value = serde_json::from_str(&json).context("Document is not valid JSON")?;
            let properties = map_from_json(json)?;
            let parent = rev.as_deref().map(RevisionId::parse).transpose()?;
            let saved = db
                .put_properties(&id, parent.as_ref(), properties, delete)
                .with_context(|| format!("Failed to save '{}'", id))?;
            println!("{} {} (sequence {})", saved.doc_id(), saved.rev_id(), saved.sequence().unwrap_or_default());
            db.close()?;
        }

        Commands::Get { db, id, rev, conflicts } => {
            let db = open(&db)?;
            let revision = match rev {
                Some(rev) => db.get_revision(&id, &RevisionId::parse(&rev)?)?,
                None => db
                    .current_revision(&id)?
                    .with_context(|| format!("Document '{}' not found", id))?,
            };
            print_json(&output::revision_json(&revision))?;
            if conflicts {
                for conflict in db.conflicting_revisions(&id)?.iter().skip(1) {
                    print_json(&output::revision_json(conflict))?;
                }
            }
            db.close()?;
        }

        Commands::History { db, id } => {
            let db = open(&db)?;
            let current = db
                .current_revision(&id)?
                .with_context(|| format!("Document '{}' not found", id))?;
            for revision in db.revision_history(&id, current.rev_id())? {
                println!("{}", output::change_line(&revision));
            }
            db.close()?;
        }

        Commands::Changes { db, since, conflicts, docs, limit } => {
            let db = open(&db)?;
            let options = ChangesOptions {
                include_conflicts: conflicts,
                include_docs: docs,
                limit,
            };
            for revision in db.changes_since(since, &options, None, None)? {
                if docs {
                    println!("{}", serde_json::to_string(&output::revision_json(&revision))?);
                } else {
                    println!("{}", output::change_line(&revision));
                }
            }
            db.close()?;
        }

        Commands::Compact { db, max_rev_tree_depth } => {
            let db = open(&db)?;
            if let Some(depth) = max_rev_tree_depth {
                db.set_max_rev_tree_depth(depth)?;
            }
            let stats = db.compact()?;
            println!("Compaction complete!");
            println!("  Documents pruned: {}", stats.documents_pruned);
            println!("  Revisions pruned: {}", stats.revisions_pruned);
            println!("  Attachments removed: {}", stats.attachments_removed);
            db.close()?;
        }

        Commands::Info { db } => {
            let db = open(&db)?;
            println!("Database: {}", db.name());
            println!("  UUID: {}", db.uuid());
            println!("  Documents: {}", db.document_count()?);
            println!("  Last sequence: {}", db.last_sequence()?);
            println!("  Attachments: {}", db.attachment_count()?);
            let depth = db.max_rev_tree_depth()?;
            if depth == u32::MAX {
                println!("  Max revision tree depth: unlimited");
            } else {
                println!("  Max revision tree depth: {}", depth);
            }
            db.close()?;
        }

        Commands::Load { db, file } => {
            let db = open(&db)?;
            println!("Loading documents from {}", file);
            if file == "-" {
                let reader = BufReader::new(std::io::stdin());
                load::load_documents(db.clone(), reader).await?;
            } else {
                let file_obj = File::open(&file).with_context(|| format!("Failed to open {}", file))?;
                load::load_documents(db.clone(), BufReader::new(file_obj)).await?;
            }
            db.close()?;
        }
    }

    Ok(())
}
