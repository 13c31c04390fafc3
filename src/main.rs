//! # Knowledge CLI (`know`)
//!
//! The `know` binary drives a [`Datastore`] from the command line: manage
//! datasets, ingest files and directories, retrieve chunks, and move
//! collections between stores.
//!
//! ## Usage
//!
//! ```bash
//! know --config ./knowledge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `know init` | Write a default config and create the storage |
//! | `know dataset create\|list\|get\|delete` | Manage datasets |
//! | `know ingest <paths…> -d <dataset>` | Ingest files and directories |
//! | `know retrieve "<query>" -d <dataset>` | Retrieve relevant chunks |
//! | `know delete-document` / `delete-file` | Remove chunks or whole files |
//! | `know export` / `import` | Dump or load collections as JSON |
//! | `know completions <shell>` | Print shell completions |
//!
//! Logging goes to stderr; `KNOW_LOG` takes an `EnvFilter` directive and
//! overrides `-v` / `-q`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use knowledge::config::{self, DEFAULT_CONFIG};
use knowledge::datastore::Datastore;
use knowledge::ingest::IngestOpts;
use knowledge::retrieve::RetrieveOpts;
use knowledge::walker;
use knowledge_core::models::{keys, Dataset, Metadata};
use knowledge_core::Error;

/// Knowledge: ingest documents into datasets and retrieve them by
/// semantic similarity, keywords and pluggable retrieval strategies.
#[derive(Parser)]
#[command(name = "know", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./knowledge.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config (if missing) and create the storage.
    Init,

    /// Manage datasets.
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Ingest files or directories into a dataset.
    ///
    /// Directories are walked recursively. `.git`, `target` and
    /// `node_modules` are always skipped.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Target dataset.
        #[arg(short, long)]
        dataset: String,

        /// Only ingest files matching these globs (relative to each directory).
        #[arg(long)]
        include: Vec<String>,

        /// Skip files matching these globs.
        #[arg(long)]
        exclude: Vec<String>,

        /// Extra chunk metadata as `key=value` pairs.
        #[arg(long = "metadata", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },

    /// Retrieve chunks relevant to a query.
    Retrieve {
        query: String,

        /// Datasets to search (repeatable).
        #[arg(short, long = "dataset", required = true)]
        datasets: Vec<String>,

        /// Keyword filter (repeatable). Prefix with `-` to exclude.
        #[arg(short, long = "keyword", allow_hyphen_values = true)]
        keywords: Vec<String>,

        /// Number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete a single chunk.
    DeleteDocument {
        #[arg(short, long)]
        dataset: String,
        id: String,
    },

    /// Delete a file and all of its chunks.
    DeleteFile {
        #[arg(short, long)]
        dataset: String,
        file_id: String,
    },

    /// Export collections to a JSON file.
    Export {
        path: PathBuf,
        /// Collections to export (default: all).
        #[arg(short, long = "collection")]
        collections: Vec<String>,
    },

    /// Import collections from a JSON file.
    Import {
        path: PathBuf,
        /// Collections to import (default: all in the file).
        #[arg(short, long = "collection")]
        collections: Vec<String>,
    },

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DatasetAction {
    Create { id: String },
    List,
    Get { id: String },
    Delete { id: String },
}

/// Parse a `key=value` pair for `--metadata` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("KNOW_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "know", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init => {
            write_default_config(&cli.config)?;
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;
    let store = Datastore::open(&cfg).await?;

    let result = run(&store, cli.command).await;
    store.close().await?;
    result
}

async fn run(store: &Datastore, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Storage initialized (provider: {}, model: {}).",
                store.provider().name(),
                store.provider().embedding_model_name()
            );
        }
        Commands::Dataset { action } => match action {
            DatasetAction::Create { id } => {
                store.create_dataset(&Dataset::new(id.as_str())).await?;
                println!("Created dataset {}", id);
            }
            DatasetAction::List => {
                for ds in store.list_datasets().await? {
                    println!(
                        "{}\t{}",
                        ds.id,
                        ds.embedding_model_name().unwrap_or("-")
                    );
                }
            }
            DatasetAction::Get { id } => match store.get_dataset(&id).await? {
                Some(ds) => println!("{}", serde_json::to_string_pretty(&ds)?),
                None => return Err(Error::DatasetNotFound(id).into()),
            },
            DatasetAction::Delete { id } => {
                store.delete_dataset(&id).await?;
                println!("Deleted dataset {}", id);
            }
        },
        Commands::Ingest {
            paths,
            dataset,
            include,
            exclude,
            metadata,
        } => ingest(store, &paths, &dataset, &include, &exclude, metadata).await?,
        Commands::Retrieve {
            query,
            datasets,
            keywords,
            top_k,
            json,
        } => {
            let response = store
                .retrieve(
                    &query,
                    &datasets,
                    RetrieveOpts {
                        top_k,
                        keywords,
                        ..Default::default()
                    },
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                for qr in &response.responses {
                    for (rank, doc) in qr.result_documents.iter().enumerate() {
                        println!(
                            "{}. [{:.3}] {} {} #{}",
                            rank + 1,
                            doc.similarity_score,
                            doc.metadata_str(keys::DATASET_ID).unwrap_or_default(),
                            doc.filename().unwrap_or("-"),
                            doc.doc_index().unwrap_or_default(),
                        );
                        println!("   {}", snippet(&doc.content, 200));
                    }
                }
            }
        }
        Commands::DeleteDocument { dataset, id } => {
            store.delete_document(&dataset, &id).await?;
            println!("Deleted document {}", id);
        }
        Commands::DeleteFile { dataset, file_id } => {
            if store.find_file(&dataset, &file_id).await?.is_none() {
                bail!("file {} not found in dataset {}", file_id, dataset);
            }
            store.delete_file(&dataset, &file_id).await?;
            println!("Deleted file {}", file_id);
        }
        Commands::Export { path, collections } => {
            store.export_collections(&path, &collections).await?;
            println!("Exported to {}", path.display());
        }
        Commands::Import { path, collections } => {
            store.import_collections(&path, &collections).await?;
            println!("Imported from {}", path.display());
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

async fn ingest(
    store: &Datastore,
    paths: &[PathBuf],
    dataset: &str,
    include: &[String],
    exclude: &[String],
    metadata: Vec<(String, String)>,
) -> Result<()> {
    let files = walker::collect_files(paths, include, exclude)?;
    let extra_metadata: Metadata = metadata
        .into_iter()
        .map(|(k, v)| (k, v.into()))
        .collect();

    let (mut stored, mut skipped, mut unsupported, mut failed, mut chunks) = (0, 0, 0, 0, 0);
    for path in &files {
        let opts = IngestOpts {
            extra_metadata: extra_metadata.clone(),
            ..Default::default()
        };
        match store.ingest_path(dataset, path, opts).await {
            Ok(ids) if ids.is_empty() => skipped += 1,
            Ok(ids) => {
                stored += 1;
                chunks += ids.len();
            }
            Err(Error::UnsupportedFileType { .. }) => unsupported += 1,
            Err(e @ Error::DatasetNotFound(_)) => return Err(e.into()),
            Err(e) => {
                failed += 1;
                tracing::error!(path = %path.display(), error = %e, "ingestion failed");
            }
        }
    }

    println!("ingest {}", dataset);
    println!("  files found: {}", files.len());
    println!("  stored: {} ({} chunks)", stored, chunks);
    println!("  skipped: {}", skipped);
    println!("  unsupported: {}", unsupported);
    if failed > 0 {
        bail!("{} file(s) failed to ingest", failed);
    }
    Ok(())
}

fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
