mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use photocache_core::config::Config;
use photocache_core::Library;
use tracing_subscriber::EnvFilter;

use commands::optimize::Mode;

/// photocache: deduplicated, size-bounded media cache
#[derive(Parser)]
#[command(name = "photocache", version, about)]
struct Cli {
    /// Path to the config file [default: ~/.photocache/config.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage library folders
    Folders {
        #[command(subcommand)]
        action: FoldersAction,
    },
    /// Scan a folder and record its media files
    Scan {
        folder: PathBuf,
    },
    /// Optimize every media file in a folder, showing progress
    Optimize {
        folder: PathBuf,
        /// Only process files that have no optimized artifact yet
        #[arg(long, conflicts_with = "regenerate")]
        retry_failed: bool,
        /// Drop the folder's artifacts and optimize everything again
        #[arg(long)]
        regenerate: bool,
    },
    /// List optimization tasks
    Tasks,
    /// Pause a folder's optimization task
    Pause { folder: PathBuf },
    /// Resume a paused task, or restart the remaining files of a stopped one
    Resume { folder: PathBuf },
    /// Stop a folder's optimization task
    Stop { folder: PathBuf },
    /// Delete a folder's task record
    Remove { folder: PathBuf },
    /// Show cache usage
    Stats,
    /// Delete artifacts no library file references any more
    Cleanup,
    /// Delete the artifacts of one folder
    Clear { folder: PathBuf },
    /// Import media from a camera card or another directory
    Import {
        #[command(subcommand)]
        action: ImportAction,
    },
    /// Watch registered folders and removable media; print events until Ctrl-C
    Watch,
}

#[derive(Subcommand)]
enum FoldersAction {
    /// Register a folder
    Add { path: PathBuf },
    /// Unregister a folder and delete the artifacts only it uses
    Rm { path: PathBuf },
    /// List registered folders
    Ls,
}

#[derive(Subcommand)]
enum ImportAction {
    /// List the media files in a source and flag the ones already in the library
    Scan { source: PathBuf },
    /// Copy new media files from a source into a dated layout under `dest`
    Copy {
        source: PathBuf,
        dest: PathBuf,
        /// Also copy files the library already has
        #[arg(long)]
        include_duplicates: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("photocache=info,photocache_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load_or_init(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let lib = Library::open(config)?;

    match cli.command {
        Commands::Folders { action } => match action {
            FoldersAction::Add { path } => commands::folders::add(&lib, path)?,
            FoldersAction::Rm { path } => commands::folders::rm(&lib, path).await?,
            FoldersAction::Ls => commands::folders::ls(&lib)?,
        },
        Commands::Scan { folder } => commands::folders::scan(&lib, folder).await?,
        Commands::Optimize {
            folder,
            retry_failed,
            regenerate,
        } => {
            let mode = if retry_failed {
                Mode::RetryFailed
            } else if regenerate {
                Mode::Regenerate
            } else {
                Mode::All
            };
            commands::optimize::run(&lib, folder, mode).await?
        }
        Commands::Tasks => commands::tasks::ls(&lib)?,
        Commands::Pause { folder } => commands::tasks::pause(&lib, folder)?,
        Commands::Resume { folder } => commands::tasks::resume(&lib, folder).await?,
        Commands::Stop { folder } => commands::tasks::stop(&lib, folder)?,
        Commands::Remove { folder } => commands::tasks::remove(&lib, folder)?,
        Commands::Stats => commands::cache::stats(&lib)?,
        Commands::Cleanup => commands::cache::cleanup(&lib).await?,
        Commands::Clear { folder } => commands::cache::clear(&lib, folder).await?,
        Commands::Import { action } => match action {
            ImportAction::Scan { source } => commands::import::scan(&lib, source).await?,
            ImportAction::Copy {
                source,
                dest,
                include_duplicates,
            } => commands::import::copy(&lib, source, dest, include_duplicates).await?,
        },
        Commands::Watch => commands::watch::run(&lib).await?,
    }

    Ok(())
}
