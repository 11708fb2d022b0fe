//! # Keepsake CLI - Personal file backups
//!
//! Command-line interface for the keepsake backup library.
//!
//! ## Usage
//! ```bash
//! # Create a starter configuration tracking a directory
//! keepsake init ~/documents
//!
//! # Record a backup (shows the change summary first)
//! keepsake backup
//!
//! # Preview what a backup would record
//! keepsake backup --dry-run
//!
//! # List recorded backups
//! keepsake list
//!
//! # Restore a path to a backup
//! keepsake restore ~/documents/notes.txt --backup 3
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use keepsake::{
    backup, restore, BackupId, Catalog, Config, FsSearch, HintStatus, Repository,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Keepsake - personal file backups with deduplicated history
#[derive(Parser)]
#[command(name = "keepsake")]
#[command(version)]
#[command(about = "Personal file backups with deduplicated snapshot history")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "keepsake.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a starter configuration and an empty repository
    Init {
        /// Directory to track
        root: PathBuf,

        /// Directory for the repository and catalog
        #[arg(short, long, default_value = ".keepsake")]
        state_dir: PathBuf,
    },

    /// Record a new backup
    #[command(alias = "bk")]
    Backup {
        /// Show what would change without storing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore a tracked path to a previous backup
    #[command(alias = "rs")]
    Restore {
        /// Tracked path to restore
        path: PathBuf,

        /// Backup id to restore to
        #[arg(short, long)]
        backup: u64,
    },

    /// List recorded backups
    #[command(alias = "ls")]
    List,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("keepsake=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init { root, state_dir } => cmd_init(&cli.config, root, state_dir),
        Commands::Backup { dry_run } => cmd_backup(&cli.config, dry_run),
        Commands::Restore { path, backup } => cmd_restore(&cli.config, path, BackupId(backup)),
        Commands::List => cmd_list(&cli.config),
    }
}

fn cmd_init(config_path: &PathBuf, root: PathBuf, state_dir: PathBuf) -> anyhow::Result<()> {
    if config_path.exists() {
        anyhow::bail!("configuration already exists at {:?}", config_path);
    }
    let root = std::fs::canonicalize(&root)
        .with_context(|| format!("backup root {:?} is not accessible", root))?;

    std::fs::create_dir_all(&state_dir)?;
    let config = Config::starter(root.clone(), &state_dir);
    Repository::create(config.repository.clone())?;
    config.save(config_path)?;

    println!("{} Initialized keepsake", "✓".green());
    println!("  tracking   {}", root.display());
    println!("  repository {}", config.repository.display());
    println!("  config     {}", config_path.display());
    Ok(())
}

fn cmd_backup(config_path: &PathBuf, dry_run: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let repo = Repository::open_or_create(config.repository.clone())?;
    let mut catalog = Catalog::load_or_default(&config.catalog)?;

    let mut feed = FsSearch::new(config.search_roots(), &config.excludes)?;
    let summary = backup::initiate(&mut catalog, &mut feed)?;

    print_changes(&catalog);
    if !summary.has_changes() {
        println!("{}", "Nothing changed since the last backup".dimmed());
    }

    if dry_run {
        println!(
            "{} {} added, {} changed, {} removed (dry run, nothing recorded)",
            "→".yellow(),
            summary.paths_added,
            summary.paths_changed,
            summary.paths_removed
        );
        return Ok(());
    }

    let summary = backup::finish(&mut catalog, &repo, Some(config_path.as_path()))?;
    catalog.save(&config.catalog)?;

    let id = summary
        .backup
        .map(|b| b.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "{} Backup {} recorded: {} added, {} changed, {} removed, {} unchanged",
        "✓".green(),
        id.as_str().bold(),
        summary.paths_added,
        summary.paths_changed,
        summary.paths_removed,
        summary.paths_unchanged
    );
    println!(
        "  {} new objects stored ({})",
        summary.objects_stored,
        keepsake::format_bytes(summary.bytes_stored)
    );
    Ok(())
}

fn cmd_restore(config_path: &PathBuf, path: PathBuf, backup: BackupId) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let repo = Repository::open(config.repository.clone())?;
    let catalog = Catalog::load(&config.catalog)?;

    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };

    let report = restore::restore_path(&catalog, &repo, &path, backup)?;
    println!(
        "{} Restored {} to backup {}",
        "✓".green(),
        path.display(),
        backup.to_string().as_str().bold()
    );
    println!(
        "  {} files, {} directories, {} symlinks, {} removed, {} unchanged ({})",
        report.files_restored,
        report.directories_restored,
        report.symlinks_restored,
        report.entries_removed,
        report.entries_unchanged,
        keepsake::format_bytes(report.bytes_written)
    );
    Ok(())
}

fn cmd_list(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let catalog = Catalog::load(&config.catalog)?;

    if catalog.ledger.completed.is_empty() {
        println!("{}", "No backups recorded yet".dimmed());
        return Ok(());
    }

    for backup in &catalog.ledger.completed {
        let age = backup
            .completed_at
            .map(|at| {
                let delta = chrono::Utc::now() - at;
                match delta.to_std() {
                    Ok(d) => format!(
                        "{} ago",
                        humantime::format_duration(std::time::Duration::from_secs(d.as_secs()))
                    ),
                    Err(_) => "just now".to_string(),
                }
            })
            .unwrap_or_else(|| "in progress".to_string());
        println!(
            "{:>6}  {}  {} references",
            backup.id.to_string().as_str().bold(),
            age,
            backup.ref_count
        );
    }
    println!("  {} paths tracked", catalog.total_paths);
    Ok(())
}

/// Print one line per path with an interesting hint
fn print_changes(catalog: &Catalog) {
    catalog.visit(&mut |node| {
        if !node.hint.is_interesting() {
            return;
        }
        let line = format!("{}  {}", node.path.display(), node.hint);
        match node.hint.status() {
            HintStatus::Added => println!("  {} {}", "+".green(), line.green()),
            HintStatus::Removed => println!("  {} {}", "-".red(), line.red()),
            _ => println!("  {} {}", "~".yellow(), line.yellow()),
        }
    });
}
