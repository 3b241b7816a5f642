use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use humansize::{format_size, DECIMAL};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use twinsync::config::SyncConfig;
use twinsync::sync::{ChangeType, ConflictStrategy, SessionReport, SyncEvent, SyncOptions, SyncSession};

/// Keep two directory trees in sync.
#[derive(Debug, Parser)]
#[command(name = "twinsync", version, about)]
struct Cli {
    /// Source replica root
    #[arg(short, long)]
    from: PathBuf,

    /// Destination replica root
    #[arg(short, long)]
    to: PathBuf,

    /// Also propagate destination changes back to the source
    #[arg(short, long)]
    bothways: bool,

    /// Only synchronize paths matching this glob
    #[arg(short, long)]
    include: Option<String>,

    /// Skip paths matching this glob
    #[arg(short = 'x', long)]
    exclude: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Conflict strategy, overrides the config file
    #[arg(long)]
    strategy: Option<ConflictStrategy>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::load_default()?,
    };
    if let Some(strategy) = cli.strategy {
        config.conflict_strategy = strategy;
    }
    init_logging(&config, cli.verbose);

    let mut options = SyncOptions::new(&cli.from, &cli.to).bothways(cli.bothways);
    options.include = cli.include.clone();
    options.exclude = cli.exclude.clone();

    let session = SyncSession::new(options, config).context("Invalid sync options")?;
    session.validate().context("Cannot start synchronization")?;

    // Held for the whole run; dropping it unsubscribes
    let _console = session.bus().subscribe(print_event);
    let cancel = session.cancel_flag();

    let worker = tokio::task::spawn_blocking(move || session.run());
    tokio::pin!(worker);

    let outcome = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Cancelling...".yellow());
            cancel.cancel();
            worker.await
        }
    };

    let report = outcome
        .context("Sync worker panicked")?
        .with_context(|| format!("Failed to synchronize {} -> {}", cli.from.display(), cli.to.display()))?;
    print_summary(&report);
    Ok(())
}

fn init_logging(config: &SyncConfig, verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match (&config.log_filter, verbose) {
            (Some(directive), 0) => EnvFilter::try_new(directive),
            _ => EnvFilter::try_new(fallback),
        })
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Applied(applied) => {
            let old = applied.old_path.as_deref().unwrap_or_default();
            let new = applied.new_path.as_deref().unwrap_or_default();
            match applied.change_type {
                ChangeType::Create => println!("{} {}", "File created:".green(), new),
                ChangeType::Update => println!("{} {}", "Overwrote file:".cyan(), new),
                ChangeType::Delete => println!("{} {}", "Deleted File:".red(), old),
                ChangeType::Rename => println!("{} {} to {}", "Renamed file:".blue(), old, new),
            }
        }
        SyncEvent::Skipped(skipped) => {
            let detail = skipped
                .underlying_error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            eprintln!(
                "{} {} [{}: {}]{}",
                "Error! Skipped file:".red().bold(),
                skipped.path,
                skipped.change_type,
                skipped.reason,
                detail
            );
        }
    }
}

fn print_summary(report: &SessionReport) {
    let stats = &report.stats;
    println!();
    println!(
        "{} {} created, {} updated, {} renamed, {} deleted, {} adopted",
        "Done.".green().bold(),
        stats.created,
        stats.updated,
        stats.renamed,
        stats.deleted,
        stats.adopted
    );
    println!(
        "      {} copied in {} ms",
        format_size(stats.bytes_copied, DECIMAL),
        stats.duration_ms
    );
    if stats.skipped > 0 || !report.detection_skips.is_empty() {
        println!(
            "      {} skipped during apply, {} unreadable during scan",
            stats.skipped.to_string().yellow(),
            report.detection_skips.len().to_string().yellow()
        );
    }
    let conflicts = report.conflicts();
    if conflicts > 0 {
        println!(
            "      {} conflicts resolved, losing versions kept under .twinsync/recycle",
            conflicts.to_string().yellow()
        );
    }
}
