// src/main.rs

mod cli;

use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, TimeZone};
use clap::Parser;
use cli::{Cli, Command, LedgerArgs, ReplayArgs};
use git_gradon::config::{FileConfig, TrackingRules, DEFAULT_TIMEOUT_SECS};
use git_gradon::ledger::LEDGER_FILE_NAME;
use git_gradon::model::Identity;
use git_gradon::{CommandAnalyzer, CommitMirror, FileLedger, Replay, ReplayError, ReplayOptions, SourceHistory};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn format_time(identity: &Identity) -> String {
    FixedOffset::east_opt(identity.offset_minutes * 60)
        .and_then(|tz| tz.timestamp_opt(identity.time, 0).single())
        .map(|t| t.to_rfc2822())
        .unwrap_or_else(|| identity.time.to_string())
}

fn default_destination(source: &SourceHistory) -> PathBuf {
    source
        .workdir()
        .unwrap_or_else(|| source.repo().path())
        .join(".gradon")
}

fn ledger_path(mirror: &CommitMirror, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| mirror.repo().path().join(LEDGER_FILE_NAME))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Replay(args) => replay(&cli.repo, cli.config.as_deref(), args),
        Command::RebuildLedger(args) => rebuild_ledger(&cli.repo, cli.config.as_deref(), args),
    }
}

fn replay(repo: &Path, config: Option<&Path>, args: ReplayArgs) -> Result<()> {
    let start_time = Instant::now();
    let source = SourceHistory::open(repo)
        .with_context(|| format!("opening source repository {}", repo.display()))?;
    let config = FileConfig::discover(config, source.workdir())?;

    let extensions = if args.extensions.is_empty() {
        config.extensions.unwrap_or_else(|| vec!["py".to_string()])
    } else {
        args.extensions
    };
    let exclude = if args.exclude.is_empty() {
        config.exclude.unwrap_or_default()
    } else {
        args.exclude
    };
    let rules = TrackingRules::new(&extensions, &exclude)?;

    let analyzer_config = config.analyzer;
    let program = match (args.analyzer, analyzer_config.as_ref()) {
        (Some(program), _) => program,
        (None, Some(cfg)) => cfg.command.clone(),
        (None, None) => bail!("no analyzer configured; pass --analyzer or set [analyzer] in the config file"),
    };
    let analyzer_args = if args.analyzer_args.is_empty() {
        analyzer_config.as_ref().map(|c| c.args.clone()).unwrap_or_default()
    } else {
        args.analyzer_args
    };
    let timeout = args
        .timeout
        .or(analyzer_config.as_ref().map(|c| c.timeout_secs))
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let analyzer = CommandAnalyzer::new(program, analyzer_args, Duration::from_secs(timeout));

    let destination = args
        .dest
        .or(config.destination)
        .unwrap_or_else(|| default_destination(&source));
    let mirror = CommitMirror::open_or_init(&destination)
        .with_context(|| format!("opening destination {}", destination.display()))?;
    let ledger_file = ledger_path(&mirror, args.ledger.or(config.ledger));
    let mut ledger = FileLedger::open(&ledger_file)
        .with_context(|| format!("opening ledger {}", ledger_file.display()))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    let options = ReplayOptions {
        range: args.range.or(config.range),
        rules,
        jobs: args.jobs.or(config.jobs).unwrap_or(0),
    };
    let run = Replay::start(&source, &mirror, &mut ledger, &analyzer, options)?.with_cancel(cancel);
    let total = run.total();
    info!("Replaying {} commits into {}", total, destination.display());

    let bar = if args.no_progress {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total as u64)
    };
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message("Mirroring commits");

    let mut mirrored = 0usize;
    let mut unanalyzable = 0usize;
    let mut last_time = None;
    for outcome in run {
        match outcome {
            Ok(commit) => {
                mirrored += 1;
                unanalyzable += commit.failures.len();
                for failure in &commit.failures {
                    bar.suspend(|| warn!("{} at {}: {}", failure.path, commit.source.id, failure.error));
                }
                last_time = Some(format_time(&commit.source.committer));
                bar.inc(1);
            }
            Err(ReplayError::Interrupted) => {
                bar.abandon_with_message("Interrupted");
                println!("Interrupted after {} commits; run again to resume.", mirrored);
                return Ok(());
            }
            Err(e) => {
                bar.abandon_with_message("Failed");
                error!("Replay stopped ({}): {}", e.kind(), e);
                return Err(e).context("replay failed; rerun to resume from the last mirrored commit");
            }
        }
    }
    bar.finish_and_clear();

    println!(
        "Mirrored {} commits in {:.2?} ({} files could not be analyzed).",
        mirrored,
        start_time.elapsed(),
        unanalyzable
    );
    if let Some(time) = last_time {
        println!("Statistics are current as of {}.", time);
    }
    Ok(())
}

fn rebuild_ledger(repo: &Path, config: Option<&Path>, args: LedgerArgs) -> Result<()> {
    let source = SourceHistory::open(repo)
        .with_context(|| format!("opening source repository {}", repo.display()))?;
    let config = FileConfig::discover(config, source.workdir())?;
    let destination = args
        .dest
        .or(config.destination)
        .unwrap_or_else(|| default_destination(&source));
    let mirror = CommitMirror::open_or_init(&destination)
        .with_context(|| format!("opening destination {}", destination.display()))?;
    let entries = mirror.ledger_entries()?;
    let ledger_file = ledger_path(&mirror, args.ledger.or(config.ledger));
    FileLedger::rewrite(&ledger_file, &entries)
        .with_context(|| format!("writing ledger {}", ledger_file.display()))?;
    println!("Rebuilt {} with {} entries.", ledger_file.display(), entries.len());
    Ok(())
}
