// src/cli.rs

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the source git repository
    #[arg(short = 'C', long, global = true, default_value = ".", env = "GRADON_REPO")]
    pub repo: PathBuf,

    /// Config file (default: <repo>/.gradon.toml when present)
    #[arg(long, global = true, env = "GRADON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log more; repeat for debug output
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mirror source commits into the statistics repository
    Replay(ReplayArgs),
    /// Rebuild the resume ledger from the statistics repository's history
    RebuildLedger(LedgerArgs),
}

#[derive(Args, Debug, Default)]
pub struct ReplayArgs {
    /// Revision range to replay, `A..B` or `B` (default: HEAD)
    pub range: Option<String>,

    /// Statistics repository (default: <repo>/.gradon)
    #[arg(short, long, env = "GRADON_DEST")]
    pub dest: Option<PathBuf>,

    /// Ledger file (default: inside the statistics repository's git dir)
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// File extension to analyze; repeatable (default: py)
    #[arg(short = 'e', long = "extension")]
    pub extensions: Vec<String>,

    /// Ignore files whose full path matches this regex; repeatable
    #[arg(short = 'x', long = "exclude")]
    pub exclude: Vec<String>,

    /// Analyzer worker threads (default: number of CPUs)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Analyzer program; gets file content on stdin, prints YAML stats
    #[arg(long, env = "GRADON_ANALYZER")]
    pub analyzer: Option<String>,

    /// Argument for the analyzer; `{path}` is replaced by the file path
    #[arg(long = "analyzer-arg", allow_hyphen_values = true)]
    pub analyzer_args: Vec<String>,

    /// Per-file analyzer timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Debug, Default)]
pub struct LedgerArgs {
    /// Statistics repository (default: <repo>/.gradon)
    #[arg(short, long, env = "GRADON_DEST")]
    pub dest: Option<PathBuf>,

    /// Ledger file (default: inside the statistics repository's git dir)
    #[arg(long)]
    pub ledger: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_replay_flags() {
        let cli = Cli::try_parse_from([
            "git-gradon",
            "-C",
            "/src",
            "-vv",
            "replay",
            "v1..v2",
            "-x",
            "^vendor/",
            "-e",
            "py",
            "-j",
            "3",
            "--analyzer",
            "radon-stats",
            "--analyzer-arg",
            "--path={path}",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.repo, PathBuf::from("/src"));
        let Command::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.range.as_deref(), Some("v1..v2"));
        assert_eq!(args.exclude, ["^vendor/"]);
        assert_eq!(args.jobs, Some(3));
        assert_eq!(args.analyzer_args, ["--path={path}"]);
    }
}
