use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Settings YAML file. Every key is optional.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides the settings file and SOURCEWATCH_DATA_DIR).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run every due source once.
    Run(RunArgs),
    /// Run due sources repeatedly until interrupted.
    Watch(WatchArgs),
    /// Print the per-source health summary.
    Health(HealthArgs),
    Sources {
        #[command(subcommand)]
        command: SourcesCommand,
    },
    /// Approve or reject a captured document.
    Review(ReviewArgs),
    /// Summarize documents that have no digest yet.
    Digest(DigestArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Print the run report as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Seconds between ticks (defaults to `watch_interval_secs`).
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Stop after this many ticks.
    #[arg(long)]
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Also write the summary as JSON to this path.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,

    /// Number of erroring sources listed.
    #[arg(long)]
    pub top: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum SourcesCommand {
    /// Upsert sources from a YAML file, keyed by root URL.
    Import(ImportArgs),
    List(ListArgs),
    /// Reactivate a source and clear its error state.
    Enable(EnableArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Sources YAML file (`sources: [...]`).
    pub file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct EnableArgs {
    pub source_id: String,
}

#[derive(Debug, Args)]
pub struct ReviewArgs {
    #[arg(long)]
    pub source: String,

    #[arg(long)]
    pub document: String,

    #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
    pub approve: bool,

    #[arg(long)]
    pub reject: bool,

    /// Recorded as `human:<reviewer>` in the audit log.
    #[arg(long)]
    pub reviewer: String,
}

#[derive(Debug, Args)]
pub struct DigestArgs {
    #[arg(long)]
    pub source: String,

    /// Only this document.
    #[arg(long)]
    pub document: Option<String>,

    /// Maximum documents summarized in one call.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Re-summarize documents that already have a digest.
    #[arg(long)]
    pub force: bool,
}
