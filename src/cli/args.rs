use clap::Parser;

/// Headless directory-replication orchestrator.
#[derive(Parser, Debug)]
#[command(name = "robocurse", version, about = "Chunked, checkpointed directory replication")]
pub struct Cli {
    /// Path to the TOML config file (required unless `--help`).
    #[arg(long)]
    pub config: String,

    /// Run a single named profile instead of every enabled profile.
    #[arg(long, conflicts_with = "all_profiles")]
    pub profile: Option<String>,

    /// Run every enabled profile in config order.
    #[arg(long)]
    pub all_profiles: bool,

    /// Enumerate and audit chunks but launch no copy processes.
    #[arg(long)]
    pub dry_run: bool,

    /// Overrides the config's `max_concurrent_jobs` setting.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Increase verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}
