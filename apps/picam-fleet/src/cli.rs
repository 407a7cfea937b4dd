use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "picam-fleet",
    author,
    version,
    about = "Coordinates image acquisition across a fleet of picam agents"
)]
pub struct Cli {
    /// Fleet configuration file (TOML). Built-in defaults apply when omitted.
    #[arg(long, short = 'c', env = "PICAM_FLEET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one acquisition over every configured target.
    Acquire(AcquireArgs),
    /// Print the topic paths a client would use.
    Topics(TopicsArgs),
}

#[derive(Debug, Args)]
pub struct AcquireArgs {
    /// Directory receiving images and metadata sidecars.
    #[arg(long, short = 'o', env = "PICAM_OUTPUT_DIR", default_value = "data")]
    pub output_dir: PathBuf,

    /// File name prefix, also sent as the capture name.
    #[arg(long, short = 'p', env = "PICAM_OUTPUT_PREFIX", default_value = "acquire")]
    pub output_prefix: String,
}

#[derive(Debug, Args)]
pub struct TopicsArgs {
    /// Client identity to resolve paths for.
    pub identity: String,

    #[arg(long, value_enum, default_value_t = Role::Agent)]
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Agent,
    Orchestrator,
}
