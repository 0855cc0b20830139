use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "stackwarden",
    version,
    about = "Provision and supervise a local service stack"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific config file
    #[arg(short = 'f', long = "file", global = true)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// First-run setup: install tools and dependencies, then start everything
    Install {
        /// Leave the optional component out of this run
        #[arg(long)]
        skip_optional: bool,
    },
    /// Start containers and services, skipping install and build steps
    Start {
        /// Leave the optional component out of this run
        #[arg(long)]
        skip_optional: bool,
    },
    /// Probe every service and infrastructure dependency once
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show container status for each compose group
    Containers,
    /// Stop the container groups
    Down,
    /// Check that required tools and the container daemon are available
    Doctor,
    /// Validate the configuration file
    Validate,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::aot::Shell,
    },
}
