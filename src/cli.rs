//! CLI command definitions and handling
//!
//! Uses `clap` derive API for argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// bob - a programmable build engine
#[derive(Parser, Debug)]
#[command(name = "bob")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to bob.toml build description
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Working directory
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build every stale task
    Build {
        /// Expand and scan only, list the tasks without running them
        #[arg(long)]
        dry_run: bool,

        /// Rebuild even if up to date
        #[arg(short, long)]
        force: bool,

        /// Number of parallel tasks (0 = auto)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Show tasks and their data dependencies
    Graph {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: GraphFormat,
    },

    /// Forget every recorded signature
    Clean,

    /// Inspect the signature store
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Validate the build description
    Check,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show store statistics
    Stats,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum GraphFormat {
    #[default]
    Text,
    Dot,
    Json,
}

impl Cli {
    /// Get the effective command; a bare `bob` builds
    pub fn effective_command(&self) -> Commands {
        match &self.command {
            Some(Commands::Build {
                dry_run,
                force,
                jobs,
            }) => Commands::Build {
                dry_run: *dry_run,
                force: *force,
                jobs: *jobs,
            },
            Some(Commands::Graph { format }) => Commands::Graph { format: *format },
            Some(Commands::Clean) => Commands::Clean,
            Some(Commands::Cache { .. }) => Commands::Cache {
                command: CacheCommands::Stats,
            },
            Some(Commands::Check) => Commands::Check,
            None => Commands::Build {
                dry_run: false,
                force: false,
                jobs: 0,
            },
        }
    }
}
