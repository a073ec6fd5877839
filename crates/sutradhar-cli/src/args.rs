use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Autonomous multi-agent runtime: supervised agent trees, learned model
/// routing, guarded tool execution.
#[derive(Debug, Parser)]
#[command(name = "sutradhar", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project directory to operate in (defaults to the current directory).
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    /// Per-phase timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Workspace data directory (overrides SUTRADHAR_PATH).
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a task through plan → execute → validate → review.
    Run {
        /// The task, in natural language.
        task: String,

        /// Create a working branch before executing.
        #[arg(long)]
        branch: bool,

        /// Commit the result when the run succeeds.
        #[arg(long)]
        commit: bool,

        /// Record phase failures and keep going instead of aborting.
        #[arg(long)]
        tolerate_failures: bool,

        /// Shell command used by the validate phase.
        #[arg(long)]
        test_command: Option<String>,
    },

    /// Produce a plan for a task without executing it.
    Plan {
        /// The task, in natural language.
        task: String,
    },

    /// Review changes with a read-only agent.
    Review {
        /// Git reference to review (defaults to the working tree).
        reference: Option<String>,
    },

    /// Run one offline consolidation (dream) cycle now.
    Consolidate,
}
