//! CLI argument parsing for swarmd

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sd")]
#[command(author, version, about = "Local multi-agent coding assistant", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Orchestration work directory (default: current directory)
    #[arg(short, long)]
    pub work_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decompose a request into a plan file without executing it
    Plan {
        /// The natural-language request
        #[arg(required = true)]
        request: String,

        /// Where to write the plan (default: plan.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Execute a plan (from a file, or planned on the fly from a request)
    Run {
        /// Natural-language request to plan and execute
        request: Option<String>,

        /// Execute an existing plan file instead
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Maximum concurrent agents
        #[arg(long)]
        max_agents: Option<usize>,

        /// Treat failed dependencies as satisfied
        #[arg(long)]
        skip_failed: bool,

        /// Retry failed subtasks
        #[arg(long)]
        retry_failed: bool,

        /// Run each agent as a child process
        #[arg(long)]
        process_isolation: bool,

        /// Skip merging agent branches on completion
        #[arg(long)]
        no_merge: bool,
    },

    /// Show a plan file's status counts
    Status {
        /// Plan file to inspect
        #[arg(default_value = "plan.json")]
        plan: PathBuf,
    },

    /// Index a directory into the symbol store
    Index {
        /// Directory to index (default: the work directory)
        path: Option<PathBuf>,

        /// Re-index files even when unchanged
        #[arg(short, long)]
        force: bool,
    },

    /// Full-text search across stored sessions
    Search {
        /// Query text
        #[arg(required = true)]
        query: String,

        /// Prioritize hits from this session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Internal: run as an orchestrated agent child
    #[command(hide = true)]
    Agent {
        /// Agent id assigned by the orchestrator
        #[arg(long)]
        agent_id: String,

        /// Work directory for this agent
        #[arg(long)]
        work_dir: PathBuf,
    },
}
