//! CLI argument parsing for memstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ms")]
#[command(author, version, about = "Inspect the swarmd session and symbol store", long_about = None)]
pub struct Cli {
    /// Path to the store database (default: ./swarmd.db)
    #[arg(short, long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List sessions
    Sessions {
        /// Only show active sessions
        #[arg(short, long)]
        active: bool,
    },

    /// Show a session's messages in replay order
    Messages {
        /// Session ID
        #[arg(required = true)]
        session_id: String,

        /// Show the active-context replay instead of all messages
        #[arg(short, long)]
        replay: bool,
    },

    /// Full-text search across message text
    Search {
        /// Query text
        #[arg(required = true)]
        query: String,

        /// Prioritize hits from this session
        #[arg(short, long)]
        session: Option<String>,

        /// Maximum results to return
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Find code symbols by name fragment
    Symbols {
        /// Name fragment to match
        #[arg(required = true)]
        name: String,

        /// Maximum results to return
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List context memory entries
    Context {
        /// Restrict to one project scope
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Clear the active flag on sessions idle longer than N days
    Retire {
        /// Idle threshold in days
        #[arg(short, long, default_value = "30")]
        days: i64,
    },
}
