use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::path::PathBuf;

use memstore::cli::{Cli, Command};
use memstore::{MemoryStore, SearchOptions};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(|| PathBuf::from("swarmd.db"));

    info!("memstore opening {}", db_path.display());
    let store = MemoryStore::open(&db_path).context("Failed to open store")?;

    match cli.command {
        Command::Sessions { active } => {
            let sessions = store.list_sessions(active)?;
            for s in sessions {
                let flag = if s.is_active { "●".green() } else { "○".dimmed() };
                println!(
                    "{} {} {} {} {}",
                    flag,
                    s.id.cyan(),
                    s.role.yellow(),
                    s.model_id.dimmed(),
                    s.title.unwrap_or_default()
                );
            }
        }
        Command::Messages { session_id, replay } => {
            let messages = if replay {
                store.active_context(&session_id)?
            } else {
                store.session_messages(&session_id)?
            };
            for m in messages {
                println!(
                    "{} {} {} {}",
                    m.started_at.format("%H:%M:%S").to_string().dimmed(),
                    m.message_type.as_str().yellow(),
                    m.status.as_str().dimmed(),
                    m.text().lines().next().unwrap_or("")
                );
            }
        }
        Command::Search { query, session, limit } => {
            let hits = store.search_messages(
                &query,
                &SearchOptions {
                    current_session_id: session,
                    limit,
                    ..Default::default()
                },
            )?;
            if hits.is_empty() {
                println!("{} no matches", "∅".dimmed());
            }
            for h in hits {
                println!("{} {} {}", h.session_id.cyan(), h.message_id.dimmed(), h.snippet);
            }
        }
        Command::Symbols { name, limit } => {
            let symbols = store.symbols_by_name(&name, limit)?;
            for s in symbols {
                println!(
                    "{} {} {}:{}",
                    s.kind.yellow(),
                    s.full_name.cyan(),
                    s.file_path,
                    s.line_start
                );
            }
        }
        Command::Context { project } => {
            let entries = store.list_context(project.as_deref())?;
            for e in entries {
                let scope = if e.project.is_empty() { "global".dimmed() } else { e.project.yellow() };
                println!("{} [{}] {} = {}", scope, e.kind.as_str(), e.key.cyan(), e.value);
            }
        }
        Command::Retire { days } => {
            let retired = store.retire_idle_sessions(days)?;
            println!("{} retired {} sessions", "✓".green(), retired);
        }
    }

    Ok(())
}
