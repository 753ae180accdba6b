//! swarmd - local multi-agent coding assistant
//!
//! CLI entry point and composition root: configuration, store, LLM client,
//! indexer, and orchestrator are built here and threaded explicitly.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::info;

use memstore::{MemoryStore, SearchOptions};
use swarmd::agent::{AgentLoop, AgentLoopConfig};
use swarmd::cli::{Cli, Command};
use swarmd::config::Config;
use swarmd::domain::{SubTaskStatus, load_plan, save_plan};
use swarmd::index::{IndexConfig, SymbolIndexer};
use swarmd::orchestrator::{ExecuteOptions, Orchestrator, OrchestratorEvent, serve_agent_mode};
use swarmd::planning::Decomposer;
use swarmd::tools::ToolExecutor;
use swarmd::{CancelToken, cancel_pair};

fn setup_logging() -> Result<()> {
    // Logs go to stderr: agent mode owns stdout for its IPC protocol
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let work_dir = cli
        .work_dir
        .clone()
        .unwrap_or_else(|| config.storage.work_dir.clone());
    let db_path = work_dir.join(&config.storage.db_name);

    match cli.command {
        Command::Plan { request, output } => {
            let llm = swarmd::llm::create_client(&config.llm)?;
            let decomposer = Decomposer::new(llm, Some(config.llm.model.clone()), config.llm.max_tokens);

            let plan = decomposer.decompose(&request, &CancelToken::noop()).await?;
            let path = output.unwrap_or_else(|| PathBuf::from("plan.json"));
            save_plan(&plan, &path)?;

            println!("{} plan {} with {} subtasks -> {}", "✓".green(), plan.id.cyan(), plan.subtasks.len(), path.display());
            for task in &plan.subtasks {
                let deps = if task.dependencies.is_empty() {
                    String::new()
                } else {
                    format!(" (after {})", task.dependencies.join(", "))
                };
                println!("  {} {}{}", task.id.yellow(), task.title, deps.dimmed());
            }
        }

        Command::Run {
            request,
            plan,
            max_agents,
            skip_failed,
            retry_failed,
            process_isolation,
            no_merge,
        } => {
            let store = MemoryStore::open(&db_path)?;
            let llm = swarmd::llm::create_client(&config.llm)?;

            let (task_plan, plan_path) = match (plan, request) {
                (Some(path), _) => (load_plan(&path)?, path),
                (None, Some(request)) => {
                    let decomposer = Decomposer::new(llm.clone(), Some(config.llm.model.clone()), config.llm.max_tokens);
                    let new_plan = decomposer.decompose(&request, &CancelToken::noop()).await?;
                    let path = work_dir.join("plan.json");
                    save_plan(&new_plan, &path)?;
                    (new_plan, path)
                }
                (None, None) => eyre::bail!("provide a request or --plan <file>"),
            };

            let mut options = ExecuteOptions::from_config(&config);
            options.plan_path = Some(plan_path);
            if let Some(max) = max_agents {
                options.max_agents = max;
            }
            options.skip_failed = options.skip_failed || skip_failed;
            options.retry_failed = options.retry_failed || retry_failed;
            options.use_process_isolation = options.use_process_isolation || process_isolation;
            if no_merge {
                options.auto_merge_results = false;
            }

            let indexer = Arc::new(SymbolIndexer::new(
                store.clone(),
                IndexConfig::from(&config.index),
                work_dir.clone(),
            ));

            let (cancel_handle, cancel_token) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received; cancelling plan");
                    cancel_handle.cancel();
                }
            });

            let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(256);
            let printer = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        OrchestratorEvent::AgentStarted { agent_id, task_id } => {
                            println!("{} {} -> {}", "▶".blue(), agent_id.cyan(), task_id);
                        }
                        OrchestratorEvent::TaskCompleted { task_id, success } => {
                            let mark = if success { "✓".green() } else { "✗".red() };
                            println!("{mark} {task_id}");
                        }
                        OrchestratorEvent::PhaseCompleted { phase, completed, failed } => {
                            println!("{} phase {phase}: {completed} completed, {failed} failed", "─".dimmed());
                        }
                        OrchestratorEvent::AgentToolCall { agent_id, tool } => {
                            println!("  {} {} {}", agent_id.dimmed(), "tool".dimmed(), tool);
                        }
                        _ => {}
                    }
                }
            });

            let mut orchestrator = Orchestrator::new(llm, store, work_dir, AgentLoopConfig::from_config(&config))
                .with_indexer(indexer)
                .with_cancel(cancel_token)
                .with_events(event_tx);
            if options.use_process_isolation {
                let program = std::env::current_exe().context("Failed to locate own executable")?;
                orchestrator = orchestrator.with_agent_program(program);
            }

            let result = orchestrator.execute_plan(task_plan, &options).await?;
            drop(orchestrator);
            let _ = printer.await;

            let counts = result.plan.status_counts();
            println!(
                "\n{} plan {}: {} completed, {} failed, {} blocked in {:.1?}",
                if result.success { "✓".green() } else { "✗".red() },
                result.plan_id.cyan(),
                counts.completed,
                counts.failed,
                counts.blocked,
                result.duration
            );
            if let Some(merged) = result.merge_success {
                let mark = if merged { "✓".green() } else { "✗".red() };
                println!("{mark} branch merge");
            }
            if let Some(error) = result.error {
                println!("{} {error}", "!".yellow());
            }
        }

        Command::Status { plan } => {
            let task_plan = load_plan(&plan)?;
            let counts = task_plan.status_counts();
            println!(
                "{} {}: {} pending, {} in progress, {} completed, {} failed, {} blocked",
                task_plan.id.cyan(),
                task_plan.summary,
                counts.pending,
                counts.in_progress,
                counts.completed,
                counts.failed,
                counts.blocked
            );
            for task in &task_plan.subtasks {
                let mark = match task.status {
                    SubTaskStatus::Completed => "✓".green(),
                    SubTaskStatus::Failed => "✗".red(),
                    SubTaskStatus::Blocked => "⊘".yellow(),
                    SubTaskStatus::InProgress => "▶".blue(),
                    SubTaskStatus::Pending => "·".dimmed(),
                };
                println!("  {mark} {} {}", task.id.yellow(), task.title);
            }
        }

        Command::Index { path, force } => {
            let store = MemoryStore::open(&db_path)?;
            let target = path.unwrap_or_else(|| work_dir.clone());
            let indexer = SymbolIndexer::new(store, IndexConfig::from(&config.index), work_dir.clone());

            let stats = if force {
                // Force by walking files individually
                let mut stats = swarmd::index::IndexStats::default();
                let mut entries = Vec::new();
                for entry in walkdir::WalkDir::new(&target).into_iter().filter_map(|e| e.ok()) {
                    if entry.file_type().is_file() {
                        entries.push(entry.into_path());
                    }
                }
                for file in entries {
                    match indexer.index_file(&file, true).await {
                        Ok(swarmd::index::IndexOutcome::Indexed { .. }) => stats.indexed += 1,
                        Ok(swarmd::index::IndexOutcome::Unchanged) => stats.unchanged += 1,
                        _ => stats.skipped += 1,
                    }
                }
                stats
            } else {
                indexer.index_directory(&target).await?
            };

            println!(
                "{} indexed {}, unchanged {}, skipped {}",
                "✓".green(),
                stats.indexed,
                stats.unchanged,
                stats.skipped
            );
        }

        Command::Search { query, session } => {
            let store = MemoryStore::open(&db_path)?;
            let hits = store.search_messages(
                &query,
                &SearchOptions {
                    current_session_id: session,
                    ..Default::default()
                },
            )?;
            if hits.is_empty() {
                println!("{} no matches", "∅".dimmed());
            }
            for hit in hits {
                println!("{} {} {}", hit.session_id.cyan(), hit.message_id.dimmed(), hit.snippet);
            }
        }

        Command::Agent { agent_id, work_dir } => {
            info!(agent_id = %agent_id, "Starting in agent mode");
            // The store lives at the orchestration root, not in the agent's worktree
            let store = MemoryStore::open(config.storage.db_path())?;
            let llm = swarmd::llm::create_client(&config.llm)?;
            let engine = AgentLoop::new(llm, store, ToolExecutor::standard(), AgentLoopConfig::from_config(&config));
            serve_agent_mode(&engine, &agent_id, &work_dir).await?;
        }
    }

    Ok(())
}
