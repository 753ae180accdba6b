//! Integration tests for swarmd
//!
//! End-to-end behavior across the tool substrate, the agent loop, the
//! orchestrator, and the store.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use memstore::{MemoryStore, MessageCompletion, MessageType, NewMessage, NewSession, SearchOptions};
use swarmd::agent::AgentLoopConfig;
use swarmd::domain::{SubTask, SubTaskStatus, TaskPlan};
use swarmd::llm::LlmError;
use swarmd::llm::client::mock::MockLlmClient;
use swarmd::orchestrator::{ExecuteOptions, Orchestrator};
use swarmd::tools::{ToolContext, ToolExecutor};
use swarmd::ToolCall;

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn tool_ctx(temp: &TempDir) -> ToolContext {
    ToolContext::new(temp.path().to_path_buf(), "itest-agent".to_string())
}

async fn run_tool(executor: &ToolExecutor, ctx: &ToolContext, tool: &str, input: serde_json::Value) -> serde_json::Value {
    let call = ToolCall::new(format!("call_{tool}"), tool, input);
    let outcome = executor.execute(&call, ctx).await;
    serde_json::from_str(&outcome.result.content).expect("tool envelopes are JSON")
}

// =============================================================================
// Atomic Tool Substrate
// =============================================================================

#[tokio::test]
async fn test_atomic_write_preserves_on_checksum_mismatch() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("f.txt"), "A").unwrap();

    let executor = ToolExecutor::standard();
    let ctx = tool_ctx(&temp);

    let wrong = sha256_hex(b"B");
    let envelope = run_tool(
        &executor,
        &ctx,
        "write_file",
        json!({"path": "f.txt", "content": "B", "expected_hash": wrong}),
    )
    .await;

    assert_eq!(envelope["wrote"], false);
    assert_eq!(envelope["error"], "checksum_mismatch");
    assert_eq!(envelope["expected_sha256"], wrong);
    assert_eq!(envelope["actual_sha256"], sha256_hex(b"A"));

    // File content unchanged
    assert_eq!(std::fs::read_to_string(temp.path().join("f.txt")).unwrap(), "A");
}

#[tokio::test]
async fn test_chunked_write_equals_atomic_write() {
    let temp = TempDir::new().unwrap();
    let executor = ToolExecutor::standard();
    let ctx = tool_ctx(&temp);

    run_tool(
        &executor,
        &ctx,
        "write_chunk",
        json!({"path": "out.txt", "content": "HELLO ", "chunk_number": 1, "total_chunks": 2}),
    )
    .await;
    let final_envelope = run_tool(
        &executor,
        &ctx,
        "write_chunk",
        json!({"path": "out.txt", "content": "WORLD\n", "chunk_number": 2, "total_chunks": 2}),
    )
    .await;

    assert_eq!(final_envelope["success"], true);
    assert_eq!(final_envelope["complete"], true);
    assert_eq!(final_envelope["size_bytes"], 12);
    assert_eq!(final_envelope["lines"], 2);

    // Byte-for-byte identical to the atomic write of the same content
    run_tool(
        &executor,
        &ctx,
        "write_file",
        json!({"path": "direct.txt", "content": "HELLO WORLD\n"}),
    )
    .await;
    assert_eq!(
        std::fs::read(temp.path().join("out.txt")).unwrap(),
        std::fs::read(temp.path().join("direct.txt")).unwrap()
    );
}

#[tokio::test]
async fn test_process_whitelist_rejects_without_spawning() {
    let temp = TempDir::new().unwrap();
    let executor = ToolExecutor::standard();
    let ctx = tool_ctx(&temp);

    let envelope = run_tool(&executor, &ctx, "run_command", json!({"cmd": "rm", "args": ["-rf", "/"]})).await;

    assert_eq!(envelope["exit_code"], -1);
    assert_eq!(envelope["stdout"], "");
    assert_eq!(envelope["stderr"], "command_not_allowed");
}

#[tokio::test]
async fn test_patch_apply_rejects_empty_patch() {
    let temp = TempDir::new().unwrap();
    let executor = ToolExecutor::standard();
    let ctx = tool_ctx(&temp);

    let envelope = run_tool(&executor, &ctx, "apply_patch", json!({"patch": ""})).await;
    assert_eq!(envelope["applied"], false);
    assert_eq!(envelope["error"], "invalid_patch_format");
}

// =============================================================================
// Orchestrator
// =============================================================================

fn chain_plan() -> TaskPlan {
    let a = SubTask::with_id("a", "Task A", "produce the base artifact");
    let b = SubTask::with_id("b", "Task B", "build on A's output").depends_on("a");
    let c = SubTask::with_id("c", "Task C", "build on B's output").depends_on("b");
    TaskPlan::new("three step build", "chain", vec![a, b, c]).unwrap()
}

fn orchestrator(temp: &TempDir, llm: MockLlmClient) -> Orchestrator {
    let store = MemoryStore::open(temp.path().join("state/swarmd.db")).unwrap();
    let work_dir = temp.path().join("work");
    std::fs::create_dir_all(&work_dir).unwrap();
    Orchestrator::new(Arc::new(llm), store, work_dir, AgentLoopConfig::default())
}

fn hard_error() -> LlmError {
    LlmError::ApiError {
        status: 400,
        message: "bad request".to_string(),
    }
}

#[tokio::test]
async fn test_blocked_dependency_then_skip_failed_rerun() {
    // First run: A fails, B and C end up blocked, the error mentions skip
    let temp = TempDir::new().unwrap();
    let llm = MockLlmClient::scripted(vec![Err(hard_error())]);
    let orch = orchestrator(&temp, llm);

    let plan_path = temp.path().join("plan.json");
    let options = ExecuteOptions {
        plan_path: Some(plan_path.clone()),
        ..Default::default()
    };
    let result = orch.execute_plan(chain_plan(), &options).await.unwrap();

    assert_eq!(result.plan.get("a").unwrap().status, SubTaskStatus::Failed);
    assert_eq!(result.plan.get("b").unwrap().status, SubTaskStatus::Blocked);
    assert_eq!(result.plan.get("c").unwrap().status, SubTaskStatus::Blocked);
    assert!(result.error.unwrap().contains("skip"));

    // Rerun the persisted plan with skip_failed: B and C are attempted
    let persisted = swarmd::domain::load_plan(&plan_path).unwrap();
    let mut rerun_plan = persisted;
    // Blocked subtasks go back to pending for the rerun
    for id in ["b", "c"] {
        rerun_plan.set_status(id, SubTaskStatus::Pending);
    }

    let temp2 = TempDir::new().unwrap();
    let llm = MockLlmClient::new(vec![
        MockLlmClient::text_response("TASK COMPLETE"),
        MockLlmClient::text_response("TASK COMPLETE"),
    ]);
    let orch = orchestrator(&temp2, llm);
    let options = ExecuteOptions {
        skip_failed: true,
        ..Default::default()
    };
    let result = orch.execute_plan(rerun_plan, &options).await.unwrap();

    // The orchestrator itself reports no blockage
    assert!(result.error.is_none(), "{:?}", result.error);
    assert_eq!(result.plan.get("b").unwrap().status, SubTaskStatus::Completed);
    assert_eq!(result.plan.get("c").unwrap().status, SubTaskStatus::Completed);
}

#[tokio::test]
async fn test_agents_write_through_tools_and_branches_merge() {
    let temp = TempDir::new().unwrap();
    let llm = MockLlmClient::new(vec![
        MockLlmClient::tool_response("write_file", json!({"path": "a.txt", "content": "from task a\n"})),
        MockLlmClient::text_response("TASK COMPLETE"),
        MockLlmClient::tool_response("write_file", json!({"path": "b.txt", "content": "from task b\n"})),
        MockLlmClient::text_response("TASK COMPLETE"),
    ]);
    let orch = orchestrator(&temp, llm);

    // Sequential chain so the scripted responses line up deterministically
    let plan = TaskPlan::new(
        "write two files",
        "writers",
        vec![
            SubTask::with_id("t1", "Write A", "write a.txt"),
            SubTask::with_id("t2", "Write B", "write b.txt").depends_on("t1"),
        ],
    )
    .unwrap();

    let result = orch.execute_plan(plan, &ExecuteOptions::default()).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.merge_success, Some(true));

    // Both agents' work landed on the orchestration branch
    let work_dir = temp.path().join("work");
    assert_eq!(
        std::fs::read_to_string(work_dir.join("a.txt")).unwrap(),
        "from task a\n"
    );
    assert_eq!(
        std::fs::read_to_string(work_dir.join("b.txt")).unwrap(),
        "from task b\n"
    );
}

#[tokio::test]
async fn test_rerun_of_complete_plan_is_noop() {
    let temp = TempDir::new().unwrap();
    let llm = MockLlmClient::new(vec![]);
    let orch = orchestrator(&temp, llm);

    let mut plan = chain_plan();
    for id in ["a", "b", "c"] {
        plan.set_status(id, SubTaskStatus::Completed);
    }

    let result = orch.execute_plan(plan, &ExecuteOptions::default()).await.unwrap();
    assert!(result.success);
    // No branches created, no tasks re-executed
    assert!(!temp.path().join("work/.git").exists());
}

// =============================================================================
// Store: summarization replay and search
// =============================================================================

#[test]
fn test_summarization_replay_contract() {
    let temp = TempDir::new().unwrap();
    let store = MemoryStore::open(temp.path().join("swarmd.db")).unwrap();

    let session = store
        .create_session(NewSession {
            model_id: "claude-sonnet-4".to_string(),
            role: "coder".to_string(),
            ..Default::default()
        })
        .unwrap();

    // Ten completed messages m1..m10
    let mut ids = Vec::new();
    for i in 1..=10 {
        let mut new = NewMessage::of(&session.id, MessageType::Assistant);
        new.request_content = Some(format!("m{i}"));
        let message = store.append_message(new).unwrap();
        store.complete_message(&message.id, MessageCompletion::default()).unwrap();
        ids.push(message.id);
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    // Summarize m1..m6
    let summary = store
        .record_summary(&session.id, "progress summary", None, &ids[..6])
        .unwrap();

    for id in &ids[..6] {
        let message = store.get_message(id).unwrap().unwrap();
        assert!(message.is_summarized);
        assert_eq!(message.summary_id.as_deref(), Some(summary.id.as_str()));
    }

    // Active replay returns [summary, m7, m8, m9, m10]
    let replay = store.active_context(&session.id).unwrap();
    let replay_ids: Vec<&str> = replay.iter().map(|m| m.id.as_str()).collect();
    let mut expected = vec![summary.id.as_str()];
    expected.extend(ids[6..].iter().map(|s| s.as_str()));
    assert_eq!(replay_ids, expected);
}

#[test]
fn test_search_prioritizes_current_session() {
    let temp = TempDir::new().unwrap();
    let store = MemoryStore::open(temp.path().join("swarmd.db")).unwrap();

    let mut session_ids = Vec::new();
    for _ in 0..2 {
        let session = store
            .create_session(NewSession {
                model_id: "claude-sonnet-4".to_string(),
                ..Default::default()
            })
            .unwrap();
        let mut new = NewMessage::of(&session.id, MessageType::Assistant);
        new.request_content = Some("let's refactor the session store".to_string());
        let message = store.append_message(new).unwrap();
        store.complete_message(&message.id, MessageCompletion::default()).unwrap();
        session_ids.push(session.id);
    }

    // With S1 current, its hit comes first; with S2 current, S2's does
    for current in &session_ids {
        let hits = store
            .search_messages(
                "refactor",
                &SearchOptions {
                    current_session_id: Some(current.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(&hits[0].session_id, current);
    }
}

// =============================================================================
// Agent loop through the public API
// =============================================================================

#[tokio::test]
async fn test_agent_loop_writes_file_and_persists_session() {
    let temp = TempDir::new().unwrap();
    let store = MemoryStore::open(temp.path().join("swarmd.db")).unwrap();
    let llm = MockLlmClient::new(vec![
        MockLlmClient::tool_response("write_file", json!({"path": "greeting.txt", "content": "hello\n"})),
        MockLlmClient::text_response("wrote the greeting. TASK COMPLETE"),
    ]);

    let engine = swarmd::agent::AgentLoop::new(
        Arc::new(llm),
        store.clone(),
        ToolExecutor::standard(),
        AgentLoopConfig::default(),
    );

    let work = temp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let ctx = ToolContext::new(work.clone(), "itest-agent".to_string());

    let task = SubTask::with_id("t1", "Write greeting", "create greeting.txt");
    let result = engine.run(&task, "write a greeting file", &[], &ctx, None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(std::fs::read_to_string(work.join("greeting.txt")).unwrap(), "hello\n");

    // The session holds the assistant turns and the tool call
    let messages = store.session_messages(result.session_id.as_ref().unwrap()).unwrap();
    assert!(messages.iter().any(|m| m.message_type == MessageType::ToolCall));
    assert!(messages.iter().any(|m| m.message_type == MessageType::Assistant));
}
