//! Decomposer - turns a user request into a TaskPlan
//!
//! One LLM call instructed to emit strict JSON. A response that fails to
//! parse or validate falls back to a single subtask wrapping the whole
//! request, so planning never hard-fails on model formatting.

use std::sync::Arc;

use eyre::{Result, eyre};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::domain::{Complexity, SubTask, TaskPlan, TaskType};
use crate::llm::{CompletionRequest, LlmClient, Message, RetryPolicy};

const PLANNER_SYSTEM_PROMPT: &str = "You are a planning assistant for a multi-agent coding system. \
     Decompose the user's request into subtasks with dependencies. \
     Respond with ONLY a JSON object of this shape:\n\
     {\n\
       \"summary\": \"short plan title\",\n\
       \"subtasks\": [\n\
         {\n\
           \"id\": \"t1\",\n\
           \"title\": \"...\",\n\
           \"description\": \"...\",\n\
           \"task_type\": \"code|build|test|docs|other\",\n\
           \"complexity\": \"trivial|simple|moderate|complex|very-complex\",\n\
           \"estimated_minutes\": 10,\n\
           \"required_tools\": [],\n\
           \"files_affected\": [],\n\
           \"dependencies\": [],\n\
           \"use_thinking_model\": false\n\
         }\n\
       ]\n\
     }\n\
     Subtask ids must be unique; dependencies reference those ids; the graph must be acyclic. \
     Prefer a handful of well-scoped subtasks over many tiny ones.";

/// The JSON shape the planner model is asked to produce
#[derive(Debug, Deserialize)]
struct PlanSpec {
    summary: String,
    subtasks: Vec<SubTaskSpec>,
}

#[derive(Debug, Deserialize)]
struct SubTaskSpec {
    id: String,
    title: String,
    description: String,
    #[serde(default)]
    task_type: TaskType,
    #[serde(default)]
    complexity: Complexity,
    #[serde(default)]
    estimated_minutes: u32,
    #[serde(default)]
    required_tools: Vec<String>,
    #[serde(default)]
    files_affected: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    use_thinking_model: bool,
}

/// Pull the first JSON object out of a response that may carry prose
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start { Some(&text[start..=end]) } else { None }
}

/// LLM-backed plan decomposer
pub struct Decomposer {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl Decomposer {
    pub fn new(llm: Arc<dyn LlmClient>, model: Option<String>, max_tokens: u32) -> Self {
        Self {
            llm,
            model,
            max_tokens,
            retry: RetryPolicy::default(),
        }
    }

    /// Decompose a request into a validated TaskPlan
    pub async fn decompose(&self, request: &str, cancel: &CancelToken) -> Result<TaskPlan> {
        if request.trim().is_empty() {
            return Err(eyre!("request is empty"));
        }

        let completion = CompletionRequest {
            system_prompt: PLANNER_SYSTEM_PROMPT.to_string(),
            messages: vec![Message::user(request)],
            tools: vec![],
            max_tokens: self.max_tokens,
            model: self.model.clone(),
        };

        let llm = self.llm.clone();
        let response = self
            .retry
            .run(cancel, move |_| {
                let completion = completion.clone();
                let llm = llm.clone();
                async move { llm.complete(completion).await }
            })
            .await
            .map_err(|e| eyre!("planner call failed: {e}"))?;

        let text = response.content.unwrap_or_default();
        match self.parse_plan(request, &text) {
            Ok(plan) => {
                info!(plan_id = %plan.id, subtasks = plan.subtasks.len(), "Plan decomposed");
                Ok(plan)
            }
            Err(e) => {
                warn!(error = %e, "Planner output unusable; falling back to a single subtask");
                Ok(fallback_plan(request))
            }
        }
    }

    fn parse_plan(&self, request: &str, text: &str) -> Result<TaskPlan> {
        let json = extract_json(text).ok_or_else(|| eyre!("no JSON object in planner output"))?;
        let spec: PlanSpec = serde_json::from_str(json)?;

        if spec.subtasks.is_empty() {
            return Err(eyre!("planner produced no subtasks"));
        }

        let subtasks = spec
            .subtasks
            .into_iter()
            .map(|s| SubTask {
                id: s.id,
                title: s.title,
                description: s.description,
                task_type: s.task_type,
                complexity: s.complexity,
                estimated_minutes: s.estimated_minutes,
                required_tools: s.required_tools,
                files_affected: s.files_affected,
                dependencies: s.dependencies,
                status: Default::default(),
                assigned_agent_id: None,
                retry_count: 0,
                last_error: None,
                use_thinking_model: s.use_thinking_model,
            })
            .collect();

        Ok(TaskPlan::new(request, spec.summary, subtasks)?)
    }
}

/// One subtask wrapping the entire request
fn fallback_plan(request: &str) -> TaskPlan {
    let title: String = request.chars().take(60).collect();
    let task = SubTask::new(&title, request).with_complexity(Complexity::Moderate);
    TaskPlan::new(request, title.clone(), vec![task]).expect("single subtask plans always validate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;

    fn planner_response() -> String {
        serde_json::json!({
            "summary": "add parser",
            "subtasks": [
                {
                    "id": "t1",
                    "title": "Write parser",
                    "description": "implement it",
                    "task_type": "code",
                    "complexity": "complex",
                    "estimated_minutes": 30,
                    "dependencies": []
                },
                {
                    "id": "t2",
                    "title": "Test parser",
                    "description": "cover edge cases",
                    "task_type": "test",
                    "complexity": "simple",
                    "dependencies": ["t1"]
                }
            ]
        })
        .to_string()
    }

    fn decomposer(llm: MockLlmClient) -> Decomposer {
        Decomposer::new(Arc::new(llm), None, 4096)
    }

    #[tokio::test]
    async fn test_decompose_valid_json() {
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response(&planner_response())]);
        let plan = decomposer(llm)
            .decompose("add a parser", &CancelToken::noop())
            .await
            .unwrap();

        assert_eq!(plan.subtasks.len(), 2);
        assert_eq!(plan.summary, "add parser");
        assert_eq!(plan.original_request, "add a parser");
        assert_eq!(plan.get("t2").unwrap().dependencies, vec!["t1"]);
        assert_eq!(plan.get("t1").unwrap().complexity, Complexity::Complex);
    }

    #[tokio::test]
    async fn test_decompose_json_wrapped_in_prose() {
        let text = format!("Here is the plan:\n\n{}\n\nLet me know!", planner_response());
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response(&text)]);
        let plan = decomposer(llm)
            .decompose("add a parser", &CancelToken::noop())
            .await
            .unwrap();

        assert_eq!(plan.subtasks.len(), 2);
    }

    #[tokio::test]
    async fn test_decompose_garbage_falls_back() {
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response("I cannot plan today")]);
        let plan = decomposer(llm)
            .decompose("refactor the cache layer", &CancelToken::noop())
            .await
            .unwrap();

        assert_eq!(plan.subtasks.len(), 1);
        assert_eq!(plan.subtasks[0].description, "refactor the cache layer");
    }

    #[tokio::test]
    async fn test_decompose_cyclic_plan_falls_back() {
        let cyclic = serde_json::json!({
            "summary": "impossible",
            "subtasks": [
                {"id": "a", "title": "A", "description": "d", "dependencies": ["b"]},
                {"id": "b", "title": "B", "description": "d", "dependencies": ["a"]}
            ]
        })
        .to_string();
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response(&cyclic)]);

        let plan = decomposer(llm)
            .decompose("do the thing", &CancelToken::noop())
            .await
            .unwrap();
        assert_eq!(plan.subtasks.len(), 1);
    }

    #[tokio::test]
    async fn test_decompose_empty_request_errors() {
        let llm = MockLlmClient::new(vec![]);
        let result = decomposer(llm).decompose("  ", &CancelToken::noop()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("{\"a\": 1}"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("before {\"a\": 1} after"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no json here"), None);
    }
}
