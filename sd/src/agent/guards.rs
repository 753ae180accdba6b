//! Loop guards
//!
//! Rules that force the agent loop to a terminating state: the per-task
//! iteration cap, the identical-tool-call loop detector, and the
//! consecutive-tool-failure limit.

use serde_json::Value;
use tracing::warn;

use super::tokens::AUTO_SUMMARIZE_THRESHOLD;

/// Guard limits for one task
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Identical calls in a row before the loop detector trips
    pub tool_loop_window: usize,

    /// Failed calls in a row before the failure guard trips
    pub consecutive_failure_limit: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            tool_loop_window: 3,
            consecutive_failure_limit: 3,
        }
    }
}

/// A tripped guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardTrip {
    ToolLoop { tool: String, repeats: usize },
    ConsecutiveFailures { count: usize },
}

impl GuardTrip {
    /// Bailout reason recorded on the failed message
    pub fn bailout_reason(&self) -> &'static str {
        match self {
            GuardTrip::ToolLoop { .. } => "tool_loop",
            GuardTrip::ConsecutiveFailures { .. } => "consecutive_tool_failures",
        }
    }

    pub fn message(&self) -> String {
        match self {
            GuardTrip::ToolLoop { tool, repeats } => {
                format!("stuck in tool call loop: {tool} called {repeats} times with identical arguments")
            }
            GuardTrip::ConsecutiveFailures { count } => {
                format!("{count} consecutive tool calls failed")
            }
        }
    }
}

/// Canonical form of tool arguments: object keys sorted recursively
///
/// Two calls are "identical" when their canonical forms match, independent of
/// key order in the model's output.
fn normalize_args(value: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), canonical(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    canonical(value).to_string()
}

/// Mutable guard state for one task run
#[derive(Debug)]
pub struct GuardState {
    config: GuardConfig,
    last_call: Option<(String, String)>,
    repeat_run: usize,
    consecutive_failures: usize,
    tripped: Option<GuardTrip>,
}

impl GuardState {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            last_call: None,
            repeat_run: 0,
            consecutive_failures: 0,
            tripped: None,
        }
    }

    /// Record an outgoing tool call; returns the trip if the loop detector fires
    pub fn record_tool_call(&mut self, name: &str, args: &Value) -> Option<GuardTrip> {
        let key = (name.to_string(), normalize_args(args));

        if self.last_call.as_ref() == Some(&key) {
            self.repeat_run += 1;
        } else {
            self.last_call = Some(key);
            self.repeat_run = 1;
        }

        if self.repeat_run >= self.config.tool_loop_window {
            let trip = GuardTrip::ToolLoop {
                tool: name.to_string(),
                repeats: self.repeat_run,
            };
            warn!(tool = name, repeats = self.repeat_run, "Tool loop detected");
            self.tripped = Some(trip.clone());
            return Some(trip);
        }
        None
    }

    /// Record a finished tool call; returns the trip if the failure guard fires
    pub fn record_tool_result(&mut self, failed: bool) -> Option<GuardTrip> {
        if failed {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }

        if self.consecutive_failures >= self.config.consecutive_failure_limit {
            let trip = GuardTrip::ConsecutiveFailures {
                count: self.consecutive_failures,
            };
            warn!(count = self.consecutive_failures, "Consecutive tool failures");
            self.tripped = Some(trip.clone());
            return Some(trip);
        }
        None
    }

    pub fn tripped(&self) -> Option<&GuardTrip> {
        self.tripped.as_ref()
    }
}

/// Outcome when the iteration cap is hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapOutcome {
    /// Context is healthy and no other guard tripped: report success with a warning
    SuccessWithWarning,
    HardFailure,
}

/// Uniform iteration-cap rule
///
/// Hitting the cap is a soft failure only while context usage is still below
/// the auto-summarize threshold and no other guard has tripped.
pub fn iteration_cap_outcome(context_ratio: f64, other_guard_tripped: bool) -> CapOutcome {
    if context_ratio < AUTO_SUMMARIZE_THRESHOLD && !other_guard_tripped {
        CapOutcome::SuccessWithWarning
    } else {
        CapOutcome::HardFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_loop_trips_at_three_identical() {
        let mut guards = GuardState::new(GuardConfig::default());
        let args = json!({"path": "a.rs"});

        assert!(guards.record_tool_call("read_file", &args).is_none());
        assert!(guards.record_tool_call("read_file", &args).is_none());
        let trip = guards.record_tool_call("read_file", &args).unwrap();
        assert!(matches!(trip, GuardTrip::ToolLoop { repeats: 3, .. }));
    }

    #[test]
    fn test_two_identical_calls_do_not_trip() {
        let mut guards = GuardState::new(GuardConfig::default());
        let args = json!({"path": "a.rs"});

        guards.record_tool_call("read_file", &args);
        guards.record_tool_call("read_file", &args);
        assert!(guards.tripped().is_none());
    }

    #[test]
    fn test_different_args_reset_run() {
        let mut guards = GuardState::new(GuardConfig::default());

        guards.record_tool_call("read_file", &json!({"path": "a.rs"}));
        guards.record_tool_call("read_file", &json!({"path": "b.rs"}));
        guards.record_tool_call("read_file", &json!({"path": "a.rs"}));
        assert!(guards.tripped().is_none());
    }

    #[test]
    fn test_key_order_is_normalized() {
        let mut guards = GuardState::new(GuardConfig::default());

        guards.record_tool_call("write_file", &json!({"path": "a.rs", "content": "x"}));
        guards.record_tool_call("write_file", &json!({"content": "x", "path": "a.rs"}));
        let trip = guards.record_tool_call("write_file", &json!({"path": "a.rs", "content": "x"}));
        assert!(trip.is_some());
    }

    #[test]
    fn test_consecutive_failures_trip_at_three() {
        let mut guards = GuardState::new(GuardConfig::default());

        assert!(guards.record_tool_result(true).is_none());
        assert!(guards.record_tool_result(true).is_none());
        let trip = guards.record_tool_result(true).unwrap();
        assert!(matches!(trip, GuardTrip::ConsecutiveFailures { count: 3 }));
    }

    #[test]
    fn test_success_resets_failure_run() {
        let mut guards = GuardState::new(GuardConfig::default());

        guards.record_tool_result(true);
        guards.record_tool_result(true);
        guards.record_tool_result(false);
        guards.record_tool_result(true);
        guards.record_tool_result(true);
        assert!(guards.tripped().is_none());
    }

    #[test]
    fn test_iteration_cap_rule() {
        assert_eq!(iteration_cap_outcome(0.5, false), CapOutcome::SuccessWithWarning);
        assert_eq!(iteration_cap_outcome(0.89, false), CapOutcome::SuccessWithWarning);
        // Context at or past the summarize threshold is a hard failure
        assert_eq!(iteration_cap_outcome(0.90, false), CapOutcome::HardFailure);
        // Any other guard trip makes it a hard failure
        assert_eq!(iteration_cap_outcome(0.5, true), CapOutcome::HardFailure);
    }
}
