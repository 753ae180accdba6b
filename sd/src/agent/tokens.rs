//! Context budget accounting
//!
//! Tracks how full the model's context window is after each turn and maps it
//! to the pressure levels the loop acts on. When the provider reports no
//! usage, size is estimated at four characters per token.

use crate::llm::TokenUsage;

pub const WARNING_THRESHOLD: f64 = 0.70;
pub const CRITICAL_THRESHOLD: f64 = 0.85;
pub const AUTO_SUMMARIZE_THRESHOLD: f64 = 0.90;
pub const TRUNCATION_THRESHOLD: f64 = 0.95;

const CHARS_PER_TOKEN: u64 = 4;

/// Estimate token count from character count
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Escalating context pressure levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextPressure {
    Normal,
    /// Logged advisory at 70%
    Warning,
    /// Stronger advisory at 85%
    Critical,
    /// Trigger summarization at 90%
    Summarize,
    /// Drop oldest messages at 95%
    Truncate,
}

/// Running totals per message role
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleTotals {
    pub system: u64,
    pub user: u64,
    pub assistant: u64,
    pub tool: u64,
}

/// Per-agent token tracker
#[derive(Debug, Clone)]
pub struct TokenTracker {
    max_context: u64,

    /// Prompt tokens of the most recent call
    last_prompt: u64,

    /// Completion tokens accumulated across all calls
    completion_total: u64,

    /// Context size after the most recent turn
    context_size: u64,

    pub roles: RoleTotals,
}

impl TokenTracker {
    pub fn new(max_context: u64) -> Self {
        Self {
            max_context: max_context.max(1),
            last_prompt: 0,
            completion_total: 0,
            context_size: 0,
            roles: RoleTotals::default(),
        }
    }

    /// Record reported usage after an LLM call
    ///
    /// The provider's own total wins when reported; otherwise the context
    /// size is prompt + completion of this call.
    pub fn record(&mut self, usage: &TokenUsage) {
        self.last_prompt = usage.prompt_tokens;
        self.completion_total += usage.completion_tokens;
        self.context_size = usage.context_total();
        if let Some(max) = usage.max_context {
            self.max_context = max.max(1);
        }
    }

    /// Re-estimate the context size from raw character count
    pub fn estimate_from_chars(&mut self, chars: usize) {
        self.context_size = estimate_tokens(chars);
    }

    pub fn add_role_tokens(&mut self, role: &str, tokens: u64) {
        match role {
            "system" => self.roles.system += tokens,
            "user" => self.roles.user += tokens,
            "assistant" => self.roles.assistant += tokens,
            _ => self.roles.tool += tokens,
        }
    }

    pub fn usage_ratio(&self) -> f64 {
        self.context_size as f64 / self.max_context as f64
    }

    /// Pressure level for the current ratio; thresholds are inclusive
    pub fn pressure(&self) -> ContextPressure {
        let ratio = self.usage_ratio();
        if ratio >= TRUNCATION_THRESHOLD {
            ContextPressure::Truncate
        } else if ratio >= AUTO_SUMMARIZE_THRESHOLD {
            ContextPressure::Summarize
        } else if ratio >= CRITICAL_THRESHOLD {
            ContextPressure::Critical
        } else if ratio >= WARNING_THRESHOLD {
            ContextPressure::Warning
        } else {
            ContextPressure::Normal
        }
    }

    pub fn context_size(&self) -> u64 {
        self.context_size
    }

    pub fn completion_total(&self) -> u64 {
        self.completion_total
    }

    pub fn last_prompt(&self) -> u64 {
        self.last_prompt
    }

    pub fn max_context(&self) -> u64 {
        self.max_context
    }
}
