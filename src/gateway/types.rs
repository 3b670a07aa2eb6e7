//! Core types for the judge gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage tracking and debugging.
///
/// Every request through the gateway carries attribution so we know:
/// - Which elicitation run it belongs to (run_id)
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Elicitation run this request is part of.
    pub run_id: Option<Uuid>,
    /// Which code path made this call, e.g. "elicit::query".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request for `n` sampled chat completions.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider model id, e.g. "gpt-4.1".
    pub model: String,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens to generate. Dropped for profiles that reject the field.
    pub max_tokens: Option<u32>,
    /// Number of completions to sample.
    pub n: usize,
    /// Whether to request schema-constrained `{"preference": "A"|"B"}` output.
    pub structured: bool,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 1.0,
            max_tokens: None,
            n: 1,
            structured: false,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn samples(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    pub fn structured(mut self) -> Self {
        self.structured = true;
        self
    }
}

/// Response from a chat completion request.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Extracted text per returned sample, in provider order; `None` when
    /// the provider sent no usable content.
    pub completions: Vec<Option<String>>,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated across all samples.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
}

impl ChatResponse {
    pub(crate) fn empty() -> Self {
        Self {
            completions: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::from_millis(0),
        }
    }

    /// Raw text of every completion, `None` for missing or blank content.
    pub fn texts(&self) -> Vec<Option<String>> {
        self.completions
            .iter()
            .map(|c| {
                c.as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .collect()
    }
}
