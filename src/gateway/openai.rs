//! OpenAI-compatible adapter for chat completions.
//!
//! OpenAI, Anthropic, Gemini and xAI all expose a `/chat/completions`
//! endpoint with the same body shape; the differences are captured by a
//! [`ProviderProfile`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::{ErrorContext, ProviderError};
use super::profile::ProviderProfile;
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters.
const MAX_INPUT_CHARS: usize = 500_000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleAdapter {
    client: reqwest::Client,
    base_url: String,
    profile: ProviderProfile,
}

impl OpenAiCompatibleAdapter {
    /// Create from the profile's API key variable.
    ///
    /// `base_url` overrides the profile default; `JUDGE_TIMEOUT_SECONDS`
    /// overrides the request timeout.
    pub fn from_env(
        profile: ProviderProfile,
        base_url: Option<String>,
    ) -> Result<Self, ProviderError> {
        let api_key = std::env::var(profile.api_key_env)
            .map_err(|_| ProviderError::config(format!("{} not set", profile.api_key_env)))?;

        let timeout = std::env::var("JUDGE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let base_url = base_url.unwrap_or_else(|| profile.base_url.to_string());
        Self::with_config(api_key, base_url, timeout, profile)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        profile: ProviderProfile,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            profile,
        })
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StructuredPreference {
    preference: String,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

/// JSON schema constraining output to `{"preference": "A" | "B"}`.
fn preference_schema() -> serde_json::Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "Preference",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "preference": {
                        "type": "string",
                        "enum": ["A", "B"],
                        "description": "The preferred option."
                    }
                },
                "required": ["preference"],
                "additionalProperties": false
            }
        }
    })
}

/// Pull the `preference` field out of a structured reply.
///
/// Models occasionally ignore the schema; raw text is kept in that case so
/// the forced-choice parser still gets a chance.
fn extract_structured(content: String) -> String {
    match serde_json::from_str::<StructuredPreference>(content.trim()) {
        Ok(parsed) => parsed.preference,
        Err(_) => content,
    }
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for OpenAiCompatibleAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }
        if req.n == 0 {
            return Err(ProviderError::invalid_request("n must be >= 1"));
        }

        let start = Instant::now();
        let structured = req.structured && self.profile.supports_structured_output;

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            n: req.n,
            max_tokens: if self.profile.omit_max_tokens {
                None
            } else {
                req.max_tokens
            },
            response_format: structured.then(preference_schema),
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    self.profile.name,
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            if status.as_u16() == 429 {
                return Err(ProviderError::rate_limited(Duration::from_secs(60), ctx));
            }

            let mut message = format!("HTTP {}", status.as_u16());
            let mut ctx = ctx;
            if let Ok(parsed) = serde_json::from_str::<ChatApiResponse>(&body) {
                if let Some(error) = parsed.error {
                    if let Some(m) = error.message {
                        message = m;
                    }
                    if let Some(code) = error.code {
                        ctx = ctx.with_code(code.to_string().trim_matches('"'));
                    }
                }
            }

            return Err(ProviderError::provider_with_context(
                self.profile.name,
                message,
                status.as_u16() >= 500,
                ctx,
            ));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider(self.profile.name, format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            return Err(ProviderError::provider(self.profile.name, message, false));
        }

        let choices = parsed.choices.unwrap_or_default();
        if choices.is_empty() {
            return Err(ProviderError::provider(
                self.profile.name,
                "No choices in response",
                false,
            ));
        }

        let completions = choices
            .into_iter()
            .map(|choice| {
                choice
                    .message
                    .and_then(|m| m.content)
                    .map(|c| if structured { extract_structured(c) } else { c })
            })
            .collect();

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            completions,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
        })
    }
}
