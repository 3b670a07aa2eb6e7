//! Provider capability descriptors.
//!
//! Each OpenAI-compatible provider differs in a handful of request fields.
//! Rather than branching on the provider name at call time, the adapter is
//! built with a [`ProviderProfile`] that states what the endpoint accepts.

use super::error::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    /// Short provider name used in logs and usage records.
    pub name: &'static str,
    /// Default API root (without `/chat/completions`).
    pub base_url: &'static str,
    /// Environment variable holding the API key.
    pub api_key_env: &'static str,
    /// Endpoint honours `response_format` with a JSON schema.
    pub supports_structured_output: bool,
    /// Endpoint rejects `max_tokens`; the field is left out of the body.
    pub omit_max_tokens: bool,
}

impl ProviderProfile {
    pub const OPENAI: ProviderProfile = ProviderProfile {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        api_key_env: "OPENAI_API_KEY",
        supports_structured_output: true,
        omit_max_tokens: false,
    };

    /// Anthropic's compatibility layer silently ignores `response_format`.
    pub const ANTHROPIC: ProviderProfile = ProviderProfile {
        name: "anthropic",
        base_url: "https://api.anthropic.com/v1",
        api_key_env: "ANTHROPIC_API_KEY",
        supports_structured_output: false,
        omit_max_tokens: false,
    };

    /// Gemini's compatibility endpoint rejects `max_tokens` together with `n`.
    pub const GOOGLE: ProviderProfile = ProviderProfile {
        name: "google",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        api_key_env: "GEMINI_API_KEY",
        supports_structured_output: true,
        omit_max_tokens: true,
    };

    pub const XAI: ProviderProfile = ProviderProfile {
        name: "xai",
        base_url: "https://api.x.ai/v1",
        api_key_env: "XAI_API_KEY",
        supports_structured_output: true,
        omit_max_tokens: false,
    };

    pub const ALL: [ProviderProfile; 4] = [
        Self::OPENAI,
        Self::ANTHROPIC,
        Self::GOOGLE,
        Self::XAI,
    ];

    /// Look up a built-in profile by name (case-insensitive).
    pub fn by_name(name: &str) -> Result<ProviderProfile, ProviderError> {
        let lower = name.to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|p| p.name == lower)
            .cloned()
            .ok_or_else(|| ProviderError::config(format!("unknown provider: {name}")))
    }
}
