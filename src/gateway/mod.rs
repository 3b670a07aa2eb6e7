//! Judge gateway: the uniform `send(messages, k)` contract plus the
//! OpenAI-compatible provider adapter behind it.

pub mod error;
pub mod openai;
pub mod profile;
pub mod retry;
pub mod types;
pub mod usage;

use std::sync::Arc;

use async_trait::async_trait;

use openai::{ChatProvider, OpenAiCompatibleAdapter};
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use profile::ProviderProfile;
pub use retry::RetryPolicy;
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

/// The service that answers forced-choice prompts.
///
/// Returns exactly one entry per requested sample; `None` marks a sample
/// whose content was missing or empty.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn send(
        &self,
        messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError>;
}

#[async_trait]
impl<J: Judge + ?Sized> Judge for Arc<J> {
    async fn send(
        &self,
        messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError> {
        (**self).send(messages, k).await
    }
}

/// Sampling settings applied to every judge call.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Ask for schema-constrained output when the provider supports it.
    pub structured_output: bool,
}

impl JudgeConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 1.0,
            max_tokens: Some(10),
            structured_output: true,
        }
    }
}

/// Judge backed by an OpenAI-compatible endpoint, with usage recording.
pub struct JudgeGateway<U: UsageSink> {
    adapter: OpenAiCompatibleAdapter,
    usage_sink: Arc<U>,
    config: JudgeConfig,
    attribution: Attribution,
}

impl<U: UsageSink> JudgeGateway<U> {
    pub fn new(
        adapter: OpenAiCompatibleAdapter,
        usage_sink: Arc<U>,
        config: JudgeConfig,
        attribution: Attribution,
    ) -> Self {
        Self {
            adapter,
            usage_sink,
            config,
            attribution,
        }
    }

    /// Build from the profile's API key environment variable.
    pub fn from_env(
        profile: ProviderProfile,
        base_url: Option<String>,
        usage_sink: Arc<U>,
        config: JudgeConfig,
        attribution: Attribution,
    ) -> Result<Self, ProviderError> {
        let adapter = OpenAiCompatibleAdapter::from_env(profile, base_url)?;
        Ok(Self::new(adapter, usage_sink, config, attribution))
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    fn build_request(&self, messages: &[Message], k: usize) -> ChatRequest {
        let mut req = ChatRequest::new(
            self.config.model.clone(),
            messages.to_vec(),
            self.attribution.clone(),
        )
        .temperature(self.config.temperature)
        .samples(k);
        if let Some(max) = self.config.max_tokens {
            req = req.max_tokens(max);
        }
        if self.config.structured_output {
            req = req.structured();
        }
        req
    }

    async fn record_usage(&self, req: &ChatRequest, result: &Result<ChatResponse, ProviderError>) {
        let record = ProviderCallRecord::new(
            self.adapter.profile().name,
            req.model.clone(),
            req.attribution.caller,
        )
        .samples(req.n)
        .run(req.attribution.run_id);

        let record = match result {
            Ok(resp) => record
                .tokens(resp.input_tokens, resp.output_tokens)
                .latency(resp.latency.as_millis() as u64),
            Err(err) => record.error(err.code()),
        };

        self.usage_sink.record(record).await;
    }
}

#[async_trait]
impl<U: UsageSink> Judge for JudgeGateway<U> {
    async fn send(
        &self,
        messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError> {
        let req = self.build_request(messages, k);
        let result = self.adapter.chat(&req).await;
        self.record_usage(&req, &result).await;

        let mut texts = result?.texts();
        // Providers may return fewer choices than requested; missing samples
        // count as unparseable rather than silently shrinking the batch.
        texts.resize(k, None);
        Ok(texts)
    }
}
