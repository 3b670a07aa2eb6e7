use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use utility_harness::gateway::openai::OpenAiCompatibleAdapter;
use utility_harness::gateway::usage::{CallStatus, ProviderCallRecord};
use utility_harness::gateway::{
    Attribution, Judge, JudgeConfig, JudgeGateway, Message, NoopUsageSink, ProviderError,
    ProviderProfile, RetryPolicy, UsageSink,
};

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

#[async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn gateway<U: UsageSink>(
    server: &MockServer,
    profile: ProviderProfile,
    sink: Arc<U>,
) -> JudgeGateway<U> {
    let adapter =
        OpenAiCompatibleAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), profile)
            .unwrap();
    JudgeGateway::new(
        adapter,
        sink,
        JudgeConfig::new("test-model"),
        Attribution::new("test"),
    )
}

fn messages() -> Vec<Message> {
    vec![Message::system("sys"), Message::user("A or B?")]
}

async fn last_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.unwrap();
    let last = requests.last().unwrap();
    serde_json::from_slice(&last.body).unwrap()
}

#[tokio::test]
async fn structured_profile_requests_schema_and_extracts_preference() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [
                { "message": { "content": "{\"preference\": \"A\"}" }, "finish_reason": "stop" },
                { "message": { "content": "{\"preference\": \"B\"}" }, "finish_reason": "stop" },
                { "message": { "content": "B" }, "finish_reason": "stop" }
            ],
            "usage": { "prompt_tokens": 12, "completion_tokens": 9 }
        })))
        .mount(&server)
        .await;

    let sink = Arc::new(CollectingSink::default());
    let judge = gateway(&server, ProviderProfile::OPENAI, sink.clone());
    let texts = judge.send(&messages(), 3).await.unwrap();
    assert_eq!(
        texts,
        vec![Some("A".to_string()), Some("B".to_string()), Some("B".to_string())]
    );

    let body = last_body(&server).await;
    assert_eq!(body["n"], 3);
    assert_eq!(body["max_tokens"], 10);
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["response_format"]["type"], "json_schema");

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Success);
    assert_eq!(records[0].samples, 3);
    assert_eq!((records[0].input_tokens, records[0].output_tokens), (12, 9));
}

#[tokio::test]
async fn unstructured_profile_returns_raw_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "  A \n" }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let judge = gateway(&server, ProviderProfile::ANTHROPIC, Arc::new(NoopUsageSink));
    let texts = judge.send(&messages(), 1).await.unwrap();
    assert_eq!(texts, vec![Some("A".to_string())]);

    let body = last_body(&server).await;
    assert!(body.get("response_format").is_none());
}

#[tokio::test]
async fn omit_max_tokens_profile_drops_the_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "B" } }]
        })))
        .mount(&server)
        .await;

    let judge = gateway(&server, ProviderProfile::GOOGLE, Arc::new(NoopUsageSink));
    judge.send(&messages(), 1).await.unwrap();

    let body = last_body(&server).await;
    assert!(body.get("max_tokens").is_none());
    assert_eq!(body["temperature"], 1.0);
}

#[tokio::test]
async fn missing_samples_are_padded_as_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [
                { "message": { "content": "" } },
                { "message": { "content": null } }
            ]
        })))
        .mount(&server)
        .await;

    let judge = gateway(&server, ProviderProfile::ANTHROPIC, Arc::new(NoopUsageSink));
    let texts = judge.send(&messages(), 4).await.unwrap();
    assert_eq!(texts, vec![None, None, None, None]);
}

#[tokio::test]
async fn http_errors_map_to_provider_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": { "message": "overloaded" }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": "model_not_found" }
        })))
        .mount(&server)
        .await;

    let sink = Arc::new(CollectingSink::default());
    let judge = gateway(&server, ProviderProfile::OPENAI, sink.clone());

    let err = judge.send(&messages(), 1).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }));

    let err = judge.send(&messages(), 1).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("overloaded"));

    let err = judge.send(&messages(), 1).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.context().and_then(|c| c.provider_code.as_deref()), Some("model_not_found"));

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == CallStatus::Error));
}

#[tokio::test]
async fn retry_policy_recovers_from_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "A" } }]
        })))
        .mount(&server)
        .await;

    let judge = gateway(&server, ProviderProfile::ANTHROPIC, Arc::new(NoopUsageSink));
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    let msgs = messages();
    let texts = policy.run(|| judge.send(&msgs, 1)).await.unwrap();
    assert_eq!(texts, vec![Some("A".to_string())]);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn retry_policy_gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let judge = gateway(&server, ProviderProfile::OPENAI, Arc::new(NoopUsageSink));
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    let msgs = messages();
    let err = policy.run(|| judge.send(&msgs, 1)).await.unwrap_err();
    // Even non-retryable provider errors are retried.
    assert!(matches!(err, ProviderError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}
