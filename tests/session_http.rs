use std::{sync::Arc, time::Duration};

use serde_json::json;
use template_trainer::{
    eval::EvalConfig, score::Reason, Category, Evaluator, HttpBackend, InferenceRequest,
    ModelOutput, Prompt, ServerSession, SessionConfig, SessionError, SessionState, TestSuite,
};
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn quick_session(server: &MockServer) -> ServerSession {
    let backend = Arc::new(HttpBackend::new(server.uri()).unwrap());
    ServerSession::new(
        backend,
        SessionConfig::default()
            .with_readiness_retries(3)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(10)),
    )
}

async fn healthy_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn loading_server_never_becomes_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": {"code": 503, "message": "Loading model"}
        })))
        .mount(&server)
        .await;

    let mut session = quick_session(&server);
    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::ServerUnavailable { attempts: 3, .. }));
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn liveliness_fallback_counts_as_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health/liveliness"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("I'm alive!")))
        .mount(&server)
        .await;

    let mut session = quick_session(&server);
    session.start().await.unwrap();
    assert!(session.is_ready());
}

#[tokio::test]
async fn chat_completion_returns_native_calls() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"tool_choice": "auto", "temperature": 0.0})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"location\":\"Boston\"}"}
                    }]
                }
            }]
        })))
        .mount(&server)
        .await;

    let suite = TestSuite::builtin().unwrap();
    let case = suite.get("basic/weather-lookup").unwrap();
    let mut session = quick_session(&server);
    session.start().await.unwrap();

    let request = InferenceRequest::new(Prompt::Chat {
        messages: case.messages.clone(),
        tools: case.tools.clone(),
    });
    let output = session.complete(&request, Duration::from_secs(5)).await.unwrap();
    match output {
        ModelOutput::Native { calls, .. } => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "get_weather");
        }
        other => panic!("expected native output, got {other:?}"),
    }
}

#[tokio::test]
async fn raw_completion_sends_rendered_prompt() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .and(body_partial_json(json!({"prompt": "User: hi\nAssistant:", "n_predict": 64})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "<tool_call>{\"name\": \"get_weather\", \"arguments\": {\"location\": \"Boston\"}}</tool_call>",
            "stop": true
        })))
        .mount(&server)
        .await;

    let mut session = quick_session(&server);
    session.start().await.unwrap();

    let request =
        InferenceRequest::new(Prompt::Text("User: hi\nAssistant:".to_string())).with_max_tokens(64);
    let output = session.complete(&request, Duration::from_secs(5)).await.unwrap();
    assert!(output.raw_text().contains("get_weather"));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn server_error_envelope_is_reported() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "message": "the request exceeds the available context size"}
        })))
        .mount(&server)
        .await;

    let mut session = quick_session(&server);
    session.start().await.unwrap();
    let err = session
        .complete(&InferenceRequest::new(Prompt::Text("x".into())), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds the available context size"));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn stalled_completion_fails_only_its_case() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"content": "too late"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let suite = TestSuite::builtin()
        .unwrap()
        .filter_categories(&[Category::Context]);
    let mut session = quick_session(&server);
    session.start().await.unwrap();

    let evaluator =
        Evaluator::new(EvalConfig::default().with_request_timeout(Duration::from_secs(2)));
    let template = "{% for message in messages %}{{ message.role }}: {{ message.content }}\n{% endfor %}";
    let evaluation = evaluator.evaluate(&mut session, template, &suite).await;

    assert_eq!(evaluation.total(), suite.len());
    assert!(!evaluation.aborted);
    for result in evaluation.results() {
        assert!(!result.passed);
        assert!(matches!(
            result.reasons[0],
            Reason::RequestTimeout { after_ms: 2_000 }
        ));
    }
    assert_eq!(session.state(), SessionState::Ready);
}
