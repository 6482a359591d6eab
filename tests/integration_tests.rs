//! Integration tests for the gateway
//!
//! These drive the full router (auth, rate limiting, validation and forwarding) against a mock
//! upstream and check the caller-visible behaviour.

use aff_gateway::auth::API_KEY_HEADER;
use aff_gateway::completion::UpstreamSettings;
use aff_gateway::rate_limit::{ManualClock, RatePolicy};
use aff_gateway::test_utils::MockHttpClient;
use aff_gateway::validation::StructuredOutput;
use aff_gateway::{AppState, GatewaySettings, build_router};
use axum::http::StatusCode;
use axum_test::TestServer;
use rstest::rstest;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt; // for oneshot()

const KEY: &str = "game-secret";

const HI_THERE: &str = r#"{
    "id": "resp_67ccd2bed1ec8190b14f964abc054267",
    "object": "response",
    "status": "completed",
    "model": "gpt-4o-mini-2024-07-18",
    "output": [{
        "type": "message",
        "id": "msg_67ccd2bf17f0819081ff3bb2cf6508e6",
        "status": "completed",
        "role": "assistant",
        "content": [{"type": "output_text", "text": "hi there", "annotations": []}]
    }],
    "usage": {"input_tokens": 5, "output_tokens": 3, "total_tokens": 8}
}"#;

fn settings(structured_output: StructuredOutput) -> GatewaySettings {
    GatewaySettings::builder()
        .api_key(KEY)
        .upstream(
            UpstreamSettings::builder()
                .url("https://api.openai.com/v1/".parse().unwrap())
                .api_key("sk-upstream-secret")
                .build(),
        )
        .structured_output(structured_output)
        .chat_limit(RatePolicy::per_minute(20))
        .build()
}

fn server(
    settings: GatewaySettings,
    client: MockHttpClient,
) -> (TestServer, ManualClock) {
    let clock = ManualClock::new(Duration::from_secs(28_000_000 * 60));
    let state = AppState::with_client_and_clock(settings, client, Arc::new(clock.clone())).unwrap();
    (TestServer::new(build_router(state)).unwrap(), clock)
}

#[rstest]
#[case(None)]
#[case(Some(""))]
#[case(Some("game-secret "))]
#[case(Some("GAME-SECRET"))]
#[tokio::test]
async fn test_bad_credentials_are_unauthorized_regardless_of_body(#[case] key: Option<&str>) {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Disabled), client.clone());

    let mut request = server.post("/chat").json(&json!({"prompt": "hello"}));
    if let Some(key) = key {
        request = request.add_header(API_KEY_HEADER, key);
    }
    let response = request.await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<Value>(), json!({"error": "Unauthorized"}));
    assert!(client.get_requests().is_empty());
}

#[tokio::test]
async fn test_hello_scenario() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Disabled), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>(), json!({"reply": "hi there"}));

    let requests = client.get_requests();
    assert_eq!(requests.len(), 1);
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent["input"], "hello");
    assert_eq!(sent["model"], "gpt-4o-mini");
    assert!(sent.get("text").is_none());
    assert_eq!(
        requests[0].header("authorization"),
        Some("Bearer sk-upstream-secret")
    );
}

#[tokio::test]
async fn test_schema_is_ignored_when_structured_output_is_disabled() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Disabled), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello", "responseSchema": "{not json"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let sent: Value = serde_json::from_slice(&client.get_requests()[0].body).unwrap();
    assert!(sent.get("text").is_none());
}

#[rstest]
#[case(StructuredOutput::Disabled, json!({}))]
#[case(StructuredOutput::Disabled, json!({"prompt": ""}))]
#[case(StructuredOutput::Disabled, json!({"prompt": null}))]
#[case(StructuredOutput::Required, json!({"responseSchema": "{}"}))]
#[tokio::test]
async fn test_missing_prompt_never_reaches_upstream(
    #[case] mode: StructuredOutput,
    #[case] body: Value,
) {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(mode), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&body)
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "Missing 'prompt' in body"})
    );
    assert!(client.get_requests().is_empty());
}

#[tokio::test]
async fn test_empty_body_is_a_missing_prompt() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Disabled), client.clone());

    let response = server.post("/chat").add_header(API_KEY_HEADER, KEY).await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "Missing 'prompt' in body"})
    );
}

#[tokio::test]
async fn test_structured_deployment_requires_a_schema() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Required), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "Missing 'responseSchema' in body"})
    );
    assert!(client.get_requests().is_empty());
}

#[tokio::test]
async fn test_invalid_schema_is_distinct_from_missing_schema() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Required), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello", "responseSchema": "{\"type\": \"object\","}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "Invalid JSON in 'responseSchema'"})
    );
    assert!(client.get_requests().is_empty());
}

#[rstest]
#[case(StructuredOutput::Disabled, json!({"type": "object"}), None)]
#[case(StructuredOutput::Disabled, json!(42), None)]
#[case(StructuredOutput::Optional, json!({"type": "object"}), Some("Invalid JSON in 'responseSchema'"))]
#[case(StructuredOutput::Required, json!({"type": "object"}), Some("Invalid JSON in 'responseSchema'"))]
#[case(StructuredOutput::Required, json!(["type", "object"]), Some("Invalid JSON in 'responseSchema'"))]
#[tokio::test]
async fn test_schema_that_is_not_a_string(
    #[case] mode: StructuredOutput,
    #[case] schema: Value,
    #[case] expected_error: Option<&str>,
) {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(mode), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello", "responseSchema": schema}))
        .await;

    match expected_error {
        None => {
            assert_eq!(response.status_code(), StatusCode::OK);
            assert_eq!(response.json::<Value>(), json!({"reply": "hi there"}));
            let sent: Value = serde_json::from_slice(&client.get_requests()[0].body).unwrap();
            assert!(sent.get("text").is_none());
        }
        Some(message) => {
            assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
            assert_eq!(response.json::<Value>(), json!({"error": message}));
            assert!(client.get_requests().is_empty());
        }
    }
}

#[tokio::test]
async fn test_form_body_is_a_missing_prompt() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Disabled), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .text("prompt=hello")
        .content_type("application/x-www-form-urlencoded")
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "Missing 'prompt' in body"})
    );
    assert!(client.get_requests().is_empty());
}

#[tokio::test]
async fn test_structured_request_is_forwarded_with_schema() {
    let schema = json!({
        "title": "NpcLine",
        "type": "object",
        "properties": {"line": {"type": "string"}, "mood": {"type": "string"}},
        "required": ["line", "mood"],
        "additionalProperties": false
    });
    let upstream = json!({
        "output": [{
            "type": "message",
            "content": [{"type": "output_text", "text": "{\"line\":\"Well met\",\"mood\":\"warm\"}"}]
        }]
    })
    .to_string();
    let client = MockHttpClient::new(StatusCode::OK, &upstream);
    let (server, _clock) = server(settings(StructuredOutput::Required), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "greet the player", "responseSchema": schema.to_string()}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>(),
        json!({"reply": "{\"line\":\"Well met\",\"mood\":\"warm\"}"})
    );

    let requests = client.get_requests();
    assert_eq!(requests.len(), 1);
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent["input"], "greet the player");
    assert_eq!(
        sent["text"]["format"],
        json!({"type": "json_schema", "name": "NpcLine", "schema": schema, "strict": true})
    );
}

#[tokio::test]
async fn test_untitled_schema_uses_fallback_name() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, _clock) = server(settings(StructuredOutput::Optional), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello", "responseSchema": "{\"type\": \"object\"}"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let sent: Value = serde_json::from_slice(&client.get_requests()[0].body).unwrap();
    assert_eq!(sent["text"]["format"]["name"], "structured_response");
}

#[rstest]
#[case(MockHttpClient::new(StatusCode::UNAUTHORIZED, r#"{"error": {"message": "Incorrect API key provided: sk-upstream-secret"}}"#))]
#[case(MockHttpClient::new(StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded"))]
#[case(MockHttpClient::new(StatusCode::OK, r#"{"output": []}"#))]
#[case(MockHttpClient::new(StatusCode::OK, r#"{"output": [{"type": "reasoning", "summary": []}]}"#))]
#[case(MockHttpClient::new(StatusCode::OK, "not json at all"))]
#[case(MockHttpClient::failing("dns error: no such host api.openai.com"))]
#[tokio::test]
async fn test_upstream_failures_are_generic_500s(#[case] client: MockHttpClient) {
    let (server, _clock) = server(settings(StructuredOutput::Disabled), client.clone());

    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "OpenAI request failed"})
    );
    let text = response.text();
    assert!(!text.contains("sk-upstream-secret"));
    assert!(!text.contains("exploded"));
    assert_eq!(client.get_requests().len(), 1);
}

#[tokio::test]
async fn test_quota_exhaustion_and_recovery() {
    let settings = GatewaySettings {
        chat_limit: RatePolicy::per_minute(3),
        ..settings(StructuredOutput::Disabled)
    };
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, clock) = server(settings, client.clone());

    for remaining in ["2", "1", "0"] {
        let response = server
            .post("/chat")
            .add_header(API_KEY_HEADER, KEY)
            .json(&json!({"prompt": "hello"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("ratelimit-remaining"), remaining);
    }

    clock.advance(Duration::from_secs(45));
    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "Too many requests, slow down."})
    );
    assert_eq!(response.header("retry-after"), "15");
    assert_eq!(response.header("ratelimit-reset"), "15");
    assert_eq!(client.get_requests().len(), 3);

    clock.advance(Duration::from_secs(15));
    let response = server
        .post("/chat")
        .add_header(API_KEY_HEADER, KEY)
        .json(&json!({"prompt": "hello"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.header("ratelimit-remaining"), "2");
    assert_eq!(client.get_requests().len(), 4);
}

#[tokio::test]
async fn test_ping_budget() {
    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let (server, clock) = server(settings(StructuredOutput::Disabled), client);

    for _ in 0..10 {
        let response = server.get("/ping").add_header(API_KEY_HEADER, KEY).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>(), json!({"ok": true}));
    }
    let response = server.get("/ping").add_header(API_KEY_HEADER, KEY).await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(Duration::from_secs(60));
    let response = server.get("/ping").add_header(API_KEY_HEADER, KEY).await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_peer_address_keys_the_rate_limit() {
    use axum::extract::ConnectInfo;
    use std::net::SocketAddr;

    let client = MockHttpClient::new(StatusCode::OK, HI_THERE);
    let clock = ManualClock::new(Duration::from_secs(60));
    let state = AppState::with_client_and_clock(
        settings(StructuredOutput::Disabled),
        client,
        Arc::new(clock),
    )
    .unwrap();
    let app = build_router(state);

    let ping_from = |peer: &str| {
        let mut request = axum::http::Request::builder()
            .uri("/ping")
            .header(API_KEY_HEADER, KEY)
            .body(axum::body::Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        request
    };

    for port in 0..10u16 {
        // Different source ports from the same host share a budget.
        let response = app
            .clone()
            .oneshot(ping_from(&format!("198.51.100.7:{}", 40_000 + port)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(ping_from("198.51.100.7:50000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app
        .clone()
        .oneshot(ping_from("198.51.100.8:50000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
