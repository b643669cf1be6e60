use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use chat_gateway::config::{AdmissionPolicyKind, Config};
use chat_gateway::llm::BackendError;
use chat_gateway::routes;
use chat_gateway::test_util::{create_test_state, login_token, test_config, Reply, ScriptedBackend, StreamEnd};
use chat_gateway::AppState;
use chat_gateway_common::{stream_event, ErrorBody, ErrorCode, StreamChunk};
use http::{header, HeaderMap, Method, StatusCode};
use rstest::rstest;
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    backend: Arc<ScriptedBackend>,
}

fn test_app_with(config: Config, backend: ScriptedBackend) -> TestApp {
    let backend = Arc::new(backend);
    let state = create_test_state(config, backend.clone());
    TestApp {
        app: routes::app(state.clone()),
        state,
        backend,
    }
}

fn test_app(backend: ScriptedBackend) -> TestApp {
    test_app_with(test_config(), backend)
}

struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl TestResponse {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn error_code(&self) -> ErrorCode {
        serde_json::from_slice::<ErrorBody>(&self.body).unwrap().error.code
    }

    fn text(&self) -> String {
        String::from_utf8(self.body.to_vec()).unwrap()
    }
}

async fn send_raw(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Bytes>,
) -> TestResponse {
    let mut req_builder = http::Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        req_builder = req_builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    if body.is_some() {
        req_builder = req_builder.header(header::CONTENT_TYPE, "application/json");
    }

    let req = req_builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap();

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    TestResponse {
        status,
        headers,
        body,
    }
}

async fn post(app: &Router, uri: &str, token: Option<&str>, body: Value) -> TestResponse {
    send_raw(app, Method::POST, uri, token, Some(Bytes::from(body.to_string()))).await
}

/// `(event, data)` pairs, skipping keep-alive comments.
fn parse_sse(body: &str) -> Vec<(String, String)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                }
            }
            event.map(|e| (e, data.join("\n")))
        })
        .collect()
}

fn chunk_text(data: &str) -> String {
    serde_json::from_str::<StreamChunk>(data).unwrap().text
}

// ---------------------------------------------------------------------------
// Accounts and sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_login_logout_flow() {
    let t = test_app(ScriptedBackend::new());
    let credentials = json!({"username": "alice", "password": "correct horse battery"});

    let registered = post(&t.app, "/register", None, credentials.clone()).await;
    assert_eq!(registered.status, StatusCode::CREATED);
    assert_eq!(registered.json()["username"], "alice");

    let login = post(&t.app, "/login", None, credentials).await;
    assert_eq!(login.status, StatusCode::OK);
    let login = login.json();
    let token = login["token"].as_str().unwrap().to_string();
    assert_eq!(token.len(), 64);
    assert_eq!(login["user_id"], registered.json()["user_id"]);
    assert!(login["expires_at"].is_string());

    let chat = post(&t.app, "/chat", Some(&token), json!({"prompt": "Hello"})).await;
    assert_eq!(chat.status, StatusCode::OK);

    let logout = post(&t.app, "/logout", None, json!({"token": token})).await;
    assert_eq!(logout.status, StatusCode::OK);
    assert_eq!(logout.json()["revoked"], true);

    let chat = post(&t.app, "/chat", Some(&token), json!({"prompt": "Hello"})).await;
    assert_eq!(chat.status, StatusCode::UNAUTHORIZED);
    assert_eq!(t.backend.calls(), 1);
}

#[tokio::test]
async fn test_duplicate_username_is_conflict() {
    let t = test_app(ScriptedBackend::new());
    let credentials = json!({"username": "bob", "password": "correct horse battery"});

    assert_eq!(post(&t.app, "/register", None, credentials.clone()).await.status, StatusCode::CREATED);
    let again = post(&t.app, "/register", None, credentials).await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(again.error_code(), ErrorCode::UsernameTaken);
}

#[rstest]
#[case(json!({"username": "ab", "password": "correct horse battery"}))]
#[case(json!({"username": "has space", "password": "correct horse battery"}))]
#[case(json!({"username": "carol", "password": "short"}))]
#[case(json!({"username": "carol"}))]
#[tokio::test]
async fn test_register_rejects_bad_input(#[case] body: Value) {
    let t = test_app(ScriptedBackend::new());
    let response = post(&t.app, "/register", None, body).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_code(), ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn test_login_with_wrong_password_or_unknown_user() {
    let t = test_app(ScriptedBackend::new());
    login_token(&t.state, "dave").await;

    let wrong = post(&t.app, "/login", None, json!({"username": "dave", "password": "not the password"})).await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.error_code(), ErrorCode::InvalidCredentials);

    let unknown = post(&t.app, "/login", None, json!({"username": "nobody", "password": "whatever123"})).await;
    assert_eq!(unknown.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown.error_code(), ErrorCode::InvalidCredentials);
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let t = test_app(ScriptedBackend::new());
    let token = login_token(&t.state, "erin").await;

    let first = send_raw(&t.app, Method::POST, "/logout", Some(&token), None).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.json()["revoked"], true);

    let second = send_raw(&t.app, Method::POST, "/logout", Some(&token), None).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.json()["revoked"], false);

    let unknown = post(&t.app, "/logout", None, json!({"token": "never-issued"})).await;
    assert_eq!(unknown.status, StatusCode::OK);
    assert_eq!(unknown.json()["revoked"], false);

    let anonymous = send_raw(&t.app, Method::POST, "/logout", None, None).await;
    assert_eq!(anonymous.status, StatusCode::OK);
    assert_eq!(anonymous.json()["revoked"], false);
}

// ---------------------------------------------------------------------------
// POST /chat
// ---------------------------------------------------------------------------

#[rstest]
#[case(None)]
#[case(Some("not-a-real-token"))]
#[tokio::test]
async fn test_chat_requires_valid_session(#[case] token: Option<&str>) {
    let t = test_app(ScriptedBackend::new());

    let response = post(&t.app, "/chat", token, json!({"prompt": "Hello"})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_code(), ErrorCode::Unauthorized);
    assert_eq!(response.headers[header::WWW_AUTHENTICATE], "Bearer");
    assert_eq!(t.backend.calls(), 0);
}

#[tokio::test]
async fn test_chat_returns_response_and_model() {
    let backend = ScriptedBackend::new();
    backend.push(Reply::text("Hi there!"));
    let t = test_app(backend);
    let token = login_token(&t.state, "frank").await;

    let response = post(
        &t.app,
        "/chat",
        Some(&token),
        json!({"prompt": "Hello", "temperature": 0.3, "max_tokens": 32}),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!({"response": "Hi there!", "model": "scripted"}));
    assert_eq!(t.backend.prompts(), vec!["Hello"]);
}

#[rstest]
#[case(json!({"prompt": ""}))]
#[case(json!({"prompt": "   "}))]
#[case(json!({"prompt": "Hi", "temperature": 2.0}))]
#[case(json!({"prompt": "Hi", "max_tokens": 0}))]
#[case(json!({"message": "wrong field"}))]
#[tokio::test]
async fn test_chat_rejects_invalid_request(#[case] body: Value) {
    let t = test_app(ScriptedBackend::new());
    let token = login_token(&t.state, "grace").await;

    let response = post(&t.app, "/chat", Some(&token), body).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_code(), ErrorCode::InvalidRequest);
    assert_eq!(t.backend.calls(), 0);
}

#[tokio::test]
async fn test_malformed_body_without_session_is_unauthorized() {
    let t = test_app(ScriptedBackend::new());

    let response = send_raw(&t.app, Method::POST, "/chat", None, Some(Bytes::from("{not json"))).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[rstest]
#[case(BackendError::Timeout("deadline elapsed".into()), StatusCode::GATEWAY_TIMEOUT, ErrorCode::BackendTimeout)]
#[case(BackendError::Unavailable("connection refused 10.1.2.3".into()), StatusCode::SERVICE_UNAVAILABLE, ErrorCode::BackendUnavailable)]
#[case(BackendError::InvalidResponse("404 model not found".into()), StatusCode::BAD_GATEWAY, ErrorCode::BackendInvalidResponse)]
#[tokio::test]
async fn test_backend_failures_map_to_stable_codes(
    #[case] failure: BackendError,
    #[case] status: StatusCode,
    #[case] code: ErrorCode,
) {
    let backend = ScriptedBackend::new();
    backend.push(Reply::Fail(failure));
    let t = test_app(backend);
    let token = login_token(&t.state, "heidi").await;

    let response = post(&t.app, "/chat", Some(&token), json!({"prompt": "Hello"})).await;
    assert_eq!(response.status, status);
    assert_eq!(response.error_code(), code);
    assert!(!response.text().contains("10.1.2.3"));
    assert_eq!(t.state.router.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_capacity_exceeded_sets_retry_after() {
    let mut config = test_config();
    config.admission.max_in_flight = 1;
    config.admission.policy = AdmissionPolicyKind::Reject;
    let t = test_app_with(config, ScriptedBackend::new().with_fallback(Reply::text("ok").held()));
    let token = login_token(&t.state, "ivan").await;

    let busy = {
        let app = t.app.clone();
        let token = token.clone();
        tokio::spawn(async move { post(&app, "/chat", Some(&token), json!({"prompt": "first"})).await })
    };
    while t.backend.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let rejected = post(&t.app, "/chat", Some(&token), json!({"prompt": "second"})).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(rejected.error_code(), ErrorCode::CapacityExceeded);
    assert_eq!(rejected.headers[header::RETRY_AFTER], "1");

    t.backend.release();
    assert_eq!(busy.await.unwrap().status, StatusCode::OK);
    assert_eq!(t.state.router.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let mut config = test_config();
    config.rate_limit.requests_per_minute = Some(1);
    let t = test_app_with(config, ScriptedBackend::new());
    let token = login_token(&t.state, "judy").await;

    assert_eq!(post(&t.app, "/chat", Some(&token), json!({"prompt": "a"})).await.status, StatusCode::OK);

    let limited = post(&t.app, "/chat", Some(&token), json!({"prompt": "b"})).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.error_code(), ErrorCode::RateLimited);
    assert!(limited.headers.contains_key(header::RETRY_AFTER));
    assert_eq!(t.backend.calls(), 1);
}

// ---------------------------------------------------------------------------
// POST /chat/stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stream_relays_chunks_in_order_then_done() {
    let backend = ScriptedBackend::new();
    backend.push(Reply::stream(&["Once", " upon", " a time\n", "\r\nThe end"], StreamEnd::Done));
    let t = test_app(backend);
    let token = login_token(&t.state, "mallory").await;

    let response = post(&t.app, "/chat/stream", Some(&token), json!({"prompt": "Tell a story"})).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = parse_sse(&response.text());
    let names: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
    assert_eq!(names, vec!["chunk", "chunk", "chunk", "chunk", "done"]);

    let text: String = events[..4].iter().map(|(_, data)| chunk_text(data)).collect();
    assert_eq!(text, "Once upon a time\n\r\nThe end");
    assert_eq!(events[4].1, stream_event::DONE_DATA);
    assert_eq!(t.state.router.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_stream_backend_disconnect_ends_with_error_event() {
    let backend = ScriptedBackend::new();
    backend.push(Reply::stream(&["a", "b", "c"], StreamEnd::Disconnect));
    let t = test_app(backend);
    let token = login_token(&t.state, "niaj").await;

    let response = post(&t.app, "/chat/stream", Some(&token), json!({"prompt": "Go"})).await;
    assert_eq!(response.status, StatusCode::OK);

    let events = parse_sse(&response.text());
    assert_eq!(events.len(), 4);
    assert_eq!(chunk_text(&events[2].1), "c");
    assert_eq!(events[3].0, stream_event::ERROR);
    let error: ErrorBody = serde_json::from_str(&events[3].1).unwrap();
    assert_eq!(error.error.code, ErrorCode::BackendStreamError);
    assert!(events.iter().all(|(e, _)| e != stream_event::DONE));
    assert_eq!(t.state.router.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_stream_open_failure_is_plain_error_response() {
    let backend = ScriptedBackend::new();
    backend.push(Reply::Fail(BackendError::Unavailable("refused".into())));
    let t = test_app(backend);
    let token = login_token(&t.state, "olivia").await;

    let response = post(&t.app, "/chat/stream", Some(&token), json!({"prompt": "Go"})).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.error_code(), ErrorCode::BackendUnavailable);
}

#[tokio::test]
async fn test_stream_requires_session() {
    let t = test_app(ScriptedBackend::new());

    let response = post(&t.app, "/chat/stream", None, json!({"prompt": "Go"})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(t.backend.calls(), 0);
}

// ---------------------------------------------------------------------------
// /chats
// ---------------------------------------------------------------------------

async fn create_chat(t: &TestApp, token: &str) -> String {
    let response = send_raw(&t.app, Method::POST, "/chats", Some(token), None).await;
    assert_eq!(response.status, StatusCode::CREATED);
    response.json()["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_chats_create_list_delete() {
    let t = test_app(ScriptedBackend::new());
    let token = login_token(&t.state, "peggy").await;

    let first = create_chat(&t, &token).await;
    let second = create_chat(&t, &token).await;

    let listed = send_raw(&t.app, Method::GET, "/chats", Some(&token), None).await;
    assert_eq!(listed.status, StatusCode::OK);
    let ids: Vec<String> = listed
        .json()
        .as_array()
        .unwrap()
        .iter()
        .map(|chat| chat["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first) && ids.contains(&second));

    let deleted = send_raw(&t.app, Method::DELETE, &format!("/chats/{}", first), Some(&token), None).await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    let again = send_raw(&t.app, Method::DELETE, &format!("/chats/{}", first), Some(&token), None).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert_eq!(again.error_code(), ErrorCode::ChatNotFound);

    let listed = send_raw(&t.app, Method::GET, "/chats", Some(&token), None).await;
    assert_eq!(listed.json().as_array().unwrap().len(), 1);
}

#[rstest]
#[case(Method::POST, "/chats")]
#[case(Method::GET, "/chats")]
#[case(Method::DELETE, "/chats/some-id")]
#[case(Method::GET, "/chats/some-id/messages")]
#[tokio::test]
async fn test_chats_require_session(#[case] method: Method, #[case] uri: &str) {
    let t = test_app(ScriptedBackend::new());
    let response = send_raw(&t.app, method, uri, None, None).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_code(), ErrorCode::Unauthorized);
}

#[tokio::test]
async fn test_other_users_chat_is_not_found() {
    let t = test_app(ScriptedBackend::new());
    let owner = login_token(&t.state, "rupert").await;
    let intruder = login_token(&t.state, "sybil").await;
    let chat_id = create_chat(&t, &owner).await;

    let messages_uri = format!("/chats/{}/messages", chat_id);
    let peek = send_raw(&t.app, Method::GET, &messages_uri, Some(&intruder), None).await;
    assert_eq!(peek.status, StatusCode::NOT_FOUND);
    assert_eq!(peek.error_code(), ErrorCode::ChatNotFound);

    let chat_uri = format!("/chats/{}", chat_id);
    let delete = send_raw(&t.app, Method::DELETE, &chat_uri, Some(&intruder), None).await;
    assert_eq!(delete.status, StatusCode::NOT_FOUND);

    let hijack = post(&t.app, "/chat", Some(&intruder), json!({"prompt": "Hi", "chat_id": chat_id})).await;
    assert_eq!(hijack.status, StatusCode::NOT_FOUND);
    assert_eq!(t.backend.calls(), 0);

    let listed = send_raw(&t.app, Method::GET, "/chats", Some(&intruder), None).await;
    assert_eq!(listed.json(), json!([]));

    let own = send_raw(&t.app, Method::GET, &messages_uri, Some(&owner), None).await;
    assert_eq!(own.status, StatusCode::OK);
    assert_eq!(own.json(), json!([]));
}

#[tokio::test]
async fn test_chat_with_chat_id_records_both_turns() {
    let backend = ScriptedBackend::new();
    backend.push(Reply::text("Nice to meet you, Trent."));
    backend.push(Reply::text("Your name is Trent."));
    let t = test_app(backend);
    let token = login_token(&t.state, "trent").await;
    let chat_id = create_chat(&t, &token).await;

    let first = post(&t.app, "/chat", Some(&token), json!({"prompt": "I am Trent", "chat_id": chat_id})).await;
    assert_eq!(first.status, StatusCode::OK);
    let second = post(&t.app, "/chat", Some(&token), json!({"prompt": "Who am I?", "chat_id": chat_id})).await;
    assert_eq!(second.json()["response"], "Your name is Trent.");

    let context = &t.backend.conversations()[1];
    assert_eq!(context.len(), 3);
    assert_eq!(context[1].content, "Nice to meet you, Trent.");

    let messages = send_raw(&t.app, Method::GET, &format!("/chats/{}/messages", chat_id), Some(&token), None).await;
    assert_eq!(messages.status, StatusCode::OK);
    let turns: Vec<(String, String)> = messages
        .json()
        .as_array()
        .unwrap()
        .iter()
        .map(|m| (m["role"].as_str().unwrap().to_string(), m["content"].as_str().unwrap().to_string()))
        .collect();
    assert_eq!(
        turns,
        vec![
            ("user".to_string(), "I am Trent".to_string()),
            ("assistant".to_string(), "Nice to meet you, Trent.".to_string()),
            ("user".to_string(), "Who am I?".to_string()),
            ("assistant".to_string(), "Your name is Trent.".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_stream_with_chat_id_records_full_answer() {
    let backend = ScriptedBackend::new();
    backend.push(Reply::stream(&["Hello", ", ", "Victor"], StreamEnd::Done));
    let t = test_app(backend);
    let token = login_token(&t.state, "victor").await;
    let chat_id = create_chat(&t, &token).await;

    let response = post(&t.app, "/chat/stream", Some(&token), json!({"prompt": "Greet me", "chat_id": chat_id})).await;
    assert_eq!(response.status, StatusCode::OK);
    let events = parse_sse(&response.text());
    assert_eq!(events.last().unwrap().0, stream_event::DONE);

    let messages = send_raw(&t.app, Method::GET, &format!("/chats/{}/messages", chat_id), Some(&token), None).await;
    let messages = messages.json();
    assert_eq!(messages.as_array().unwrap().len(), 2);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "Hello, Victor");
}

#[tokio::test]
async fn test_stream_with_unknown_chat_id_is_not_found() {
    let t = test_app(ScriptedBackend::new());
    let token = login_token(&t.state, "walter").await;

    let response = post(&t.app, "/chat/stream", Some(&token), json!({"prompt": "Go", "chat_id": "missing"})).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.error_code(), ErrorCode::ChatNotFound);
    assert_eq!(t.backend.calls(), 0);
    assert_eq!(t.state.router.admission().in_flight(), 0);
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_reports_backend_and_capacity() {
    let t = test_app(ScriptedBackend::new());

    let response = send_raw(&t.app, Method::GET, "/health", None, None).await;
    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["capacity"], 4);
    assert_eq!(body["in_flight"], 0);
}

#[tokio::test]
async fn test_nonexistent_route_returns_404() {
    let t = test_app(ScriptedBackend::new());
    let response = send_raw(&t.app, Method::GET, "/nonexistent", None, None).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
