use super::{
    api::{AbortResponse, ErrorBody, ModelInfo},
    handler::{CompletionService, REQUEST_ID_HEADER},
};
use crate::server::{config::ServerConfig, engine::EchoEngine};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use braid::{AggregateResponse, ErrorCategory};
use core::time::Duration;
use std::sync::Arc;
use tower::ServiceExt;

fn config() -> ServerConfig {
    ServerConfig {
        server_addr: "127.0.0.1:0".to_string(),
        max_choices: 4,
        stream_buffer_size: 16,
        disconnect_poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(200),
        model_name: "echo".to_string(),
        token_delay: Duration::ZERO,
    }
}

fn service() -> CompletionService {
    let config = config();
    let engine = Arc::new(EchoEngine::new(config.model_name.clone(), config.token_delay));
    CompletionService::new(config, engine)
}

fn completion(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn abort(request_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/abort")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!(r#"{{"request_id": "{request_id}"}}"#)))
        .unwrap()
}

async fn call(app: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Payloads of the `data:` lines of an SSE body.
fn sse_data(body: &str) -> Vec<&str> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .collect()
}

#[tokio::test]
async fn batch_completion_returns_every_choice() {
    let (status, body) = call(
        service().router(),
        completion(r#"{"prompt": "hello there", "n": 3}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let response: AggregateResponse = serde_json::from_str(&body).unwrap();
    assert!(response.id.starts_with("cmpl-"));
    assert_eq!(response.model, "echo");
    assert_eq!(response.choices.len(), 3);
    assert!(response.choices.iter().all(|c| c.text == "hello there"));
    assert_eq!(response.usage.total_tokens, 4);
}

#[tokio::test]
async fn streaming_completion_ends_with_done() {
    let (status, body) = call(
        service().router(),
        completion(r#"{"prompt": "hello there", "n": 2, "stream": true}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let data = sse_data(&body);
    assert_eq!(data.last(), Some(&"[DONE]"));

    let fragments: Vec<AggregateResponse> = data[..data.len() - 1]
        .iter()
        .map(|payload| serde_json::from_str(payload).unwrap())
        .collect();
    assert_eq!(fragments.len(), 4);

    let terminal = fragments
        .iter()
        .filter(|f| f.choices[0].finish_reason.is_some())
        .count();
    assert_eq!(terminal, 2);
}

#[tokio::test]
async fn too_many_choices_is_rejected() {
    let (status, body) = call(
        service().router(),
        completion(r#"{"prompt": "hi", "n": 5}"#),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: ErrorBody = serde_json::from_str(&body).unwrap();
    assert_eq!(body.error.category, ErrorCategory::InvalidRequest);
}

#[tokio::test]
async fn zero_choices_is_rejected() {
    let (status, _) = call(
        service().router(),
        completion(r#"{"prompt": "hi", "n": 0}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let (status, body) = call(service().router(), completion(r#"{"n": 1}"#)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: ErrorBody = serde_json::from_str(&body).unwrap();
    assert_eq!(body.error.category, ErrorCategory::InvalidRequest);
}

#[tokio::test]
async fn shutdown_flips_health_and_refuses_requests() {
    let service = service();

    let health = || {
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = call(service.clone().router(), health()).await;
    assert_eq!(status, StatusCode::OK);

    service.shutdown().await;
    assert!(service.is_shutting_down());
    assert_eq!(service.requests_inflight(), 0);

    let (status, _) = call(service.clone().router(), health()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = call(
        service.router(),
        completion(r#"{"prompt": "hi", "stream": true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: ErrorBody = serde_json::from_str(&body).unwrap();
    assert_eq!(body.error.category, ErrorCategory::ServiceUnavailable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_slow_streams_after_timeout() {
    let config = config();
    let engine = Arc::new(EchoEngine::new("echo", Duration::from_millis(50)));
    let service = CompletionService::new(config, engine);

    let prompt = vec!["word"; 200].join(" ");
    let request = completion(&format!(r#"{{"prompt": "{prompt}", "stream": true}}"#));
    let pending = tokio::spawn(call(service.clone().router(), request));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.requests_inflight(), 1);

    service.shutdown().await;
    let (status, body) = pending.await.unwrap();

    assert_eq!(status, StatusCode::OK);
    let last = *sse_data(&body).last().unwrap();
    let error: ErrorBody = serde_json::from_str(last).unwrap();
    assert_eq!(error.error.category, ErrorCategory::ServiceUnavailable);
}

#[tokio::test]
async fn model_endpoint_reports_the_served_model() {
    let request = Request::builder()
        .uri("/v1/model")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(service().router(), request).await;

    assert_eq!(status, StatusCode::OK);
    let info: ModelInfo = serde_json::from_str(&body).unwrap();
    assert_eq!(info.model, "echo");
}

#[tokio::test]
async fn request_id_header_matches_response_id() {
    let response = service()
        .router()
        .oneshot(completion(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();

    let request_id = response.headers()[REQUEST_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: AggregateResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.id, format!("cmpl-{request_id}"));
}

#[tokio::test]
async fn aborting_an_unknown_request_reports_failure() {
    let (status, body) = call(service().router(), abort("cmpl-nothing")).await;

    assert_eq!(status, StatusCode::OK);
    let body: AbortResponse = serde_json::from_str(&body).unwrap();
    assert!(!body.success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_ends_a_running_stream() {
    let config = config();
    let engine = Arc::new(EchoEngine::new("echo", Duration::from_millis(50)));
    let service = CompletionService::new(config, engine);

    let prompt = vec!["word"; 200].join(" ");
    let request = completion(&format!(r#"{{"prompt": "{prompt}", "stream": true}}"#));
    let response = service.clone().router().oneshot(request).await.unwrap();
    let request_id = response.headers()[REQUEST_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();

    // The stream registers once its task starts.
    let mut aborted = false;
    for _ in 0..100 {
        let (_, body) = call(service.clone().router(), abort(&request_id)).await;
        let body: AbortResponse = serde_json::from_str(&body).unwrap();
        if body.success {
            aborted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(aborted);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let last = *sse_data(&body).last().unwrap();
    let error: ErrorBody = serde_json::from_str(last).unwrap();
    assert_eq!(error.error.category, ErrorCategory::ClientDisconnected);
    assert!(!service.is_shutting_down());
}
