//! HTTP service for n-way text completions.
//!
//! This module defines [`CompletionService`], which validates incoming
//! requests, hands them to a [`braid::Orchestrator`], and renders the outcome
//! either as a server-sent event stream or as a single JSON body.
//!
//! ## Responsibilities
//!
//! - Validate `n` against the configured limit and assign request ids.
//! - Bridge streaming requests to SSE, ending with `data: [DONE]`.
//! - Cancel in-flight requests by id and report the served model.
//! - Track in-flight requests and coordinate graceful shutdown.

use crate::server::{
    config::ServerConfig,
    service::api::{
        AbortRequest, AbortResponse, ApiError, CompletionRequest, ModelInfo, sse_event,
    },
    telemetry::{
        decrement_requests_inflight, increment_fragments_delivered, increment_requests,
        increment_requests_inflight, increment_stream_errors, record_choices_per_request,
        record_stream_duration,
    },
};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use braid::{Error, GenerationEngine, Orchestrator, RequestContext, StreamEvent};
use core::{convert::Infallible, time::Duration};
use ferroid::base32::Base32UlidExt;
use ferroid::generator::BasicUlidGenerator;
use ferroid::id::ULID;
use ferroid::rand::ThreadRandom;
use ferroid::time::MonotonicClock;
use futures::StreamExt;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::wrappers::ReceiverStream;

type IdGenerator = BasicUlidGenerator<ULID, MonotonicClock, ThreadRandom>;

/// Response header carrying the id a request can be aborted by.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Request accounting shared by every clone of the service.
#[derive(Default)]
struct Lifecycle {
    inflight: AtomicUsize,
    shutting_down: AtomicBool,
}

/// Counts a request as in flight until dropped.
///
/// Dropping covers every way a request ends, including the client going away
/// while a batch request is still being generated.
struct InflightGuard {
    lifecycle: Arc<Lifecycle>,
    start: Instant,
}

impl InflightGuard {
    fn new(lifecycle: Arc<Lifecycle>) -> Self {
        lifecycle.inflight.fetch_add(1, Ordering::AcqRel);
        increment_requests_inflight();
        Self {
            lifecycle,
            start: Instant::now(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.lifecycle.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_requests_inflight();
        record_stream_duration(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}

/// HTTP front end over a [`braid::Orchestrator`].
///
/// Cheap to clone; clones share the orchestrator, the id generator and the
/// in-flight accounting.
#[derive(Clone)]
pub struct CompletionService {
    config: Arc<ServerConfig>,
    orchestrator: Orchestrator,
    ids: Arc<IdGenerator>,
    lifecycle: Arc<Lifecycle>,
}

impl CompletionService {
    pub fn new(config: ServerConfig, engine: Arc<dyn GenerationEngine>) -> Self {
        let orchestrator = Orchestrator::new(engine, config.orchestrator_config());
        let ids = IdGenerator::new(
            MonotonicClock::with_epoch(Duration::ZERO),
            ThreadRandom,
        );

        Self {
            config: Arc::new(config),
            orchestrator,
            ids: Arc::new(ids),
            lifecycle: Arc::new(Lifecycle::default()),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/v1/completions", post(completions))
            .route("/v1/abort", post(abort))
            .route("/v1/model", get(model))
            .route("/health", get(health))
            .with_state(self)
    }

    pub fn requests_inflight(&self) -> usize {
        self.lifecycle.inflight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.shutting_down.load(Ordering::Acquire)
    }

    fn next_request_id(&self) -> String {
        self.ids.next_id(|_| std::thread::yield_now()).encode().to_string()
    }

    /// Gracefully shuts the service down.
    ///
    /// - Refuses new requests and reports unhealthy.
    /// - Waits up to `shutdown_timeout` for in-flight requests to finish.
    /// - Cancels whatever is still running through the orchestrator.
    pub async fn shutdown(&self) {
        // === Phase 0: Stop accepting new requests ===
        tracing::info!("Refusing new requests");
        self.lifecycle.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Wait for in-flight requests to drain ===
        tracing::info!(
            "Draining in-flight requests ({} active)",
            self.requests_inflight()
        );
        let drained = timeout(self.config.shutdown_timeout, async {
            while self.requests_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight requests drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} requests still active)",
                self.requests_inflight()
            ),
        }

        // === Phase 2: Cancel any remaining work ===
        self.orchestrator.shutdown();
        tracing::info!("Completion service shutdown complete");
    }

    fn accept(&self, request: &CompletionRequest) -> Result<RequestContext, ApiError> {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown.into());
        }

        if request.n > self.config.max_choices {
            return Err(ApiError::invalid(format!(
                "n ({}) exceeds maximum allowed ({})",
                request.n, self.config.max_choices
            )));
        }

        if request
            .model
            .as_deref()
            .is_some_and(|model| model != self.orchestrator.model_name())
        {
            tracing::debug!(
                "Requested model {:?}, serving {}",
                request.model,
                self.orchestrator.model_name()
            );
        }

        Ok(RequestContext::new(
            self.next_request_id(),
            request.n,
            request.prompt.as_str(),
            request.params.clone(),
        )?)
    }
}

/// Handles `POST /v1/completions`.
///
/// If `otel-metrics` is enabled, emits telemetry for request rate, requested
/// choices, concurrent requests, request duration, delivered fragments and
/// errors.
async fn completions(
    State(service): State<CompletionService>,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            increment_stream_errors();
            return ApiError::invalid(rejection.body_text()).into_response();
        }
    };

    let ctx = match service.accept(&request) {
        Ok(ctx) => ctx,
        Err(err) => {
            increment_stream_errors();
            tracing::debug!("Rejected completion request: {}", err.0);
            return err.into_response();
        }
    };

    increment_requests();
    record_choices_per_request(ctx.n() as f64);
    let guard = InflightGuard::new(Arc::clone(&service.lifecycle));
    let request_id = HeaderValue::from_str(ctx.request_id());

    let mut response = if request.stream {
        stream_completions(service, ctx, guard)
    } else {
        batch_completions(service, ctx, guard).await
    };

    if let Ok(request_id) = request_id {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
    }
    response
}

fn stream_completions(
    service: CompletionService,
    ctx: RequestContext,
    guard: InflightGuard,
) -> Response {
    let (tx, rx) = mpsc::channel(service.config.stream_buffer_size);
    // The event sender doubles as the transport: it reports closed once the
    // response body, and with it the receiver, is dropped.
    let transport = tx.clone();

    tokio::spawn(async move {
        let _guard = guard;
        match service.orchestrator.stream_generate(ctx, transport, tx).await {
            Ok(summary) => {
                tracing::debug!(
                    "Streamed {} fragments, usage {:?}",
                    summary.fragments,
                    summary.usage
                );
            }
            Err(_e) => increment_stream_errors(),
        }
    });

    let events = ReceiverStream::new(rx).map(|event| {
        if matches!(event, StreamEvent::Fragment(_)) {
            increment_fragments_delivered(1);
        }
        Ok::<_, Infallible>(sse_event(event))
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn batch_completions(
    service: CompletionService,
    ctx: RequestContext,
    guard: InflightGuard,
) -> Response {
    let outcome = service.orchestrator.generate(ctx).await;
    drop(guard);

    match outcome {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            increment_stream_errors();
            ApiError(err).into_response()
        }
    }
}

/// Handles `POST /v1/abort`.
async fn abort(
    State(service): State<CompletionService>,
    body: Result<Json<AbortRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => {
            let success = service.orchestrator.abort(request.request_id());
            Json(AbortResponse { success }).into_response()
        }
        Err(rejection) => ApiError::invalid(rejection.body_text()).into_response(),
    }
}

/// Handles `GET /v1/model`.
async fn model(State(service): State<CompletionService>) -> Json<ModelInfo> {
    Json(ModelInfo {
        model: service.orchestrator.model_name().to_string(),
    })
}

/// Handles `GET /health`: `200` while serving, `503` once shutdown began.
async fn health(State(service): State<CompletionService>) -> impl IntoResponse {
    if service.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ok")
    }
}
