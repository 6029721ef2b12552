//! Per-request orchestration of `n` parallel completions.
//!
//! [`Orchestrator`] is the entry point callers use. For every request it
//! creates a cancellation token (a child of the service-wide shutdown token),
//! fans out one worker per requested completion, and hands the results to
//! either the streaming or the batch aggregator.
//!
//! ## Streaming
//!
//! ```text
//!  worker 0 ──┐
//!  worker 1 ──┼──► result channel ──► StreamingAggregator ──► StreamEvent sink
//!  worker n ──┘                              ▲
//!                      DisconnectMonitor ────┘ (sets the abort token)
//! ```
//!
//! ## Batch
//!
//! Workers await their engine to completion; the first failure fails the
//! request as [`Error::ServiceUnavailable`].
//!
//! ## Cancellation
//!
//! Besides client disconnects and shutdown, any in-flight request can be
//! cancelled by id with [`Orchestrator::abort`].

use crate::{
    batch,
    channel::result_channel,
    disconnect::{DisconnectMonitor, Transport},
    engine::GenerationEngine,
    error::{Error, Result},
    registry::Registry,
    response::AggregateResponse,
    streaming::{
        StreamEvent, StreamSummary,
        coordinator::StreamingAggregator,
        processor::{WorkerTask, stream_worker},
    },
    types::RequestContext,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Tunables for the orchestration layer.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// How often the disconnect monitor checks the transport.
    pub disconnect_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            disconnect_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Fans requests out to a [`GenerationEngine`] and aggregates the results.
///
/// Cheap to clone; clones share the engine, the shutdown token and the set
/// of in-flight requests.
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn GenerationEngine>,
    model: Arc<str>,
    config: OrchestratorConfig,
    shutdown_token: CancellationToken,
    requests: Arc<Registry>,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn GenerationEngine>, config: OrchestratorConfig) -> Self {
        let model = Arc::from(engine.model_name());
        Self {
            engine,
            model,
            config,
            shutdown_token: CancellationToken::new(),
            requests: Arc::new(Registry::default()),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Cancels every in-flight request and refuses new ones.
    pub fn shutdown(&self) {
        tracing::info!("Cancelling in-flight generations");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Cancels the in-flight request with id `request_id`.
    ///
    /// The request ends with [`Error::Aborted`]. Returns `false` if no such
    /// request is running.
    pub fn abort(&self, request_id: &str) -> bool {
        let found = self.requests.cancel(request_id);
        if found {
            tracing::info!("Aborting completion request {request_id}");
        } else {
            tracing::debug!("No in-flight completion {request_id} to abort");
        }
        found
    }

    /// Number of requests currently in flight.
    pub fn active_requests(&self) -> usize {
        self.requests.len()
    }

    /// Streams the completions of `ctx` into `events`.
    ///
    /// Each step-record becomes one [`StreamEvent::Fragment`] as soon as it is
    /// produced. A successful stream ends with [`StreamEvent::Done`]; an
    /// aborted one with a single [`StreamEvent::Error`].
    ///
    /// `transport` is polled for client disconnects. Dropping the returned
    /// future before it resolves cancels the request's workers.
    ///
    /// # Errors
    ///
    /// Returns the abort cause: a generation failure,
    /// [`Error::ClientDisconnected`], or [`Error::ServiceShutdown`] when the
    /// service is shutting down.
    pub async fn stream_generate<T: Transport>(
        &self,
        ctx: RequestContext,
        transport: T,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamSummary> {
        let span = tracing::info_span!(
            "completion",
            request_id = %ctx.request_id(),
            n = ctx.n(),
            stream = true
        );
        self.stream_inner(ctx, transport, events)
            .instrument(span)
            .await
    }

    async fn stream_inner<T: Transport>(
        &self,
        ctx: RequestContext,
        transport: T,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamSummary> {
        if self.is_shutdown() {
            let err = Error::ServiceShutdown;
            if events.send(StreamEvent::Error(err.report())).await.is_err() {
                tracing::debug!("Client left before the shutdown notice");
            }
            return Err(err);
        }

        tracing::info!("Received streaming completion request {}", ctx.request_id());

        let abort = self.shutdown_token.child_token();
        // Cancels the workers if this future is dropped mid-stream.
        let guard = abort.clone().drop_guard();

        let (tx, rx) = result_channel();
        let request_id = ctx.shared_request_id();
        let prompt = ctx.shared_prompt();
        let _registration = self
            .requests
            .register(Arc::clone(&request_id), abort.clone());

        for index in 0..ctx.n() {
            tokio::spawn(
                stream_worker(WorkerTask {
                    index,
                    engine: Arc::clone(&self.engine),
                    prompt: Arc::clone(&prompt),
                    request_id: Arc::clone(&request_id),
                    abort: abort.clone(),
                    params: ctx.params().clone(),
                    tx: tx.clone(),
                })
                .in_current_span(),
            );
        }
        // Only workers hold senders, so the channel closes if all of them die.
        drop(tx);

        let monitor = DisconnectMonitor::spawn(
            Arc::clone(&request_id),
            transport,
            self.config.disconnect_poll_interval,
            abort.clone(),
        );

        let outcome = StreamingAggregator::new(
            request_id,
            Arc::clone(&self.model),
            ctx.n(),
            rx,
            events,
            monitor,
            abort,
            self.shutdown_token.clone(),
        )
        .run()
        .await;

        if outcome.is_ok() {
            guard.disarm();
        }
        outcome
    }

    /// Runs the completions of `ctx` to the end and returns them as one
    /// response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUnavailable`] if any completion fails,
    /// [`Error::ServiceShutdown`] when the service is shutting down, or
    /// [`Error::Aborted`] when the request is cancelled by id. A cancelled
    /// request stops waiting; generations already started run to the end.
    pub async fn generate(&self, ctx: RequestContext) -> Result<AggregateResponse> {
        let span = tracing::info_span!(
            "completion",
            request_id = %ctx.request_id(),
            n = ctx.n(),
            stream = false
        );
        async {
            if self.is_shutdown() {
                return Err(Error::ServiceShutdown);
            }

            tracing::info!("Received completion request {}", ctx.request_id());

            let abort = self.shutdown_token.child_token();
            let _registration = self
                .requests
                .register(ctx.shared_request_id(), abort.clone());

            let response = tokio::select! {
                biased;
                outcome = batch::gather(Arc::clone(&self.engine), &ctx) => outcome?,
                () = abort.cancelled() => {
                    let err = if self.is_shutdown() {
                        Error::ServiceShutdown
                    } else {
                        Error::Aborted
                    };
                    tracing::warn!("Completion {} aborted: {err}", ctx.request_id());
                    return Err(err);
                }
            };

            tracing::info!("Finished completion request {}", ctx.request_id());
            Ok(response)
        }
        .instrument(span)
        .await
    }
}
