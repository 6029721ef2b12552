use crate::types::{GenerationParams, StepRecord};
use futures::{future::BoxFuture, stream::BoxStream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A lazy sequence of step-records produced for one completion.
///
/// An `Err` item means the engine failed; the orchestrator stops pulling from
/// the stream after the first error or the first terminal record.
pub type StepStream = BoxStream<'static, Result<StepRecord, EngineError>>;

/// Failure raised by a [`GenerationEngine`].
///
/// Engines report failures as an opaque reason; the orchestrator attaches the
/// worker index when it wraps the failure into [`crate::Error::Generation`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct EngineError {
    reason: Arc<str>,
}

impl EngineError {
    pub fn new(reason: impl Into<Arc<str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A capability that turns a prompt into generated text.
///
/// The orchestrator holds the engine as an `Arc<dyn GenerationEngine>` and
/// calls it once per requested completion, concurrently. Implementations own
/// model state, batching and sampling; none of that is visible here.
///
/// Both methods take borrowed arguments and return `'static` values, so an
/// implementation must copy what it needs before returning.
pub trait GenerationEngine: Send + Sync + 'static {
    /// Name of the model reported in responses.
    fn model_name(&self) -> &str;

    /// Starts a streaming generation.
    ///
    /// `abort` is the request's cancellation token. Implementations should
    /// stop producing records (ending the stream) once it is cancelled. The
    /// orchestrator never drops an in-progress step to force this.
    fn generate_stream(
        &self,
        prompt: &str,
        request_id: &str,
        abort: CancellationToken,
        params: GenerationParams,
    ) -> StepStream;

    /// Runs a generation to completion and returns its final record.
    fn generate(
        &self,
        prompt: &str,
        request_id: &str,
        params: GenerationParams,
    ) -> BoxFuture<'static, Result<StepRecord, EngineError>>;
}
