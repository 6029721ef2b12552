use crate::{
    channel::{ChannelEntry, ResultSender},
    engine::GenerationEngine,
    error::Error,
    types::GenerationParams,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything one stream worker needs, owned.
pub(crate) struct WorkerTask {
    pub index: usize,
    pub engine: Arc<dyn GenerationEngine>,
    pub prompt: Arc<str>,
    pub request_id: Arc<str>,
    pub abort: CancellationToken,
    pub params: GenerationParams,
    pub tx: ResultSender,
}

/// Drives one completion and forwards its records to the result channel.
///
/// Pulls records from the engine's stream, stamps each with the worker index
/// and pushes it onto `tx`. Exits after the first terminal record, on the
/// first engine error (which is pushed as [`ChannelEntry::Failed`]), when the
/// stream ends without a terminal record (pushed as
/// [`ChannelEntry::Exhausted`]), or when the abort token is cancelled.
///
/// The abort token is checked between steps and handed to the engine. A step
/// that is already in progress is never dropped.
pub(crate) async fn stream_worker(task: WorkerTask) {
    let WorkerTask {
        index,
        engine,
        prompt,
        request_id,
        abort,
        params,
        tx,
    } = task;

    tracing::trace!("Worker {index} started");

    let mut steps = engine.generate_stream(&prompt, &request_id, abort.clone(), params);

    loop {
        if abort.is_cancelled() {
            tracing::debug!("Worker {index} observed cancellation");
            break;
        }

        match steps.next().await {
            Some(Ok(mut record)) => {
                record.index = index;
                let terminal = record.is_terminal();

                if !tx.push(ChannelEntry::Record(record)) {
                    tracing::debug!("Worker {index} exiting, aggregator is gone");
                    break;
                }

                if terminal {
                    break;
                }
            }
            Some(Err(source)) => {
                tracing::debug!("Worker {index} generation failed: {source}");
                if !tx.push(ChannelEntry::Failed(Error::Generation { index, source })) {
                    tracing::debug!("Worker {index} failed to forward error");
                }
                break;
            }
            None if abort.is_cancelled() => {
                tracing::debug!("Worker {index} stream ended after cancellation");
                break;
            }
            None => {
                tracing::warn!("Worker {index} finished without a finish reason");
                if !tx.push(ChannelEntry::Exhausted { index }) {
                    tracing::debug!("Worker {index} failed to report exhaustion");
                }
                break;
            }
        }
    }

    tracing::trace!("Worker {index} stopped");
}
