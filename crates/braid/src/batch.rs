//! Non-streaming aggregation.
//!
//! Every worker awaits its engine to completion in its own task. The batch is
//! all-or-nothing: the first failure observed fails the whole request and the
//! results of sibling workers are discarded.
//!
//! Client disconnects are not observed here. Workers keep running until the
//! engine returns even if the caller has gone away.

use crate::{
    engine::GenerationEngine,
    error::{Error, Result},
    response::{AggregateResponse, create_response},
    types::{RequestContext, StepRecord},
};
use futures::future::try_join_all;
use std::sync::Arc;

/// Runs `ctx.n()` generations concurrently and merges their final records.
///
/// # Errors
///
/// Returns [`Error::ServiceUnavailable`] as soon as any worker fails. The
/// underlying cause is logged, not returned.
pub(crate) async fn gather(
    engine: Arc<dyn GenerationEngine>,
    ctx: &RequestContext,
) -> Result<AggregateResponse> {
    let handles: Vec<_> = (0..ctx.n())
        .map(|index| {
            let engine = Arc::clone(&engine);
            let prompt = ctx.shared_prompt();
            let request_id = ctx.shared_request_id();
            let params = ctx.params().clone();

            let handle = tokio::spawn(async move {
                engine.generate(&prompt, &request_id, params).await
            });

            async move {
                match handle.await {
                    Ok(Ok(mut record)) => {
                        record.index = index;
                        Ok(record)
                    }
                    Ok(Err(source)) => Err(Error::Generation { index, source }),
                    Err(join_err) => Err(Error::ChannelError {
                        context: format!("Worker {index} did not complete: {join_err}"),
                    }),
                }
            }
        })
        .collect();

    let records: Vec<StepRecord> = try_join_all(handles).await.map_err(|err| {
        tracing::error!("Completion {} failed: {err}", ctx.request_id());
        Error::ServiceUnavailable {
            reason: format!(
                "Completion {} aborted. Maybe the model was unloaded? \
                 Please check the server console.",
                ctx.request_id()
            ),
        }
    })?;

    Ok(create_response(
        ctx.request_id(),
        engine.model_name(),
        &records,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{Script, ScriptedEngine},
        types::GenerationParams,
    };
    use core::time::Duration;

    fn ctx(n: usize) -> RequestContext {
        RequestContext::new("batch", n, "hello", GenerationParams::default()).unwrap()
    }

    #[tokio::test]
    async fn merges_final_records_in_choice_order() {
        let engine = Arc::new(ScriptedEngine::uniform(Script::records(vec![
            StepRecord::chunk("partial", 1),
            StepRecord::finish("hi there", "stop", 1, 2),
        ])));

        let response = gather(engine.clone(), &ctx(3)).await.unwrap();

        assert_eq!(engine.calls(), 3);
        assert_eq!(response.id, "cmpl-batch");
        assert_eq!(response.model, "scripted");
        let indices: Vec<_> = response.choices.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(response.choices.iter().all(|c| c.text == "hi there"));
        assert_eq!(response.usage.total_tokens, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_failure_fails_the_whole_batch() {
        let ok = Script::records(vec![StepRecord::finish("fine", "stop", 1, 1)]);
        let engine = Arc::new(ScriptedEngine::new(vec![
            ok.clone(),
            Script::default().then_fail("model unloaded"),
            ok,
        ]));

        let err = gather(engine, &ctx(3)).await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn failure_does_not_wait_for_slow_siblings() {
        let slow = Script::records(vec![StepRecord::finish("late", "stop", 1, 1)])
            .with_delay(Duration::from_secs(30));
        let engine = Arc::new(ScriptedEngine::new(vec![
            Script::default().then_fail("boom"),
            slow,
        ]));

        let result = tokio::time::timeout(Duration::from_secs(5), gather(engine, &ctx(2))).await;
        assert!(matches!(result, Ok(Err(Error::ServiceUnavailable { .. }))));
    }
}
