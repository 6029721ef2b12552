//! In-memory engine used by the unit tests.

use crate::{
    engine::{EngineError, GenerationEngine, StepStream},
    types::{GenerationParams, StepRecord},
};
use core::time::Duration;
use futures::{FutureExt, StreamExt, future::BoxFuture};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
enum Step {
    Record(StepRecord),
    Fail(String),
    /// Blocks until the abort token fires, then ends the stream.
    Park,
}

/// The sequence one engine call plays back.
#[derive(Clone, Debug, Default)]
pub(crate) struct Script {
    steps: Vec<Step>,
    delay: Duration,
}

impl Script {
    pub fn records(records: Vec<StepRecord>) -> Self {
        Self {
            steps: records.into_iter().map(Step::Record).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn then_fail(mut self, reason: &str) -> Self {
        self.steps.push(Step::Fail(reason.to_string()));
        self
    }

    /// Ends the stream only once the request is cancelled.
    pub fn then_park(mut self) -> Self {
        self.steps.push(Step::Park);
        self
    }

    /// Sleeps for `delay` before every step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Plays back scripts, one per call, in call order. The last script repeats.
#[derive(Debug)]
pub(crate) struct ScriptedEngine {
    scripts: Vec<Script>,
    calls: AtomicUsize,
    aborted: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(scripts: Vec<Script>) -> Self {
        assert!(!scripts.is_empty());
        Self {
            scripts,
            calls: AtomicUsize::new(0),
            aborted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn uniform(script: Script) -> Self {
        Self::new(vec![script])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of streams that stopped early because the abort token fired.
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Script {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts[call.min(self.scripts.len() - 1)].clone()
    }
}

impl GenerationEngine for ScriptedEngine {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn generate_stream(
        &self,
        _prompt: &str,
        _request_id: &str,
        abort: CancellationToken,
        _params: GenerationParams,
    ) -> StepStream {
        let Script { steps, delay } = self.next_script();
        let aborted = Arc::clone(&self.aborted);

        futures::stream::unfold(
            (steps.into_iter(), abort, aborted),
            move |(mut steps, abort, aborted)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if abort.is_cancelled() {
                    aborted.fetch_add(1, Ordering::SeqCst);
                    return None;
                }
                let item = match steps.next()? {
                    Step::Record(record) => Ok(record),
                    Step::Fail(reason) => Err(EngineError::new(reason)),
                    Step::Park => {
                        abort.cancelled().await;
                        aborted.fetch_add(1, Ordering::SeqCst);
                        return None;
                    }
                };
                Some((item, (steps, abort, aborted)))
            },
        )
        .boxed()
    }

    fn generate(
        &self,
        _prompt: &str,
        _request_id: &str,
        _params: GenerationParams,
    ) -> BoxFuture<'static, Result<StepRecord, EngineError>> {
        let Script { steps, delay } = self.next_script();

        async move {
            let mut last = None;
            for step in steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    Step::Record(record) => last = Some(record),
                    Step::Fail(reason) => return Err(EngineError::new(reason)),
                    Step::Park => futures::future::pending::<()>().await,
                }
            }
            last.ok_or_else(|| EngineError::new("script produced no output"))
        }
        .boxed()
    }
}
