//! Built-in development engine.
//!
//! [`EchoEngine`] replays the prompt word by word. It needs no model and is
//! deterministic, which makes the server usable for wiring up clients and
//! load-testing the orchestration layer on its own.

use braid::{
    EngineError, GenerationEngine, GenerationParams, StepRecord, StepStream, TokenProb,
};
use core::time::Duration;
use futures::{FutureExt, StreamExt, future::BoxFuture};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Echoes the prompt back, one whitespace-separated word per step.
///
/// Honours `max_tokens` (finish reason `length`), `stop` strings (finish
/// reason `stop`, the stop string itself is not emitted) and `logprobs`.
/// Each step waits `token_delay` first, and a cancelled abort token ends the
/// stream at the next step.
pub struct EchoEngine {
    model: String,
    token_delay: Duration,
}

impl EchoEngine {
    pub fn new(model: impl Into<String>, token_delay: Duration) -> Self {
        Self {
            model: model.into(),
            token_delay,
        }
    }
}

/// Precomputed output of one generation.
#[derive(Debug)]
struct Plan {
    tokens: Vec<String>,
    finish_reason: &'static str,
    prompt_tokens: usize,
    logprobs: usize,
}

impl Plan {
    fn new(prompt: &str, params: &GenerationParams) -> Self {
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let prompt_tokens = words.len();
        let budget = params.max_tokens.unwrap_or(usize::MAX);

        let mut tokens: Vec<String> = words
            .iter()
            .take(budget)
            .enumerate()
            .map(|(i, word)| if i == 0 { (*word).to_string() } else { format!(" {word}") })
            .collect();
        let mut finish_reason = if words.len() > budget { "length" } else { "stop" };

        // Output ends right before the earliest stop string, wherever it
        // starts, so no part of it is ever emitted.
        let text = tokens.concat();
        let cut = params
            .stop
            .iter()
            .filter(|stop| !stop.is_empty())
            .filter_map(|stop| text.find(stop.as_str()))
            .min();

        if let Some(cut) = cut {
            finish_reason = "stop";
            let mut start = 0;
            tokens.retain_mut(|token| {
                let end = start + token.len();
                let keep = start < cut;
                if keep && end > cut {
                    token.truncate(cut - start);
                }
                start = end;
                keep
            });
        }

        Self {
            tokens,
            finish_reason,
            prompt_tokens,
            logprobs: params.logprobs.unwrap_or(0),
        }
    }

    /// Builds the record for step `i`. The last step is terminal.
    fn record(&self, i: usize, offset: usize) -> StepRecord {
        let text = self.tokens.get(i).cloned().unwrap_or_default();
        let generated = (i + 1).min(self.tokens.len());

        let mut record = if i + 1 >= self.tokens.len() {
            StepRecord::finish(text, self.finish_reason, self.prompt_tokens, generated)
        } else {
            StepRecord {
                prompt_tokens: self.prompt_tokens,
                ..StepRecord::chunk(text, generated)
            }
        };

        if self.logprobs > 0 && !record.text.is_empty() {
            let logprob = -0.1 * (i as f64 + 1.0);
            let sampled = TokenProb::new(record.text.clone(), logprob);
            let mut top = vec![sampled.clone()];
            top.extend(
                (1..self.logprobs).map(|rank| TokenProb::new("", logprob - rank as f64)),
            );

            record.token_probs = Some(vec![sampled]);
            record.top_logprobs = Some(vec![top]);
            record.text_offset = Some(vec![offset]);
        }

        record
    }

    /// Number of steps the stream yields. An empty output still yields one
    /// terminal record.
    fn steps(&self) -> usize {
        self.tokens.len().max(1)
    }
}

impl GenerationEngine for EchoEngine {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn generate_stream(
        &self,
        prompt: &str,
        request_id: &str,
        abort: CancellationToken,
        params: GenerationParams,
    ) -> StepStream {
        let plan = Arc::new(Plan::new(prompt, &params));
        let delay = self.token_delay;
        tracing::trace!("Echoing {} tokens for {request_id}", plan.tokens.len());

        futures::stream::unfold((0usize, 0usize), move |(i, offset)| {
            let plan = Arc::clone(&plan);
            let abort = abort.clone();
            async move {
                if i >= plan.steps() {
                    return None;
                }

                if !delay.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = abort.cancelled() => return None,
                    }
                }
                if abort.is_cancelled() {
                    return None;
                }

                let record = plan.record(i, offset);
                let next_offset = offset + record.text.len();
                Some((Ok(record), (i + 1, next_offset)))
            }
        })
        .boxed()
    }

    fn generate(
        &self,
        prompt: &str,
        _request_id: &str,
        params: GenerationParams,
    ) -> BoxFuture<'static, Result<StepRecord, EngineError>> {
        let plan = Plan::new(prompt, &params);
        let delay = self.token_delay * u32::try_from(plan.tokens.len()).unwrap_or(u32::MAX);

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(StepRecord::finish(
                plan.tokens.concat(),
                plan.finish_reason,
                plan.prompt_tokens,
                plan.tokens.len(),
            ))
        }
        .boxed()
    }
}
