//! # Request and step-record types
//!
//! These are the values that flow through a single completion request:
//!
//! - [`RequestContext`] - what the client asked for, fixed once accepted.
//! - [`GenerationParams`] - sampling parameters, cloned per worker.
//! - [`StepRecord`] - one incremental unit of engine output, possibly
//!   terminal.
//!
//! Telemetry fields on [`StepRecord`] (token counts, probabilities, offsets)
//! default to zero/empty when an engine leaves them out. Partial telemetry
//! never fails a request.

use crate::error::{Error, Result};
use std::sync::Arc;

/// Sampling parameters handed to the generation engine.
///
/// The orchestration layer never interprets these values; it only clones
/// them so that each worker owns an independent copy.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GenerationParams {
    pub max_tokens: Option<usize>,
    pub min_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub min_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Vec<String>,
    /// Number of top alternatives to report per token. `None` or `0`
    /// disables logprobs.
    pub logprobs: Option<usize>,
    pub seed: Option<u64>,
    pub add_bos_token: Option<bool>,
    pub ban_eos_token: Option<bool>,
    pub skip_special_tokens: Option<bool>,
}

/// An accepted completion request.
///
/// Shared by reference between the workers of one request; the prompt and
/// request id are reference counted so spawning `n` workers does not copy
/// them.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: Arc<str>,
    n: usize,
    prompt: Arc<str>,
    params: GenerationParams,
}

impl RequestContext {
    /// Validates and freezes a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `n` is zero.
    pub fn new(
        request_id: impl Into<Arc<str>>,
        n: usize,
        prompt: impl Into<Arc<str>>,
        params: GenerationParams,
    ) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidRequest {
                reason: "n must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            request_id: request_id.into(),
            n,
            prompt: prompt.into(),
            params,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub(crate) fn shared_request_id(&self) -> Arc<str> {
        Arc::clone(&self.request_id)
    }

    /// Number of parallel completions requested.
    pub const fn n(&self) -> usize {
        self.n
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub(crate) fn shared_prompt(&self) -> Arc<str> {
        Arc::clone(&self.prompt)
    }

    pub const fn params(&self) -> &GenerationParams {
        &self.params
    }
}

/// Probability reported for a single token.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TokenProb {
    pub token: String,
    pub logprob: f64,
}

impl TokenProb {
    pub fn new(token: impl Into<String>, logprob: f64) -> Self {
        Self {
            token: token.into(),
            logprob,
        }
    }
}

/// One incremental unit of generated output.
///
/// A worker's sequence of records ends with exactly one record whose
/// `finish_reason` is set (see [`StepRecord::is_terminal`]).
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StepRecord {
    /// Index of the worker that produced this record. Stamped by the worker,
    /// engines may leave it at zero.
    pub index: usize,
    pub text: String,
    pub finish_reason: Option<String>,
    /// Probability of each sampled token, in generation order.
    pub token_probs: Option<Vec<TokenProb>>,
    /// Top alternatives for each sampled token.
    pub top_logprobs: Option<Vec<Vec<TokenProb>>>,
    /// Character offset of each sampled token within the generated text.
    pub text_offset: Option<Vec<usize>>,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

impl StepRecord {
    /// Creates a non-terminal record carrying `text`.
    pub fn chunk(text: impl Into<String>, generated_tokens: usize) -> Self {
        Self {
            text: text.into(),
            generated_tokens,
            ..Self::default()
        }
    }

    /// Creates a terminal record carrying `text` and the final token counts.
    pub fn finish(
        text: impl Into<String>,
        finish_reason: impl Into<String>,
        prompt_tokens: usize,
        generated_tokens: usize,
    ) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some(finish_reason.into()),
            prompt_tokens,
            generated_tokens,
            ..Self::default()
        }
    }

    /// Returns `true` if this record carries a non-empty finish reason.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason
            .as_deref()
            .is_some_and(|reason| !reason.is_empty())
    }
}
