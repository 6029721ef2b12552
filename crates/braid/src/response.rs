//! Aggregate response shaping.
//!
//! [`create_response`] turns one or more step-records into an
//! [`AggregateResponse`]. The streaming aggregator calls it with a single
//! record per fragment; the batch aggregator calls it once with the final
//! record of every worker.

use crate::types::{StepRecord, TokenProb};

/// Token-level probabilities attached to a choice.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogProbs {
    pub text_offset: Vec<usize>,
    pub token_logprobs: Vec<f64>,
    pub tokens: Vec<String>,
    pub top_logprobs: Vec<Vec<TokenProb>>,
}

/// One completion within a response.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Choice {
    pub index: usize,
    pub text: String,
    pub finish_reason: Option<String>,
    pub logprobs: Option<LogProbs>,
}

/// Token accounting for a response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub const fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A completion response, or one fragment of a streamed one.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AggregateResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

/// Builds a response from `records`.
///
/// Each record becomes one choice addressed by its worker index. Usage is
/// taken from the last record, whose counts are authoritative when it is a
/// terminal record.
pub fn create_response(request_id: &str, model: &str, records: &[StepRecord]) -> AggregateResponse {
    let choices = records
        .iter()
        .map(|record| Choice {
            index: record.index,
            text: record.text.clone(),
            finish_reason: record.finish_reason.clone(),
            logprobs: logprobs_for(record),
        })
        .collect();

    let usage = records
        .last()
        .map(|last| Usage::new(last.prompt_tokens, last.generated_tokens))
        .unwrap_or_default();

    AggregateResponse {
        id: format!("cmpl-{request_id}"),
        model: model.to_string(),
        choices,
        usage,
    }
}

fn logprobs_for(record: &StepRecord) -> Option<LogProbs> {
    let token_probs = record.token_probs.as_ref().filter(|probs| !probs.is_empty())?;

    Some(LogProbs {
        text_offset: record.text_offset.clone().unwrap_or_default(),
        token_logprobs: token_probs.iter().map(|p| p.logprob).collect(),
        tokens: token_probs.iter().map(|p| p.token.clone()).collect(),
        top_logprobs: record.top_logprobs.clone().unwrap_or_default(),
    })
}
