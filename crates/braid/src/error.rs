//! Error types for the generation orchestration layer.
//!
//! This module defines the central [`Error`] enum, which captures every
//! outcome the aggregators can surface to a caller, and [`ErrorCategory`],
//! the coarse cause classification reported alongside the message.
//!
//! ## Error Cases
//! - `Generation`: a worker's generation engine raised while producing output.
//! - `ClientDisconnected`: the client went away and the request was cancelled.
//! - `ServiceUnavailable`: a batch request failed as a whole.
//! - `InvalidRequest`: the request was rejected before any worker started.
//! - `ChannelError`: every worker exited while output was still expected.
//! - `ServiceShutdown`: a request arrived while the service was shutting down.
//! - `Aborted`: the request was cancelled by id while in flight.

use crate::engine::EngineError;
use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for request orchestration.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The generation engine failed while producing output for one worker.
    #[error("Generation failed for choice {index}: {source}")]
    Generation {
        index: usize,
        #[source]
        source: EngineError,
    },

    /// The client aborted the request.
    #[error("Request cancelled by client")]
    ClientDisconnected,

    /// A batch request could not be completed.
    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Internal channel failure between workers and the aggregator.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The request was cancelled by id through [`crate::Orchestrator::abort`].
    #[error("Request aborted")]
    Aborted,
}

impl Error {
    /// Classifies this error for reporting.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Generation { .. } | Self::ChannelError { .. } => ErrorCategory::GenerationFailure,
            Self::ClientDisconnected | Self::Aborted => ErrorCategory::ClientDisconnected,
            Self::ServiceUnavailable { .. } | Self::ServiceShutdown => {
                ErrorCategory::ServiceUnavailable
            }
            Self::InvalidRequest { .. } => ErrorCategory::InvalidRequest,
        }
    }

    /// Builds the structured description delivered to callers.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            message: self.to_string(),
            category: self.category(),
        }
    }
}

/// Coarse cause of a failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ErrorCategory {
    GenerationFailure,
    ClientDisconnected,
    ServiceUnavailable,
    /// Rejected during validation; never the cause of an abort.
    InvalidRequest,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GenerationFailure => "generation-failure",
            Self::ClientDisconnected => "client-disconnected",
            Self::ServiceUnavailable => "service-unavailable",
            Self::InvalidRequest => "invalid-request",
        })
    }
}

/// Structured error description surfaced on abort.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorReport {
    pub message: String,
    pub category: ErrorCategory,
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        err.report()
    }
}
