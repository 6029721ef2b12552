//! # `braid`: Fan-out/Fan-in Orchestration for Text Generation
//!
//! `braid` sits between a completion endpoint and a generation engine. A
//! request asking for `n` completions of one prompt is fanned out to `n`
//! concurrent workers whose results are merged back into a single response
//! stream (or a single batch response).
//!
//! ## Highlights
//!
//! - **Incremental streaming**: every step-record becomes a fragment as soon
//!   as any worker produces it, in arrival order.
//! - **Exact termination**: a stream ends with one end-of-stream marker after
//!   every choice finished, or with exactly one error event.
//! - **Client cancellation**: a disconnect monitor polls the transport and
//!   cancels every worker of the request.
//! - **Graceful shutdown**: per-request tokens are children of a service-wide
//!   token, so shutting down cancels everything in flight.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use braid::{Orchestrator, OrchestratorConfig, RequestContext, StreamEvent};
//!
//! let orchestrator = Orchestrator::new(engine, OrchestratorConfig::default());
//! let ctx = RequestContext::new("req-1", 2, "Once upon a time", params)?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! tokio::spawn(async move { orchestrator.stream_generate(ctx, tx.clone(), tx).await });
//! while let Some(event) = rx.recv().await {
//!     // forward `event` to the client
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`GenerationEngine`] - the capability workers drive.
//! - [`Orchestrator`] - per-request fan-out and aggregation.
//! - [`StreamEvent`] - what streaming callers receive.
//! - [`Error`] / [`ErrorReport`] - failure causes and their reporting form.

mod batch;
mod channel;
mod disconnect;
mod engine;
mod error;
mod orchestrator;
mod registry;
mod response;
mod streaming;
#[cfg(test)]
mod testing;
mod types;

pub use crate::disconnect::*;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::orchestrator::*;
pub use crate::response::*;
pub use crate::streaming::{StreamEvent, StreamSummary};
pub use crate::types::*;
