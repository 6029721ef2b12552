//! HTTP service implementation.
//!
//! This module contains the client-facing endpoints and the glue between
//! HTTP requests and the orchestration layer.
//!
//! ## Structure
//!
//! - [`handler`] - service entry point (`CompletionService`) and routes.
//! - [`api`] - request bodies, error bodies and SSE rendering.

pub mod api;
pub mod handler;

#[cfg(test)]
mod tests;
