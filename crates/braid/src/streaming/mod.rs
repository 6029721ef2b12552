//! Streaming fan-in: stream workers feed the result channel, the coordinator
//! drains it into [`StreamEvent`]s.
//!
//! ## Structure
//!
//! - [`processor`] - the stream worker driving one completion.
//! - [`coordinator`] - the streaming aggregator state machine.
//! - [`event`] - what the caller receives.

pub(crate) mod coordinator;
mod event;
pub(crate) mod processor;

pub use coordinator::StreamSummary;
pub use event::StreamEvent;
