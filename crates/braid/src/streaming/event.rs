use crate::{error::ErrorReport, response::AggregateResponse};

/// One item delivered to the caller of a streaming request.
///
/// A successful stream is zero or more `Fragment`s followed by `Done`. An
/// aborted stream ends with a single `Error` instead; nothing follows it.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Output of one step-record, addressed by its choice index.
    Fragment(AggregateResponse),
    /// The request was aborted.
    Error(ErrorReport),
    /// End-of-stream marker.
    Done,
}

impl StreamEvent {
    /// Returns `true` for the events that end a stream.
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done)
    }
}
