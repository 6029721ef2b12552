//! HTTP wire types for the completions endpoint.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response, sse::Event},
};
use braid::{Error, ErrorCategory, ErrorReport, GenerationParams, StreamEvent};
use serde::{Deserialize, Serialize};

/// Body of `POST /v1/completions`.
///
/// Sampling fields sit at the top level of the JSON object, next to `prompt`,
/// and are collected into [`GenerationParams`]. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default)]
    pub stream: bool,
    /// Accepted for compatibility; the server always answers with its loaded
    /// model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

const fn default_n() -> usize {
    1
}

/// Body of `POST /v1/abort`.
#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    /// The request id, either bare or as the `cmpl-` prefixed response id.
    pub request_id: String,
}

impl AbortRequest {
    pub fn request_id(&self) -> &str {
        self.request_id
            .strip_prefix("cmpl-")
            .unwrap_or(&self.request_id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbortResponse {
    pub success: bool,
}

/// Body of `GET /v1/model`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
}

/// Error body: `{"error": {"message": ..., "category": ...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorReport,
}

/// A request failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self(Error::InvalidRequest {
            reason: reason.into(),
        })
    }

    pub const fn status(&self) -> StatusCode {
        match self.0.category() {
            ErrorCategory::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCategory::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::GenerationFailure | ErrorCategory::ClientDisconnected => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.report(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// End-of-stream sentinel sent as the last SSE `data:` payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Renders a [`StreamEvent`] as one SSE event.
pub fn sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Fragment(fragment) => match serde_json::to_string(&fragment) {
            Ok(json) => Event::default().data(json),
            Err(err) => error_event(&Error::ChannelError {
                context: format!("Failed to encode fragment: {err}"),
            }
            .report()),
        },
        StreamEvent::Error(report) => error_event(&report),
        StreamEvent::Done => Event::default().data(DONE_SENTINEL),
    }
}

fn error_event(report: &ErrorReport) -> Event {
    let body = ErrorBody {
        error: report.clone(),
    };
    match serde_json::to_string(&body) {
        Ok(json) => Event::default().data(json),
        Err(_) => Event::default().data(report.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_fields_are_flattened() {
        let request: CompletionRequest = serde_json::from_str(
            r#"{"prompt": "hi", "max_tokens": 5, "stop": ["\n"], "temperature": 0.5}"#,
        )
        .unwrap();

        assert_eq!(request.n, 1);
        assert!(!request.stream);
        assert_eq!(request.params.max_tokens, Some(5));
        assert_eq!(request.params.stop, vec!["\n".to_string()]);
        assert_eq!(request.params.temperature, Some(0.5));
    }

    #[test]
    fn null_logprobs_disables_them() {
        let request: CompletionRequest =
            serde_json::from_str(r#"{"prompt": "hi", "logprobs": null}"#).unwrap();
        assert_eq!(request.params.logprobs, None);

        let request: CompletionRequest =
            serde_json::from_str(r#"{"prompt": "hi", "logprobs": 3}"#).unwrap();
        assert_eq!(request.params.logprobs, Some(3));
    }

    #[test]
    fn abort_accepts_response_ids() {
        let bare: AbortRequest = serde_json::from_str(r#"{"request_id": "01ABC"}"#).unwrap();
        let prefixed: AbortRequest =
            serde_json::from_str(r#"{"request_id": "cmpl-01ABC"}"#).unwrap();

        assert_eq!(bare.request_id(), "01ABC");
        assert_eq!(prefixed.request_id(), "01ABC");
    }

    #[test]
    fn status_follows_category() {
        assert_eq!(
            ApiError::invalid("bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::ServiceShutdown).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(Error::ChannelError {
                context: "gone".to_string()
            })
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
