use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use track_common::event::EventData;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureResponse {
    pub message: String,
}

impl CaptureResponse {
    pub fn received() -> Self {
        Self {
            message: "Data received".to_owned(),
        }
    }
}

/// Accepted request bodies: `{ "events": [...] }` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawRequest {
    Envelope { events: Vec<EventData> },
    Batch(Vec<EventData>),
}

impl RawRequest {
    pub fn events(self) -> Vec<EventData> {
        match self {
            RawRequest::Envelope { events } => events,
            RawRequest::Batch(events) => events,
        }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("request holds no event")]
    EmptyBatch,

    #[error("transient error, please retry")]
    QueueUnavailable,
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        match self {
            CaptureError::RequestParsingError(_) | CaptureError::EmptyBatch => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            CaptureError::QueueUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}
