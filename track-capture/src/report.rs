use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use metrics::counter;
use tracing::instrument;
use track_common::event::EventData;

use crate::api::{CaptureError, CaptureResponse, RawRequest};
use crate::router;

pub fn report_dropped_events(cause: &'static str, quantity: u64) {
    counter!("capture_events_dropped_total", "cause" => cause).increment(quantity);
}

/// Accept a batch of events and append the valid ones to the intake queue as a
/// single record. Deduplication happens downstream.
#[instrument(skip_all, fields(batch_size, accepted))]
pub async fn report(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<CaptureResponse>, CaptureError> {
    let request: RawRequest = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!("failed to decode report body: {}", e);
        report_dropped_events("request_parsing", 1);
        CaptureError::RequestParsingError(e)
    })?;

    let events = request.events();
    tracing::Span::current().record("batch_size", events.len());
    if events.is_empty() {
        return Err(CaptureError::EmptyBatch);
    }
    counter!("capture_events_received_total").increment(events.len() as u64);

    let (accepted, invalid): (Vec<EventData>, Vec<EventData>) = events
        .into_iter()
        .partition(EventData::has_required_fields);
    tracing::Span::current().record("accepted", accepted.len());

    if !invalid.is_empty() {
        report_dropped_events("missing_required_field", invalid.len() as u64);
    }
    if accepted.is_empty() {
        return Ok(Json(CaptureResponse::received()));
    }

    let batch = serde_json::to_string(&accepted)?;
    state.queue.push(batch).await.map_err(|e| {
        tracing::error!("failed to push batch to the intake queue: {}", e);
        CaptureError::QueueUnavailable
    })?;

    counter!("capture_events_ingested_total").increment(accepted.len() as u64);
    Ok(Json(CaptureResponse::received()))
}
