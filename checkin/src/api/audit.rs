//! Ledger audit endpoint.
//!
//! - GET /api/events/:event_id/tickets/:code/checkins - every admission
//!   record for a ticket at an event, in append order

use crate::ports::reported_record;
use crate::server::{AppError, AppState};
use crate::types::{CheckInRecord, EventId, TicketCode};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

/// Admission history of one ticket at one event.
#[derive(Debug, Serialize)]
pub struct CheckInHistory {
    /// Ticket code
    pub ticket_code: TicketCode,
    /// Event id
    pub event_id: EventId,
    /// The record staff are shown on a repeat scan
    pub reported: Option<CheckInRecord>,
    /// Every record, in append order
    pub records: Vec<CheckInRecord>,
}

/// List check-in records for a ticket.
///
/// ```bash
/// curl http://localhost:8080/api/events/evt-001/tickets/TKT-001-ABC/checkins
/// ```
pub async fn ticket_checkins(
    Path((event_id, code)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<CheckInHistory>, AppError> {
    let event_id = EventId::new(event_id);
    let code = TicketCode::new(code);
    if code.is_empty() {
        return Err(AppError::bad_request("Ticket code is required"));
    }

    let records = tokio::time::timeout(
        state.pipeline.store_timeout(),
        state.pipeline.ledger().records(&code, &event_id),
    )
    .await
    .map_err(|_| AppError::unavailable("Ledger call timed out"))??;

    Ok(Json(CheckInHistory {
        reported: reported_record(&records).cloned(),
        ticket_code: code,
        event_id,
        records,
    }))
}
