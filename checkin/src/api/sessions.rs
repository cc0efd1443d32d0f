//! Session endpoints.
//!
//! - POST   /api/sessions - start a session for a staff member at an event
//! - GET    /api/sessions/:id - session snapshot
//! - POST   /api/sessions/:id/scans - submit a decoded or typed code
//! - POST   /api/sessions/:id/overrides - stage an override
//! - POST   /api/sessions/:id/overrides/confirm - confirm an override
//! - GET    /api/sessions/:id/tally - current counters
//! - PUT    /api/sessions/:id/feed - start or stop the camera feed
//! - POST   /api/sessions/:id/decoder-signals - report decoder state
//! - DELETE /api/sessions/:id - end the session, returning the final tally

use crate::intake::DecoderSignal;
use crate::overrides::OverrideRequest;
use crate::server::{AppError, AppState};
use crate::session::{CheckInSession, ScanOutcome, SessionSnapshot};
use crate::tally::SessionTally;
use crate::types::{EventId, ScanSource, StaffId, TicketCode, ValidationResult};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Request / Response Types
// ============================================================================

/// Request to start a session.
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    /// Event to admit for
    pub event_id: EventId,
    /// Staff member operating the gate
    pub staff_id: StaffId,
}

/// A started session.
#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    /// Id for subsequent calls
    pub session_id: Uuid,
    /// Event name, for the gate header
    pub event_name: String,
}

/// A scan submission.
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    /// Code as read or typed
    pub code: String,
    /// Producer; manual when omitted
    #[serde(default = "manual")]
    pub source: ScanSource,
}

const fn manual() -> ScanSource {
    ScanSource::Manual
}

/// Request to stage an override.
#[derive(Debug, Default, Deserialize)]
pub struct OpenOverrideRequest {
    /// Code to prefill
    pub code: Option<TicketCode>,
}

/// Override confirmation.
#[derive(Debug, Deserialize)]
pub struct ConfirmOverrideRequest {
    /// Code to admit
    pub code: TicketCode,
    /// Preset label or custom reason
    pub reason: String,
    /// Required when the reason is `Other`
    pub free_text: Option<String>,
}

/// Feed toggle.
#[derive(Debug, Deserialize)]
pub struct FeedRequest {
    /// Whether decode events are accepted
    pub enabled: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a session.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/sessions \
///   -H 'content-type: application/json' \
///   -d '{"event_id":"evt-001","staff_id":"staff-1"}'
/// ```
pub async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<StartSessionResponse>), AppError> {
    let session = CheckInSession::start(
        state.registry.as_ref(),
        state.pipeline.clone(),
        state.overrides.clone(),
        state.session_config,
        request.event_id,
        request.staff_id,
    )
    .await?;

    let response = StartSessionResponse {
        session_id: session.id(),
        event_name: session.event().name.clone(),
    };
    state.sessions.write().await.insert(session.id(), session);

    Ok((StatusCode::CREATED, Json(response)))
}

/// Session snapshot.
pub async fn get_session(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let session = state.session(id).await?;
    Ok(Json(session.snapshot().await))
}

/// Submit a scan.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/sessions/$ID/scans \
///   -H 'content-type: application/json' \
///   -d '{"code":"TKT-001-ABC","source":"manual"}'
/// # {"outcome":"completed","result":{"status":"admitted",...}}
/// ```
pub async fn submit_scan(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanOutcome>, AppError> {
    let session = state.session(id).await?;
    let outcome = session.submit_scan(request.code, request.source).await?;
    Ok(Json(outcome))
}

/// Stage an override.
pub async fn open_override(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<OpenOverrideRequest>,
) -> Result<Json<OverrideRequest>, AppError> {
    let session = state.session(id).await?;
    Ok(Json(session.open_override(request.code).await?))
}

/// Confirm an override. Incomplete input is a 422 and writes nothing.
pub async fn confirm_override(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<ConfirmOverrideRequest>,
) -> Result<Json<ValidationResult>, AppError> {
    let session = state.session(id).await?;
    let result = session
        .confirm_override(request.code, request.reason, request.free_text)
        .await?;
    Ok(Json(result))
}

/// Current counters.
pub async fn get_tally(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<SessionTally>, AppError> {
    let session = state.session(id).await?;
    Ok(Json(session.session_tally().await))
}

/// Start or stop the camera feed.
pub async fn set_feed(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<FeedRequest>,
) -> Result<StatusCode, AppError> {
    let session = state.session(id).await?;
    session.set_feed_enabled(request.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Report a decoder signal.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/sessions/$ID/decoder-signals \
///   -H 'content-type: application/json' \
///   -d '{"signal":"fault","kind":"permission_denied","detail":"NotAllowedError"}'
/// ```
pub async fn report_decoder_signal(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(signal): Json<DecoderSignal>,
) -> Result<StatusCode, AppError> {
    let session = state.session(id).await?;
    session.report_decoder_signal(signal).await?;
    Ok(StatusCode::ACCEPTED)
}

/// End a session and return its final tally.
pub async fn end_session(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<SessionTally>, AppError> {
    let session = state
        .sessions
        .write()
        .await
        .remove(&id)
        .ok_or_else(|| AppError::not_found("Session", id))?;
    Ok(Json(session.end().await?))
}
