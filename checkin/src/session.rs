//! Check-in session: one staff member operating one gate at one event.
//!
//! The session owns an intake [`Store`] and turns each command into an
//! action plus a wait for the reply carrying the same [`RequestId`].

use crate::intake::{
    DecoderSignal, DiscardReason, FeedFault, FeedState, IntakeAction, IntakeEnvironment,
    IntakePhase, IntakeReducer, IntakeState,
};
use crate::overrides::{OverrideAuthority, OverrideRejection, OverrideRequest};
use crate::pipeline::ValidationPipeline;
use crate::ports::{EventRegistry, PortError};
use crate::tally::SessionTally;
use crate::types::{EventId, EventInfo, RequestId, ScanSource, StaffId, TicketCode, ValidationResult};
use gatekeeper_runtime::{Store, StoreError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

type IntakeStore = Store<IntakeState, IntakeAction, IntakeEnvironment, IntakeReducer>;

/// Slack a caller waits beyond the pipeline's own worst case
pub const REPLY_MARGIN: Duration = Duration::from_millis(500);

/// Session timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Decode suspension after a decode-sourced result
    pub cooldown: Duration,
    /// How long a caller waits for a scan or override reply
    ///
    /// Raised at session start to cover the pipeline's worst case, so a
    /// reply never times out while its validation can still succeed.
    pub result_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(1500),
            result_timeout: Duration::from_secs(10),
        }
    }
}

/// Errors from session operations
///
/// Classification outcomes are never errors; they come back as
/// [`ValidationResult`] variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No such event
    #[error("Event {0} not found")]
    UnknownEvent(EventId),

    /// Staff member is not on the event's roster
    #[error("Staff {staff_id} is not assigned to event {event_id}")]
    StaffNotAssigned {
        /// Event requested
        event_id: EventId,
        /// Staff member refused
        staff_id: StaffId,
    },

    /// The session has ended
    #[error("Session has ended")]
    Ended,

    /// Override input was incomplete; nothing was written
    #[error("Override rejected: {0}")]
    OverrideRejected(#[from] OverrideRejection),

    /// The event registry could not be reached
    #[error("Event registry unavailable: {0}")]
    Registry(#[from] PortError),

    /// The intake store failed
    #[error("Intake store error: {0}")]
    Store(StoreError),

    /// The intake store answered with an action that does not fit the command
    #[error("Unexpected intake reply: {0}")]
    UnexpectedReply(String),
}

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ShutdownInProgress => Self::Ended,
            other => Self::Store(other),
        }
    }
}

/// What happened to a submitted scan
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// The scan was validated
    Completed {
        /// Classification
        result: ValidationResult,
    },
    /// The scan was dropped without validation or tallying
    Discarded {
        /// Why
        reason: DiscardReason,
    },
}

/// Read-only view of a session for presentation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub session_id: Uuid,
    /// Event the gate admits for
    pub event_id: EventId,
    /// Staff member operating the gate
    pub staff_id: StaffId,
    /// Scan cycle phase
    pub phase: IntakePhase,
    /// Camera feed state
    pub feed: FeedState,
    /// Counters
    pub tally: SessionTally,
    /// Staged override, if any
    pub pending_override: Option<OverrideRequest>,
    /// Most recent terminal result
    pub last_result: Option<ValidationResult>,
}

/// Feed faults raised by the decoder for one session
pub struct FeedFaultSubscription {
    rx: broadcast::Receiver<IntakeAction>,
}

impl FeedFaultSubscription {
    /// Next feed fault, or `None` once the session is gone
    pub async fn recv(&mut self) -> Option<FeedFault> {
        loop {
            match self.rx.recv().await {
                Ok(IntakeAction::FeedFaulted(fault)) => return Some(fault),
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Feed fault observer lagged");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A started check-in session
#[derive(Clone)]
pub struct CheckInSession {
    id: Uuid,
    event: Arc<EventInfo>,
    staff_id: StaffId,
    config: SessionConfig,
    reply_timeout: Duration,
    store: IntakeStore,
    ended: Arc<AtomicBool>,
    last_active: Arc<Mutex<Instant>>,
}

impl CheckInSession {
    /// Start a session after checking the event exists and the staff member
    /// is on its roster
    ///
    /// # Errors
    ///
    /// - [`SessionError::UnknownEvent`]: no such event
    /// - [`SessionError::StaffNotAssigned`]: staff not on the roster
    /// - [`SessionError::Registry`]: the registry is unreachable
    #[tracing::instrument(skip(registry, pipeline, overrides, config), fields(event = %event_id, staff = %staff_id))]
    pub async fn start(
        registry: &dyn EventRegistry,
        pipeline: Arc<ValidationPipeline>,
        overrides: Arc<OverrideAuthority>,
        config: SessionConfig,
        event_id: EventId,
        staff_id: StaffId,
    ) -> Result<Self, SessionError> {
        let store_timeout = pipeline.store_timeout();
        let event = tokio::time::timeout(store_timeout, registry.get_event(&event_id))
            .await
            .map_err(|_| PortError::Timeout {
                store: "event registry",
                millis: u64::try_from(store_timeout.as_millis()).unwrap_or(u64::MAX),
            })??
            .ok_or_else(|| SessionError::UnknownEvent(event_id.clone()))?;

        if !event.has_staff(&staff_id) {
            tracing::info!("Refused session for staff outside the event roster");
            return Err(SessionError::StaffNotAssigned { event_id, staff_id });
        }

        let reply_timeout = config
            .result_timeout
            .max(pipeline.worst_case() + REPLY_MARGIN);
        if reply_timeout > config.result_timeout {
            tracing::warn!(
                configured_ms = u64::try_from(config.result_timeout.as_millis()).unwrap_or(u64::MAX),
                effective_ms = u64::try_from(reply_timeout.as_millis()).unwrap_or(u64::MAX),
                "Result timeout raised to cover store timeouts"
            );
        }

        let environment = IntakeEnvironment {
            pipeline,
            overrides,
            cooldown: config.cooldown,
        };
        let store = Store::new(
            IntakeState::new(event_id, staff_id.clone()),
            IntakeReducer,
            environment,
        );
        store.send(IntakeAction::Start).await?;

        Ok(Self {
            id: Uuid::new_v4(),
            event: Arc::new(event),
            staff_id,
            config,
            reply_timeout,
            store,
            ended: Arc::new(AtomicBool::new(false)),
            last_active: Arc::new(Mutex::new(Instant::now())),
        })
    }

    /// Session id
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The event this session admits for
    #[must_use]
    pub fn event(&self) -> &EventInfo {
        &self.event
    }

    /// The staff member operating this session
    #[must_use]
    pub const fn staff_id(&self) -> &StaffId {
        &self.staff_id
    }

    /// Submit a decoded or typed code and wait for its outcome
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Ended`] once the session has ended, or a
    /// store error if no reply arrives within the result timeout.
    pub async fn submit_scan(
        &self,
        code: impl Into<String>,
        source: ScanSource,
    ) -> Result<ScanOutcome, SessionError> {
        let request_id = RequestId::new();
        let reply = self
            .request(
                request_id,
                IntakeAction::ScanSubmitted {
                    request_id,
                    code: code.into(),
                    source,
                },
            )
            .await?;

        match reply {
            IntakeAction::ScanCompleted { result, .. } => Ok(ScanOutcome::Completed { result }),
            IntakeAction::ScanDiscarded { reason, .. } => Ok(ScanOutcome::Discarded { reason }),
            other => Err(unexpected(&other)),
        }
    }

    /// Stage an override, optionally prefilled with a code
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Ended`] once the session has ended.
    pub async fn open_override(
        &self,
        prefill: Option<TicketCode>,
    ) -> Result<OverrideRequest, SessionError> {
        let request_id = RequestId::new();
        match self
            .request(request_id, IntakeAction::OpenOverride { request_id, prefill })
            .await?
        {
            IntakeAction::OverrideOpened(request) => Ok(request),
            IntakeAction::Refused { .. } => Err(SessionError::Ended),
            other => Err(unexpected(&other)),
        }
    }

    /// Confirm an override, admitting `code` regardless of the ledger
    ///
    /// Returns `Admitted`, or `TransientError` if the ledger could not be
    /// reached. Either way the outcome is tallied.
    ///
    /// # Errors
    ///
    /// - [`SessionError::OverrideRejected`]: empty code or reason, nothing written
    /// - [`SessionError::Ended`]: the session has ended
    pub async fn confirm_override(
        &self,
        code: TicketCode,
        reason_code: impl Into<String>,
        free_text: Option<String>,
    ) -> Result<ValidationResult, SessionError> {
        let request_id = RequestId::new();
        let action = IntakeAction::ConfirmOverride {
            request_id,
            code,
            reason_code: reason_code.into(),
            free_text,
        };
        match self.request(request_id, action).await? {
            IntakeAction::OverrideRecorded { result, .. } => Ok(result),
            IntakeAction::OverrideRejected { rejection, .. } => Err(rejection.into()),
            IntakeAction::Refused { .. } => Err(SessionError::Ended),
            other => Err(unexpected(&other)),
        }
    }

    /// Current counters
    pub async fn session_tally(&self) -> SessionTally {
        self.store.state(|state| state.tally).await
    }

    /// Current scan cycle phase
    pub async fn phase(&self) -> IntakePhase {
        self.store.state(|state| state.phase.clone()).await
    }

    /// Everything presentation needs in one read
    pub async fn snapshot(&self) -> SessionSnapshot {
        let session_id = self.id;
        self.store
            .state(|state| SessionSnapshot {
                session_id,
                event_id: state.event_id.clone(),
                staff_id: state.staff_id.clone(),
                phase: state.phase.clone(),
                feed: state.feed,
                tally: state.tally,
                pending_override: state.pending_override.clone(),
                last_result: state.last_result.clone(),
            })
            .await
    }

    /// Start or stop the camera feed. An in-flight validation is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Ended`] once the session has ended.
    pub async fn set_feed_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.store.send(IntakeAction::SetFeedEnabled(enabled)).await?;
        Ok(())
    }

    /// Pass a decoder signal to the intake controller
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Ended`] once the session has ended.
    pub async fn report_decoder_signal(&self, signal: DecoderSignal) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.store.send(IntakeAction::Decoder(signal)).await?;
        Ok(())
    }

    /// Whether `end` has been called
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Time since the last command on this session
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Observe feed faults from now on
    #[must_use]
    pub fn subscribe_feed_faults(&self) -> FeedFaultSubscription {
        FeedFaultSubscription {
            rx: self.store.subscribe_actions(),
        }
    }

    /// End the session and return the final tally
    ///
    /// A validation already in flight is allowed to finish and is counted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Ended`] if the session was already ended.
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn end(&self) -> Result<SessionTally, SessionError> {
        // Later commands fail fast instead of racing the shutdown below.
        if self.ended.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Ended);
        }
        self.store.send(IntakeAction::End).await?;

        let grace = self.reply_timeout + self.config.cooldown;
        if let Err(error) = self.store.wait_for_idle(grace).await {
            tracing::warn!(%error, "Session ended with effects still running");
        }
        if let Err(error) = self.store.shutdown(Duration::ZERO).await {
            tracing::warn!(%error, "Intake store did not shut down cleanly");
        }

        Ok(self.session_tally().await)
    }

    async fn request(
        &self,
        request_id: RequestId,
        action: IntakeAction,
    ) -> Result<IntakeAction, SessionError> {
        self.ensure_open()?;
        let reply = self
            .store
            .send_and_wait_for(
                action,
                |reply| reply.reply_to() == Some(request_id),
                self.reply_timeout,
            )
            .await;
        match reply {
            Ok(reply) => Ok(reply),
            Err(StoreError::Timeout) if self.is_ended() => Err(SessionError::Ended),
            Err(error) => Err(error.into()),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_ended() {
            return Err(SessionError::Ended);
        }
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        Ok(())
    }
}

impl std::fmt::Debug for CheckInSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckInSession")
            .field("id", &self.id)
            .field("event_id", &self.event.id)
            .field("staff_id", &self.staff_id)
            .finish_non_exhaustive()
    }
}

fn unexpected(action: &IntakeAction) -> SessionError {
    SessionError::UnexpectedReply(format!("{action:?}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::{Fault, InMemoryBackend};
    use crate::types::AttendeeRef;
    use gatekeeper_testing::test_clock;

    async fn session(backend: &InMemoryBackend, staff: &str) -> Result<CheckInSession, SessionError> {
        let pipeline = Arc::new(ValidationPipeline::new(
            backend.tickets.clone(),
            backend.ledger.clone(),
            Arc::new(test_clock()),
            Duration::from_millis(200),
        ));
        let overrides = Arc::new(OverrideAuthority::from_pipeline(&pipeline));
        CheckInSession::start(
            backend.events.as_ref(),
            pipeline,
            overrides,
            SessionConfig::default(),
            EventId::new("evt-001"),
            StaffId::new(staff),
        )
        .await
    }

    #[tokio::test]
    async fn staff_outside_roster_cannot_start() {
        let backend = InMemoryBackend::seeded();
        let error = session(&backend, "staff-3").await.unwrap_err();
        assert!(matches!(error, SessionError::StaffNotAssigned { .. }));
    }

    #[tokio::test]
    async fn manual_scan_completes_and_is_tallied() {
        let backend = InMemoryBackend::seeded();
        let session = session(&backend, "staff-1").await.unwrap();

        let outcome = session
            .submit_scan("TKT-001-ABC", ScanSource::Manual)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ScanOutcome::Completed {
                result: ValidationResult::Admitted {
                    attendee: AttendeeRef::new("Ada Lovelace"),
                    ticket_type_id: Some(crate::types::TicketTypeId::new("general")),
                }
            }
        );
        assert_eq!(session.session_tally().await.valid_count(), 1);
    }

    #[tokio::test]
    async fn blank_scan_is_discarded_untallied() {
        let backend = InMemoryBackend::seeded();
        let session = session(&backend, "staff-1").await.unwrap();

        let outcome = session.submit_scan(" \n", ScanSource::Manual).await.unwrap();

        assert_eq!(
            outcome,
            ScanOutcome::Discarded {
                reason: DiscardReason::EmptyCode
            }
        );
        assert_eq!(session.session_tally().await.total(), 0);
    }

    #[tokio::test]
    async fn ended_session_refuses_commands() {
        let backend = InMemoryBackend::seeded();
        let session = session(&backend, "staff-1").await.unwrap();
        session.submit_scan("NOPE", ScanSource::Manual).await.unwrap();

        let tally = session.end().await.unwrap();

        assert_eq!(tally.invalid_count(), 1);
        assert_eq!(
            session.submit_scan("TKT-001-ABC", ScanSource::Manual).await,
            Err(SessionError::Ended)
        );
        assert_eq!(session.end().await, Err(SessionError::Ended));
        assert_eq!(session.phase().await, IntakePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_fail_fast_while_end_drains() {
        let backend = InMemoryBackend::seeded();
        let session = session(&backend, "staff-1").await.unwrap();
        backend.faults.set(Fault::Stall(Duration::from_millis(150)));

        let in_flight = {
            let session = session.clone();
            tokio::spawn(async move { session.submit_scan("TKT-001-ABC", ScanSource::Manual).await })
        };
        while !session.phase().await.is_processing() {
            tokio::task::yield_now().await;
        }
        let ending = {
            let session = session.clone();
            tokio::spawn(async move { session.end().await })
        };
        while !session.is_ended() {
            tokio::task::yield_now().await;
        }

        let refused = tokio::time::timeout(
            Duration::from_millis(1),
            session.submit_scan("TKT-001-DEF", ScanSource::Manual),
        )
        .await;
        assert_eq!(refused, Ok(Err(SessionError::Ended)));

        let tally = ending.await.unwrap().unwrap();
        assert_eq!(tally.valid_count(), 1);
        assert!(in_flight.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_tracks_the_last_command() {
        let backend = InMemoryBackend::seeded();
        let session = session(&backend, "staff-1").await.unwrap();

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(session.idle_for() >= Duration::from_secs(90));

        session.set_feed_enabled(false).await.unwrap();
        assert!(session.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn override_rejection_surfaces_as_error() {
        let backend = InMemoryBackend::seeded();
        let session = session(&backend, "staff-1").await.unwrap();

        let result = session
            .confirm_override(TicketCode::new("TKT-001-ABC"), "Other", None)
            .await;

        assert_eq!(
            result,
            Err(SessionError::OverrideRejected(OverrideRejection::EmptyReason))
        );
        assert!(backend.ledger.is_empty());
    }
}
