//! Scan intake controller.
//!
//! Two producers feed one gate: a continuous decode stream from the camera
//! and discrete manual submissions from the keypad. The controller is a pure
//! reducer; the [`Store`](gatekeeper_runtime::Store) runtime executes its
//! effects and feeds results back in.
//!
//! ```text
//! Idle ──Start──▶ AwaitingInput ──scan──▶ Processing ──result──▶ ShowingResult
//!                       ▲                                             │
//!                       │                     (decode-sourced result) ▼
//!                       └────────────── cooldown elapsed ────────── Cooldown
//! ```
//!
//! - Only one scan is in flight at a time. Anything arriving meanwhile is
//!   discarded and never validated.
//! - A decode-sourced result suspends decode input for the cooldown interval,
//!   so a code held in front of the camera is not resubmitted every frame.
//!   Manual submissions are still accepted.
//! - Overrides do not pass through the single-flight gate.
//! - Every terminal result is folded into the tally exactly once.

use crate::metrics::CheckInMetrics;
use crate::overrides::{OverrideAuthority, OverrideGrant, OverrideRejection, OverrideRequest};
use crate::pipeline::ValidationPipeline;
use crate::tally::SessionTally;
use crate::types::{EventId, RequestId, ScanSource, StaffId, TicketCode, ValidationResult};
use gatekeeper_core::{Effects, effect::Effect, reducer::Reducer, smallvec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Where the gate is in its scan cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum IntakePhase {
    /// Session not started, or already ended
    Idle,
    /// Ready for the next scan
    AwaitingInput,
    /// A scan is being validated
    Processing {
        /// The scan in flight
        request_id: RequestId,
        /// Where it came from
        source: ScanSource,
    },
    /// Showing the latest result; accepts the next scan
    ShowingResult {
        /// Result on display
        result: ValidationResult,
    },
    /// Showing a result while decode input is suspended
    Cooldown {
        /// Result on display
        result: ValidationResult,
    },
}

impl IntakePhase {
    /// Whether a scan is in flight
    #[must_use]
    pub const fn is_processing(&self) -> bool {
        matches!(self, Self::Processing { .. })
    }

    /// Short name for logs and API responses
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingInput => "awaiting_input",
            Self::Processing { .. } => "processing",
            Self::ShowingResult { .. } => "showing_result",
            Self::Cooldown { .. } => "cooldown",
        }
    }
}

/// Camera feed state, orthogonal to the scan cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    /// Decode events are accepted
    #[default]
    Enabled,
    /// Decode events are discarded
    Disabled,
}

/// Why a scan was dropped without validation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Another scan is in flight
    Busy,
    /// Decode input is suspended after a decode-sourced result
    CoolingDown,
    /// The camera feed is stopped or faulted
    FeedDisabled,
    /// Nothing left after trimming
    EmptyCode,
    /// The session has not started or has ended
    NotStarted,
}

impl DiscardReason {
    /// Metric label and log value
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::CoolingDown => "cooling_down",
            Self::FeedDisabled => "feed_disabled",
            Self::EmptyCode => "empty_code",
            Self::NotStarted => "not_started",
        }
    }
}

/// Hardware failures reported by the decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFaultKind {
    /// No camera, or the camera is in use elsewhere
    HardwareUnavailable,
    /// Camera access was refused
    PermissionDenied,
}

impl std::fmt::Display for FeedFaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardwareUnavailable => write!(f, "hardware unavailable"),
            Self::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

/// A fault that disabled the feed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFault {
    /// What went wrong
    pub kind: FeedFaultKind,
    /// Decoder-provided detail
    pub detail: Option<String>,
}

/// Out-of-band signals from the decoder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DecoderSignal {
    /// A frame was read but held no code. Emitted continuously; ignored.
    NoCodeInFrame,
    /// The decoder cannot run
    Fault(FeedFault),
}

/// Intake state for one staff member at one event
#[derive(Clone, Debug)]
pub struct IntakeState {
    /// Event this gate admits for
    pub event_id: EventId,
    /// Staff member operating the gate
    pub staff_id: StaffId,
    /// Scan cycle phase
    pub phase: IntakePhase,
    /// Camera feed state
    pub feed: FeedState,
    /// Counters for this session
    pub tally: SessionTally,
    /// Override staged by `OpenOverride`, cleared on confirmation
    pub pending_override: Option<OverrideRequest>,
    /// Most recent terminal result, scans and overrides alike
    pub last_result: Option<ValidationResult>,
    in_flight: Option<RequestId>,
    cooldown: Option<u64>,
    cooldown_generation: u64,
    ended: bool,
}

impl IntakeState {
    /// Fresh, not yet started state
    #[must_use]
    pub const fn new(event_id: EventId, staff_id: StaffId) -> Self {
        Self {
            event_id,
            staff_id,
            phase: IntakePhase::Idle,
            feed: FeedState::Enabled,
            tally: SessionTally::new(),
            pending_override: None,
            last_result: None,
            in_flight: None,
            cooldown: None,
            cooldown_generation: 0,
            ended: false,
        }
    }

    /// Whether the session accepts input
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self.phase, IntakePhase::Idle)
    }

    /// Whether the session has been ended
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    /// Whether decode input is currently suspended by a cooldown
    #[must_use]
    pub const fn is_cooling_down(&self) -> bool {
        self.cooldown.is_some()
    }

    fn show(&mut self, result: ValidationResult) {
        self.phase = if self.is_cooling_down() {
            IntakePhase::Cooldown { result }
        } else {
            IntakePhase::ShowingResult { result }
        };
    }
}

/// Every input the intake controller observes
#[derive(Clone, Debug)]
pub enum IntakeAction {
    /// Open the gate
    Start,
    /// A scan from either producer
    ScanSubmitted {
        /// Correlation id
        request_id: RequestId,
        /// Raw code as read or typed
        code: String,
        /// Producer
        source: ScanSource,
    },
    /// The pipeline classified a scan
    ScanCompleted {
        /// Correlation id
        request_id: RequestId,
        /// Producer
        source: ScanSource,
        /// Classification
        result: ValidationResult,
    },
    /// A scan was dropped
    ScanDiscarded {
        /// Correlation id
        request_id: RequestId,
        /// Why
        reason: DiscardReason,
    },
    /// A cooldown timer fired
    CooldownElapsed {
        /// Cooldown this timer belongs to
        generation: u64,
    },
    /// Start or stop the camera feed
    SetFeedEnabled(bool),
    /// Signal from the decoder
    Decoder(DecoderSignal),
    /// The feed was disabled by a decoder fault
    FeedFaulted(FeedFault),
    /// Stage an override
    OpenOverride {
        /// Correlation id, becomes the request id
        request_id: RequestId,
        /// Code to prefill
        prefill: Option<TicketCode>,
    },
    /// An override was staged
    OverrideOpened(OverrideRequest),
    /// Confirm an override
    ConfirmOverride {
        /// Correlation id
        request_id: RequestId,
        /// Code to admit
        code: TicketCode,
        /// Preset label or custom reason
        reason_code: String,
        /// Required when the reason is `Other`
        free_text: Option<String>,
    },
    /// Override input was incomplete; nothing written
    OverrideRejected {
        /// Correlation id
        request_id: RequestId,
        /// What was missing
        rejection: OverrideRejection,
    },
    /// An override confirmation finished
    OverrideRecorded {
        /// Correlation id
        request_id: RequestId,
        /// `Admitted`, or `TransientError` if the ledger was unreachable
        result: ValidationResult,
    },
    /// A command arrived while the session was not active
    Refused {
        /// Correlation id
        request_id: RequestId,
    },
    /// Close the gate
    End,
}

impl IntakeAction {
    /// The request this action answers, for terminal replies only
    #[must_use]
    pub const fn reply_to(&self) -> Option<RequestId> {
        match self {
            Self::ScanCompleted { request_id, .. }
            | Self::ScanDiscarded { request_id, .. }
            | Self::OverrideRejected { request_id, .. }
            | Self::OverrideRecorded { request_id, .. }
            | Self::Refused { request_id } => Some(*request_id),
            Self::OverrideOpened(request) => Some(request.id),
            _ => None,
        }
    }
}

/// Dependencies of the intake controller
#[derive(Clone, Debug)]
pub struct IntakeEnvironment {
    /// Classifies scans
    pub pipeline: Arc<ValidationPipeline>,
    /// Writes overrides
    pub overrides: Arc<OverrideAuthority>,
    /// Decode suspension after a decode-sourced result
    pub cooldown: Duration,
}

/// Reducer for the scan intake controller
#[derive(Clone, Copy, Debug, Default)]
pub struct IntakeReducer;

impl IntakeReducer {
    fn discard(request_id: RequestId, reason: DiscardReason) -> Effects<IntakeAction> {
        tracing::debug!(%request_id, reason = reason.label(), "Scan discarded");
        CheckInMetrics::record_discard(reason);
        smallvec![Effect::emit(IntakeAction::ScanDiscarded { request_id, reason })]
    }

    fn submit(
        state: &mut IntakeState,
        request_id: RequestId,
        code: &str,
        source: ScanSource,
        env: &IntakeEnvironment,
    ) -> Effects<IntakeAction> {
        if !state.is_active() {
            return Self::discard(request_id, DiscardReason::NotStarted);
        }
        let code = TicketCode::new(code);
        if code.is_empty() {
            return Self::discard(request_id, DiscardReason::EmptyCode);
        }
        if state.in_flight.is_some() {
            return Self::discard(request_id, DiscardReason::Busy);
        }
        if source == ScanSource::Decode {
            if state.feed == FeedState::Disabled {
                return Self::discard(request_id, DiscardReason::FeedDisabled);
            }
            if state.is_cooling_down() {
                return Self::discard(request_id, DiscardReason::CoolingDown);
            }
        }

        state.in_flight = Some(request_id);
        state.phase = IntakePhase::Processing { request_id, source };

        let pipeline = Arc::clone(&env.pipeline);
        let event_id = state.event_id.clone();
        let staff_id = state.staff_id.clone();
        smallvec![Effect::future(async move {
            let result = pipeline.validate(&code, &event_id, &staff_id).await;
            Some(IntakeAction::ScanCompleted {
                request_id,
                source,
                result,
            })
        })]
    }

    fn complete(
        state: &mut IntakeState,
        request_id: RequestId,
        source: ScanSource,
        result: ValidationResult,
        env: &IntakeEnvironment,
    ) -> Effects<IntakeAction> {
        if state.in_flight != Some(request_id) {
            tracing::warn!(%request_id, "Ignoring result for a scan that is not in flight");
            return Effects::new();
        }
        state.in_flight = None;
        state.tally.record(&result);
        state.last_result = Some(result.clone());

        if !state.is_active() {
            return Effects::new();
        }

        let mut effects = Effects::new();
        if source == ScanSource::Decode {
            state.cooldown_generation += 1;
            let generation = state.cooldown_generation;
            state.cooldown = Some(generation);
            effects.push(Effect::delay(
                env.cooldown,
                IntakeAction::CooldownElapsed { generation },
            ));
        }
        state.show(result);
        effects
    }
}

impl Reducer for IntakeReducer {
    type State = IntakeState;
    type Action = IntakeAction;
    type Environment = IntakeEnvironment;

    fn reduce(
        &self,
        state: &mut IntakeState,
        action: IntakeAction,
        env: &IntakeEnvironment,
    ) -> Effects<IntakeAction> {
        match action {
            IntakeAction::Start => {
                if state.ended || state.is_active() {
                    return Effects::new();
                }
                state.phase = IntakePhase::AwaitingInput;
                CheckInMetrics::record_session_started();
                tracing::info!(event = %state.event_id, staff = %state.staff_id, "Session started");
                Effects::new()
            },

            IntakeAction::ScanSubmitted {
                request_id,
                code,
                source,
            } => Self::submit(state, request_id, &code, source, env),

            IntakeAction::ScanCompleted {
                request_id,
                source,
                result,
            } => Self::complete(state, request_id, source, result, env),

            IntakeAction::CooldownElapsed { generation } => {
                if state.cooldown == Some(generation) {
                    state.cooldown = None;
                    if matches!(state.phase, IntakePhase::Cooldown { .. }) {
                        state.phase = IntakePhase::AwaitingInput;
                    }
                }
                Effects::new()
            },

            IntakeAction::SetFeedEnabled(enabled) => {
                state.feed = if enabled {
                    FeedState::Enabled
                } else {
                    FeedState::Disabled
                };
                tracing::debug!(feed = ?state.feed, "Feed toggled");
                Effects::new()
            },

            IntakeAction::Decoder(DecoderSignal::NoCodeInFrame) => Effects::new(),

            IntakeAction::Decoder(DecoderSignal::Fault(fault)) => {
                state.feed = FeedState::Disabled;
                CheckInMetrics::record_feed_fault();
                tracing::warn!(
                    kind = %fault.kind,
                    detail = fault.detail.as_deref().unwrap_or(""),
                    staff = %state.staff_id,
                    "Camera feed disabled"
                );
                smallvec![Effect::emit(IntakeAction::FeedFaulted(fault))]
            },

            IntakeAction::OpenOverride {
                request_id,
                prefill,
            } => {
                if !state.is_active() {
                    return smallvec![Effect::emit(IntakeAction::Refused { request_id })];
                }
                let request = OverrideRequest {
                    id: request_id,
                    ..env.overrides.open(prefill)
                };
                state.pending_override = Some(request.clone());
                smallvec![Effect::emit(IntakeAction::OverrideOpened(request))]
            },

            IntakeAction::ConfirmOverride {
                request_id,
                code,
                reason_code,
                free_text,
            } => {
                if !state.is_active() {
                    return smallvec![Effect::emit(IntakeAction::Refused { request_id })];
                }
                let grant = match OverrideGrant::prepare(&code, &reason_code, free_text.as_deref())
                {
                    Ok(grant) => grant,
                    Err(rejection) => {
                        CheckInMetrics::record_override_rejected();
                        tracing::info!(%rejection, staff = %state.staff_id, "Override rejected");
                        return smallvec![Effect::emit(IntakeAction::OverrideRejected {
                            request_id,
                            rejection,
                        })];
                    },
                };
                state.pending_override = None;

                let overrides = Arc::clone(&env.overrides);
                let event_id = state.event_id.clone();
                let staff_id = state.staff_id.clone();
                smallvec![Effect::future(async move {
                    let result = overrides.record(&event_id, &staff_id, grant).await;
                    Some(IntakeAction::OverrideRecorded { request_id, result })
                })]
            },

            IntakeAction::OverrideRecorded { result, .. } => {
                state.tally.record(&result);
                state.last_result = Some(result.clone());
                if state.is_active() && !state.phase.is_processing() {
                    state.show(result);
                }
                Effects::new()
            },

            IntakeAction::End => {
                if state.ended {
                    return Effects::new();
                }
                state.ended = true;
                state.phase = IntakePhase::Idle;
                state.cooldown = None;
                state.pending_override = None;
                tracing::info!(
                    event = %state.event_id,
                    staff = %state.staff_id,
                    valid = state.tally.valid_count(),
                    invalid = state.tally.invalid_count(),
                    "Session ended"
                );
                Effects::new()
            },

            // Notifications for observers
            IntakeAction::ScanDiscarded { .. }
            | IntakeAction::FeedFaulted(_)
            | IntakeAction::OverrideOpened(_)
            | IntakeAction::OverrideRejected { .. }
            | IntakeAction::Refused { .. } => Effects::new(),
        }
    }
}
