//! Supervised override: admit a code regardless of what the ledger says.
//!
//! An override deliberately weakens the at-most-once guarantee, so every one
//! is written to the ledger with the staff member, timestamp and a non-empty
//! reason. Input problems are rejected *before* the ledger is touched and
//! leave no audit entry.

use crate::metrics::CheckInMetrics;
use crate::pipeline::ValidationPipeline;
use crate::ports::{CheckInLedger, TicketStore};
use crate::types::{
    AttendeeRef, CheckInRecord, EventId, RequestId, StaffId, TicketCode, ValidationResult,
};
use chrono::{DateTime, Utc};
use gatekeeper_core::environment::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Preset reasons offered to staff
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideReason {
    /// Guest of honor or VIP without a scannable ticket
    VipAccess,
    /// Holder lost the ticket but is verified by other means
    LostTicket,
    /// Ticket is valid but will not scan
    ScannerFailure,
    /// Name appears on the organizer's guest list
    GuestList,
    /// Anything else; free text required
    Other,
}

impl OverrideReason {
    /// Every preset, in display order
    pub const ALL: [Self; 5] = [
        Self::VipAccess,
        Self::LostTicket,
        Self::ScannerFailure,
        Self::GuestList,
        Self::Other,
    ];

    /// The reason code as shown to staff and written to the ledger
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::VipAccess => "VIP access",
            Self::LostTicket => "Lost ticket",
            Self::ScannerFailure => "Scanner failure",
            Self::GuestList => "Name on guest list",
            Self::Other => "Other",
        }
    }

    /// Match a reason code against the presets, ignoring case
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|reason| reason.label().eq_ignore_ascii_case(code))
    }
}

/// Why an override confirmation was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideRejection {
    /// No ticket code was supplied
    #[error("a ticket code is required to override")]
    EmptyCode,
    /// No usable reason was supplied (free text is required for "Other")
    #[error("an override reason is required")]
    EmptyReason,
}

/// Resolve the reason written to the ledger
///
/// - a preset other than `Other` resolves to its label, with any free text
///   appended as a note
/// - `Other` resolves to the free text, which must be non-empty
/// - any other non-empty code is taken verbatim
///
/// # Errors
///
/// Returns [`OverrideRejection::EmptyReason`] if nothing usable remains.
pub fn resolve_reason(
    reason_code: &str,
    free_text: Option<&str>,
) -> Result<String, OverrideRejection> {
    let note = free_text.map(str::trim).filter(|text| !text.is_empty());

    match OverrideReason::from_code(reason_code) {
        Some(OverrideReason::Other) => note
            .map(str::to_string)
            .ok_or(OverrideRejection::EmptyReason),
        Some(preset) => Ok(match note {
            Some(note) => format!("{}: {note}", preset.label()),
            None => preset.label().to_string(),
        }),
        None => {
            let custom = reason_code.trim();
            if custom.is_empty() {
                Err(OverrideRejection::EmptyReason)
            } else {
                Ok(custom.to_string())
            }
        },
    }
}

/// A staged override awaiting confirmation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRequest {
    /// Identifies the request
    pub id: RequestId,
    /// Code the form opens with, usually the code that was just refused
    pub prefill_code: Option<TicketCode>,
    /// When the request was staged
    pub opened_at: DateTime<Utc>,
}

/// A validated override, ready to be written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverrideGrant {
    /// Code to admit
    pub code: TicketCode,
    /// Resolved, non-empty reason
    pub reason: String,
}

impl OverrideGrant {
    /// Validate raw confirmation input
    ///
    /// # Errors
    ///
    /// Returns [`OverrideRejection`] if the code or the resolved reason is empty.
    pub fn prepare(
        code: &TicketCode,
        reason_code: &str,
        free_text: Option<&str>,
    ) -> Result<Self, OverrideRejection> {
        if code.is_empty() {
            return Err(OverrideRejection::EmptyCode);
        }
        let reason = resolve_reason(reason_code, free_text)?;
        Ok(Self {
            code: code.clone(),
            reason,
        })
    }
}

/// Writes override admissions to the ledger
#[derive(Clone)]
pub struct OverrideAuthority {
    tickets: Arc<dyn TicketStore>,
    ledger: Arc<dyn CheckInLedger>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl OverrideAuthority {
    /// Creates a new `OverrideAuthority`
    #[must_use]
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        ledger: Arc<dyn CheckInLedger>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            tickets,
            ledger,
            clock,
            store_timeout,
        }
    }

    /// Share the stores, clock and timeout of a pipeline
    #[must_use]
    pub fn from_pipeline(pipeline: &ValidationPipeline) -> Self {
        Self::new(
            Arc::clone(pipeline.tickets()),
            Arc::clone(pipeline.ledger()),
            Arc::clone(pipeline.clock()),
            pipeline.store_timeout(),
        )
    }

    /// Stage an override request. Touches no store.
    #[must_use]
    pub fn open(&self, prefill_code: Option<TicketCode>) -> OverrideRequest {
        OverrideRequest {
            id: RequestId::new(),
            prefill_code: prefill_code.filter(|code| !code.is_empty()),
            opened_at: self.clock.now(),
        }
    }

    /// Validate and write an override in one call
    ///
    /// # Errors
    ///
    /// Returns [`OverrideRejection`] without writing anything if the input
    /// is incomplete.
    pub async fn confirm(
        &self,
        event_id: &EventId,
        staff_id: &StaffId,
        code: &TicketCode,
        reason_code: &str,
        free_text: Option<&str>,
    ) -> Result<ValidationResult, OverrideRejection> {
        match OverrideGrant::prepare(code, reason_code, free_text) {
            Ok(grant) => Ok(self.record(event_id, staff_id, grant).await),
            Err(rejection) => {
                CheckInMetrics::record_override_rejected();
                tracing::info!(%rejection, %staff_id, "Override rejected");
                Err(rejection)
            },
        }
    }

    /// Append a validated override, with no precedence checks
    ///
    /// Returns `Admitted`, or `TransientError` if the ledger is unreachable.
    ///
    /// A timed-out append may still have been committed. In that case the
    /// history is read back once, and the override counts as written if its
    /// record is there. If the read also fails the result is `TransientError`
    /// even though the record may exist; the ledger history stays the
    /// authority for what was admitted.
    #[tracing::instrument(
        skip_all,
        fields(code = %grant.code, event = %event_id, staff = %staff_id, reason = %grant.reason)
    )]
    pub async fn record(
        &self,
        event_id: &EventId,
        staff_id: &StaffId,
        grant: OverrideGrant,
    ) -> ValidationResult {
        let OverrideGrant { code, reason } = grant;
        let record = CheckInRecord::overridden(
            code.clone(),
            event_id.clone(),
            self.clock.now(),
            staff_id.clone(),
            reason,
        );

        let appended = tokio::time::timeout(
            self.store_timeout,
            self.ledger.append_unconditional(record.clone()),
        )
        .await;

        match appended {
            Ok(Ok(())) => {},
            Ok(Err(error)) => {
                tracing::warn!(%error, "Override not written, ledger unreachable");
                return ValidationResult::TransientError;
            },
            Err(_) if self.committed(&record).await => {
                tracing::info!("Override append timed out after commit");
            },
            Err(_) => {
                tracing::warn!("Override not confirmed, ledger call timed out");
                return ValidationResult::TransientError;
            },
        }

        CheckInMetrics::record_override();
        tracing::info!("Override admission written");

        // Display details are best effort; the admission is already recorded.
        let ticket = tokio::time::timeout(self.store_timeout, self.tickets.lookup_ticket(&code))
            .await
            .ok()
            .and_then(Result::ok)
            .flatten();

        match ticket {
            Some(ticket) => ValidationResult::Admitted {
                attendee: ticket.attendee,
                ticket_type_id: Some(ticket.ticket_type_id),
            },
            None => ValidationResult::Admitted {
                attendee: AttendeeRef::new(code.as_str()),
                ticket_type_id: None,
            },
        }
    }

    async fn committed(&self, written: &CheckInRecord) -> bool {
        let history = tokio::time::timeout(
            self.store_timeout,
            self.ledger.records(&written.ticket_code, &written.event_id),
        )
        .await;

        matches!(
            history,
            Ok(Ok(records)) if records.iter().any(|record| same_write(record, written))
        )
    }
}

// Postgres keeps microseconds.
fn same_write(stored: &CheckInRecord, written: &CheckInRecord) -> bool {
    stored.staff_id == written.staff_id
        && stored.override_reason == written.override_reason
        && stored.timestamp.timestamp_micros() == written.timestamp.timestamp_micros()
}

impl std::fmt::Debug for OverrideAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideAuthority")
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::{Fault, InMemoryBackend, InMemoryLedger};
    use crate::ports::{AppendOutcome, PortFuture};
    use gatekeeper_testing::test_clock;

    /// Commits the write, then hangs before acknowledging it.
    struct LateAckLedger {
        inner: Arc<InMemoryLedger>,
        hang: Duration,
    }

    impl CheckInLedger for LateAckLedger {
        fn find_record<'a>(
            &'a self,
            code: &'a TicketCode,
            event_id: &'a EventId,
        ) -> PortFuture<'a, Option<CheckInRecord>> {
            self.inner.find_record(code, event_id)
        }

        fn append_if_absent(&self, record: CheckInRecord) -> PortFuture<'_, AppendOutcome> {
            self.inner.append_if_absent(record)
        }

        fn append_unconditional(&self, record: CheckInRecord) -> PortFuture<'_, ()> {
            Box::pin(async move {
                self.inner.append_unconditional(record).await?;
                tokio::time::sleep(self.hang).await;
                Ok(())
            })
        }

        fn records<'a>(
            &'a self,
            code: &'a TicketCode,
            event_id: &'a EventId,
        ) -> PortFuture<'a, Vec<CheckInRecord>> {
            self.inner.records(code, event_id)
        }
    }

    fn authority(backend: &InMemoryBackend) -> OverrideAuthority {
        OverrideAuthority::new(
            backend.tickets.clone(),
            backend.ledger.clone(),
            Arc::new(test_clock()),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn preset_reasons_resolve_to_their_label() {
        assert_eq!(resolve_reason("VIP access", None).unwrap(), "VIP access");
        assert_eq!(resolve_reason("vip ACCESS", Some("  ")).unwrap(), "VIP access");
        assert_eq!(
            resolve_reason("Lost ticket", Some("ID checked")).unwrap(),
            "Lost ticket: ID checked"
        );
    }

    #[test]
    fn other_requires_free_text() {
        assert_eq!(resolve_reason("Other", None), Err(OverrideRejection::EmptyReason));
        assert_eq!(resolve_reason("Other", Some("   ")), Err(OverrideRejection::EmptyReason));
        assert_eq!(
            resolve_reason("Other", Some("Performer's partner")).unwrap(),
            "Performer's partner"
        );
    }

    #[test]
    fn custom_and_empty_reason_codes() {
        assert_eq!(resolve_reason("Press pass", None).unwrap(), "Press pass");
        assert_eq!(resolve_reason("  ", None), Err(OverrideRejection::EmptyReason));
    }

    #[test]
    fn open_stages_request_with_prefill() {
        let backend = InMemoryBackend::new();
        let request = authority(&backend).open(Some(TicketCode::new("TKT-9")));
        assert_eq!(request.prefill_code, Some(TicketCode::new("TKT-9")));
        assert!(backend.ledger.is_empty());

        let blank = authority(&backend).open(Some(TicketCode::new("  ")));
        assert_eq!(blank.prefill_code, None);
    }

    #[tokio::test]
    async fn override_appends_even_when_already_admitted() {
        let backend = InMemoryBackend::seeded();
        let authority = authority(&backend);
        let code = TicketCode::new("TKT-001-ABC");
        let event = EventId::new("evt-001");
        let staff = StaffId::new("staff-1");

        authority
            .ledger
            .append_if_absent(CheckInRecord::organic(
                code.clone(),
                event.clone(),
                test_clock().now(),
                staff.clone(),
            ))
            .await
            .unwrap();

        let result = authority
            .confirm(&event, &staff, &code, "VIP access", None)
            .await
            .unwrap();

        assert!(result.is_admitted());
        let history = backend.ledger.records(&code, &event).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].override_reason.as_deref(), Some("VIP access"));
        assert_eq!(history[1].staff_id, staff);
    }

    #[tokio::test]
    async fn rejected_override_writes_nothing() {
        let backend = InMemoryBackend::seeded();
        let authority = authority(&backend);
        let event = EventId::new("evt-001");
        let staff = StaffId::new("staff-1");

        let empty_code = authority
            .confirm(&event, &staff, &TicketCode::new(" "), "VIP access", None)
            .await;
        let empty_reason = authority
            .confirm(&event, &staff, &TicketCode::new("TKT-001-ABC"), "Other", None)
            .await;

        assert_eq!(empty_code, Err(OverrideRejection::EmptyCode));
        assert_eq!(empty_reason, Err(OverrideRejection::EmptyReason));
        assert!(backend.ledger.is_empty());
    }

    #[tokio::test]
    async fn unknown_code_override_uses_code_as_attendee() {
        let backend = InMemoryBackend::seeded();
        let result = authority(&backend)
            .confirm(
                &EventId::new("evt-001"),
                &StaffId::new("staff-1"),
                &TicketCode::new("PAPER-77"),
                "Name on guest list",
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            result,
            ValidationResult::Admitted {
                attendee: AttendeeRef::new("PAPER-77"),
                ticket_type_id: None,
            }
        );
    }

    #[tokio::test]
    async fn ledger_outage_makes_override_transient() {
        let backend = InMemoryBackend::seeded();
        backend.faults.set(Fault::Unavailable);

        let result = authority(&backend)
            .confirm(
                &EventId::new("evt-001"),
                &StaffId::new("staff-1"),
                &TicketCode::new("TKT-001-ABC"),
                "VIP access",
                None,
            )
            .await;

        assert_eq!(result, Ok(ValidationResult::TransientError));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_override_is_transient_and_not_written() {
        let backend = InMemoryBackend::seeded();
        backend.faults.set(Fault::Stall(Duration::from_secs(5)));

        let result = authority(&backend)
            .confirm(
                &EventId::new("evt-001"),
                &StaffId::new("staff-1"),
                &TicketCode::new("TKT-001-ABC"),
                "VIP access",
                None,
            )
            .await;

        assert_eq!(result, Ok(ValidationResult::TransientError));
        backend.faults.heal();
        assert!(backend.ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn override_committed_before_timeout_counts_as_admitted() {
        let backend = InMemoryBackend::seeded();
        let authority = OverrideAuthority::new(
            backend.tickets.clone(),
            Arc::new(LateAckLedger {
                inner: backend.ledger.clone(),
                hang: Duration::from_secs(5),
            }),
            Arc::new(test_clock()),
            Duration::from_millis(200),
        );
        let code = TicketCode::new("TKT-001-ABC");
        let event = EventId::new("evt-001");

        let result = authority
            .confirm(&event, &StaffId::new("staff-1"), &code, "Lost ticket", None)
            .await
            .unwrap();

        assert!(result.is_admitted());
        let history = backend.ledger.records(&code, &event).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].override_reason.as_deref(), Some("Lost ticket"));
    }
}
