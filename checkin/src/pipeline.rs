//! Validation pipeline: classify a scanned code and admit at most once.
//!
//! # Precedence
//!
//! When several conditions hold, the first matching rule decides what staff
//! see. The order is part of the gate's contract:
//!
//! ```text
//! NotFound > WrongEvent > AlreadyAdmitted > InactiveType > Admitted
//! ```
//!
//! # At-most-once admission
//!
//! The `AlreadyAdmitted` pre-check is only a fast path. The admission itself
//! is the ledger's atomic `append_if_absent`; a scan that loses a race
//! against another gate gets the winner's record back and reports
//! `AlreadyAdmitted`, never `Admitted`.
//!
//! Any store failure or timeout yields `TransientError`. Nothing is half
//! written in that case, so the gate can simply scan again.

use crate::metrics::CheckInMetrics;
use crate::ports::{AppendOutcome, CheckInLedger, PortError, PortFuture, TicketStore};
use crate::types::{CheckInRecord, EventId, StaffId, TicketCode, ValidationResult};
use gatekeeper_core::environment::Clock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sequential store calls one validation can make: lookup, read, append
pub const MAX_STORE_CALLS: u32 = 3;

/// Upper bound on one validation when each store call is bounded by
/// `store_timeout`
#[must_use]
pub fn worst_case(store_timeout: Duration) -> Duration {
    store_timeout.saturating_mul(MAX_STORE_CALLS)
}

/// Classifies (code, event) pairs against the ticket store and ledger
#[derive(Clone)]
pub struct ValidationPipeline {
    tickets: Arc<dyn TicketStore>,
    ledger: Arc<dyn CheckInLedger>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl ValidationPipeline {
    /// Creates a new `ValidationPipeline`
    ///
    /// `store_timeout` bounds every individual store call.
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

    /// The ticket store this pipeline reads
    #[must_use]
    pub fn tickets(&self) -> &Arc<dyn TicketStore> {
        &self.tickets
    }

    /// The ledger this pipeline writes
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn CheckInLedger> {
        &self.ledger
    }

    /// The injected clock
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Bound applied to each store call
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Longest a single `validate` can run before it returns a result
    #[must_use]
    pub fn worst_case(&self) -> Duration {
        worst_case(self.store_timeout)
    }

    /// Classify `code` for `event_id`, admitting it on behalf of `staff_id`
    /// if every check passes.
    #[tracing::instrument(
        skip_all,
        fields(code = %code, event = %event_id, staff = %staff_id)
    )]
    pub async fn validate(
        &self,
        code: &TicketCode,
        event_id: &EventId,
        staff_id: &StaffId,
    ) -> ValidationResult {
        let start = Instant::now();

        let result = match self.classify(code, event_id, staff_id).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(%error, "Backing store unreachable, scan may be retried");
                ValidationResult::TransientError
            },
        };

        tracing::debug!(outcome = result.label(), "Scan classified");
        CheckInMetrics::record_validation(&result, start.elapsed());
        result
    }

    async fn classify(
        &self,
        code: &TicketCode,
        event_id: &EventId,
        staff_id: &StaffId,
    ) -> Result<ValidationResult, PortError> {
        let Some(ticket) = self
            .bounded("ticket store", self.tickets.lookup_ticket(code))
            .await?
        else {
            return Ok(ValidationResult::NotFound);
        };

        if ticket.event_id != *event_id {
            return Ok(ValidationResult::WrongEvent {
                actual_event_id: ticket.event_id,
            });
        }

        if let Some(record) = self
            .bounded("ledger", self.ledger.find_record(code, event_id))
            .await?
        {
            return Ok(ValidationResult::already_admitted(&record));
        }

        if !ticket.type_active {
            return Ok(ValidationResult::InactiveType);
        }

        let record = CheckInRecord::organic(
            code.clone(),
            event_id.clone(),
            self.clock.now(),
            staff_id.clone(),
        );

        match self
            .bounded("ledger", self.ledger.append_if_absent(record))
            .await?
        {
            AppendOutcome::Inserted => {
                tracing::info!(attendee = %ticket.attendee, "Ticket admitted");
                Ok(ValidationResult::Admitted {
                    attendee: ticket.attendee,
                    ticket_type_id: Some(ticket.ticket_type_id),
                })
            },
            AppendOutcome::Existing(existing) => {
                tracing::info!(
                    winner = %existing.staff_id,
                    "Lost admission race to a concurrent scan"
                );
                Ok(ValidationResult::already_admitted(&existing))
            },
        }
    }

    async fn bounded<T>(
        &self,
        store: &'static str,
        call: PortFuture<'_, T>,
    ) -> Result<T, PortError> {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| PortError::Timeout {
                store,
                millis: u64::try_from(self.store_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }
}

impl std::fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationPipeline")
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}
