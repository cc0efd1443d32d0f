//! Ports to the backing stores the check-in engine consumes.
//!
//! The engine never owns ticket, event or ledger data. It reaches them
//! through these traits, injected via the session environment, so the same
//! pipeline runs against the in-memory backend (tests, demo) and Postgres.
//!
//! Methods return boxed futures instead of `async fn` so the traits stay
//! dyn-compatible (`Arc<dyn CheckInLedger>`).

use crate::types::{CheckInRecord, EventId, EventInfo, Ticket, TicketCode};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by every port method
pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PortError>> + Send + 'a>>;

/// Infrastructure failure talking to a backing store
///
/// Never used for business outcomes: a missing ticket is `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// The store could not be reached
    #[error("{store} unavailable: {reason}")]
    Unavailable {
        /// Which store failed
        store: &'static str,
        /// Driver or transport message
        reason: String,
    },

    /// The call did not complete within the configured bound
    #[error("{store} call timed out after {millis}ms")]
    Timeout {
        /// Which store timed out
        store: &'static str,
        /// The bound that was exceeded
        millis: u64,
    },
}

impl PortError {
    /// Shorthand for [`PortError::Unavailable`]
    #[must_use]
    pub fn unavailable(store: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            store,
            reason: reason.into(),
        }
    }
}

/// Result of a conditional ledger append
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was written; no record existed for the key
    Inserted,
    /// A record already existed for the key and nothing was written
    Existing(CheckInRecord),
}

/// Authoritative ticket records
pub trait TicketStore: Send + Sync {
    /// Look up a ticket by its code.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the store is unreachable.
    fn lookup_ticket<'a>(&'a self, code: &'a TicketCode) -> PortFuture<'a, Option<Ticket>>;
}

/// Event metadata and staff rosters
pub trait EventRegistry: Send + Sync {
    /// Look up an event by id.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the registry is unreachable.
    fn get_event<'a>(&'a self, event_id: &'a EventId) -> PortFuture<'a, Option<EventInfo>>;
}

/// Append-only admission ledger keyed by (ticket code, event)
///
/// # Atomicity
///
/// `append_if_absent` must perform its existence check and its write as one
/// atomic operation *at the store*. Two gates racing on the same key must see
/// exactly one `Inserted`.
pub trait CheckInLedger: Send + Sync {
    /// The record to report as "already admitted" for a key.
    ///
    /// The earliest organic record if one exists, otherwise the earliest
    /// override record, otherwise `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the ledger is unreachable.
    fn find_record<'a>(
        &'a self,
        code: &'a TicketCode,
        event_id: &'a EventId,
    ) -> PortFuture<'a, Option<CheckInRecord>>;

    /// Append `record` only if no record exists for its key.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the ledger is unreachable. Nothing is written
    /// in that case.
    fn append_if_absent(&self, record: CheckInRecord) -> PortFuture<'_, AppendOutcome>;

    /// Append `record` regardless of existing records (overrides only).
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the ledger is unreachable.
    fn append_unconditional(&self, record: CheckInRecord) -> PortFuture<'_, ()>;

    /// Every record for a key in append order (audit trail).
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the ledger is unreachable.
    fn records<'a>(
        &'a self,
        code: &'a TicketCode,
        event_id: &'a EventId,
    ) -> PortFuture<'a, Vec<CheckInRecord>>;
}

/// Pick the record `find_record` reports from a key's history
///
/// Shared by ledger implementations that load the whole key.
#[must_use]
pub fn reported_record(records: &[CheckInRecord]) -> Option<&CheckInRecord> {
    records
        .iter()
        .filter(|r| !r.is_override())
        .min_by_key(|r| r.timestamp)
        .or_else(|| records.iter().min_by_key(|r| r.timestamp))
}
