//! In-memory implementations of the store ports.
//!
//! Used by tests, the demo binary and the server when no database is
//! configured. Each store accepts a shared [`FaultInjector`] so tests can make
//! the backend unreachable or slow on demand, which is how the
//! `TransientError` path is exercised.
//!
//! Locks here are synchronous and never held across an `.await`.

use crate::ports::{
    AppendOutcome, CheckInLedger, EventRegistry, PortError, PortFuture, TicketStore,
    reported_record,
};
use crate::types::{CheckInRecord, EventId, EventInfo, Ticket, TicketCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

// ============================================================================
// Fault injection
// ============================================================================

/// Failure mode applied to every call on the stores sharing an injector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Fault {
    /// Calls succeed
    #[default]
    Healthy,
    /// Every call fails as unreachable
    Unavailable,
    /// The next `n` calls fail, then the store recovers
    FailNext(u32),
    /// Every call stalls for the given duration before proceeding
    Stall(Duration),
}

/// Shared switch that makes in-memory stores misbehave on purpose
#[derive(Debug, Default)]
pub struct FaultInjector {
    fault: Mutex<Fault>,
}

impl FaultInjector {
    /// A healthy injector
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the current fault
    pub fn set(&self, fault: Fault) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = fault;
    }

    /// Restore normal behavior
    pub fn heal(&self) {
        self.set(Fault::Healthy);
    }

    /// The currently configured fault
    #[must_use]
    pub fn current(&self) -> Fault {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply the configured fault to one call against `store`
    async fn gate(&self, store: &'static str) -> Result<(), PortError> {
        let stall = {
            let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *fault {
                Fault::Healthy => None,
                Fault::Unavailable => {
                    return Err(PortError::unavailable(store, "injected outage"));
                },
                Fault::FailNext(remaining) => {
                    let left = remaining.saturating_sub(1);
                    *fault = if left == 0 {
                        Fault::Healthy
                    } else {
                        Fault::FailNext(left)
                    };
                    return Err(PortError::unavailable(store, "injected failure"));
                },
                Fault::Stall(duration) => Some(*duration),
            }
        };

        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }
        Ok(())
    }
}

fn poisoned(store: &'static str) -> PortError {
    PortError::unavailable(store, "lock poisoned")
}

// ============================================================================
// Ticket store
// ============================================================================

/// Ticket records held in a map
#[derive(Debug)]
pub struct InMemoryTicketStore {
    tickets: RwLock<HashMap<TicketCode, Ticket>>,
    faults: Arc<FaultInjector>,
    lookups: AtomicUsize,
}

impl InMemoryTicketStore {
    /// Create an empty store
    #[must_use]
    pub fn new(faults: Arc<FaultInjector>) -> Self {
        Self {
            tickets: RwLock::new(HashMap::new()),
            faults,
            lookups: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a ticket
    pub fn insert(&self, ticket: Ticket) {
        self.tickets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticket.code.clone(), ticket);
    }

    /// Flip whether a ticket's type is honored (catalog management)
    pub fn set_type_active(&self, code: &TicketCode, active: bool) {
        if let Some(ticket) = self
            .tickets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(code)
        {
            ticket.type_active = active;
        }
    }

    /// Number of lookups served, including failed ones
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Acquire)
    }
}

impl TicketStore for InMemoryTicketStore {
    fn lookup_ticket<'a>(&'a self, code: &'a TicketCode) -> PortFuture<'a, Option<Ticket>> {
        Box::pin(async move {
            self.lookups.fetch_add(1, Ordering::AcqRel);
            self.faults.gate("ticket store").await?;
            let tickets = self.tickets.read().map_err(|_| poisoned("ticket store"))?;
            Ok(tickets.get(code).cloned())
        })
    }
}

// ============================================================================
// Event registry
// ============================================================================

/// Event records held in a map
#[derive(Debug)]
pub struct InMemoryEventRegistry {
    events: RwLock<HashMap<EventId, EventInfo>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryEventRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(faults: Arc<FaultInjector>) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            faults,
        }
    }

    /// Insert or replace an event
    pub fn insert(&self, event: EventInfo) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.id.clone(), event);
    }
}

impl EventRegistry for InMemoryEventRegistry {
    fn get_event<'a>(&'a self, event_id: &'a EventId) -> PortFuture<'a, Option<EventInfo>> {
        Box::pin(async move {
            self.faults.gate("event registry").await?;
            let events = self.events.read().map_err(|_| poisoned("event registry"))?;
            Ok(events.get(event_id).cloned())
        })
    }
}

// ============================================================================
// Ledger
// ============================================================================

type LedgerKey = (TicketCode, EventId);

/// Append-only ledger held in a map of per-key histories
///
/// `append_if_absent` checks and inserts under one mutex acquisition, which
/// makes it atomic for every session sharing this instance.
#[derive(Debug)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<LedgerKey, Vec<CheckInRecord>>>,
    faults: Arc<FaultInjector>,
    reads: AtomicUsize,
}

impl InMemoryLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new(faults: Arc<FaultInjector>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            faults,
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of `find_record` calls served, including failed ones
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// Total records across all keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Whether the ledger holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckInLedger for InMemoryLedger {
    fn find_record<'a>(
        &'a self,
        code: &'a TicketCode,
        event_id: &'a EventId,
    ) -> PortFuture<'a, Option<CheckInRecord>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::AcqRel);
            self.faults.gate("ledger").await?;
            let records = self.records.lock().map_err(|_| poisoned("ledger"))?;
            let key = (code.clone(), event_id.clone());
            Ok(records
                .get(&key)
                .and_then(|history| reported_record(history.as_slice()))
                .cloned())
        })
    }

    fn append_if_absent(&self, record: CheckInRecord) -> PortFuture<'_, AppendOutcome> {
        Box::pin(async move {
            self.faults.gate("ledger").await?;
            let mut records = self.records.lock().map_err(|_| poisoned("ledger"))?;
            let key = (record.ticket_code.clone(), record.event_id.clone());
            let history = records.entry(key).or_default();
            if let Some(existing) = reported_record(history) {
                return Ok(AppendOutcome::Existing(existing.clone()));
            }
            history.push(record);
            Ok(AppendOutcome::Inserted)
        })
    }

    fn append_unconditional(&self, record: CheckInRecord) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.faults.gate("ledger").await?;
            let mut records = self.records.lock().map_err(|_| poisoned("ledger"))?;
            let key = (record.ticket_code.clone(), record.event_id.clone());
            records.entry(key).or_default().push(record);
            Ok(())
        })
    }

    fn records<'a>(
        &'a self,
        code: &'a TicketCode,
        event_id: &'a EventId,
    ) -> PortFuture<'a, Vec<CheckInRecord>> {
        Box::pin(async move {
            self.faults.gate("ledger").await?;
            let records = self.records.lock().map_err(|_| poisoned("ledger"))?;
            let key = (code.clone(), event_id.clone());
            Ok(records.get(&key).cloned().unwrap_or_default())
        })
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// The three in-memory stores sharing one fault injector
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    /// Ticket records
    pub tickets: Arc<InMemoryTicketStore>,
    /// Event registry
    pub events: Arc<InMemoryEventRegistry>,
    /// Check-in ledger
    pub ledger: Arc<InMemoryLedger>,
    /// Fault switch for all three
    pub faults: Arc<FaultInjector>,
}

impl InMemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        let faults = FaultInjector::new();
        Self {
            tickets: Arc::new(InMemoryTicketStore::new(Arc::clone(&faults))),
            events: Arc::new(InMemoryEventRegistry::new(Arc::clone(&faults))),
            ledger: Arc::new(InMemoryLedger::new(Arc::clone(&faults))),
            faults,
        }
    }

    /// A backend pre-loaded with two events and a handful of tickets
    ///
    /// `evt-001` (staff-1, staff-2) and `evt-002` (staff-2, staff-3).
    /// `TKT-001-ABC` and `TKT-001-DEF` are valid for `evt-001`,
    /// `TKT-001-OLD` has a retired type, `TKT-002-XYZ` is for `evt-002`.
    #[must_use]
    pub fn seeded() -> Self {
        let backend = Self::new();
        backend.events.insert(EventInfo::new(
            "evt-001",
            "Spring Gala",
            ["staff-1", "staff-2"],
        ));
        backend.events.insert(EventInfo::new(
            "evt-002",
            "Summer Festival",
            ["staff-2", "staff-3"],
        ));
        backend
            .tickets
            .insert(Ticket::new("TKT-001-ABC", "evt-001", "general", "Ada Lovelace"));
        backend
            .tickets
            .insert(Ticket::new("TKT-001-DEF", "evt-001", "vip", "Grace Hopper"));
        backend.tickets.insert(
            Ticket::new("TKT-001-OLD", "evt-001", "early-bird", "Alan Turing").with_inactive_type(),
        );
        backend
            .tickets
            .insert(Ticket::new("TKT-002-XYZ", "evt-002", "general", "Edsger Dijkstra"));
        backend
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::StaffId;
    use chrono::Utc;

    fn organic(code: &str, staff: &str) -> CheckInRecord {
        CheckInRecord::organic(
            TicketCode::new(code),
            EventId::new("evt-001"),
            Utc::now(),
            StaffId::new(staff),
        )
    }

    #[tokio::test]
    async fn append_if_absent_inserts_once() {
        let ledger = InMemoryLedger::new(FaultInjector::new());

        let first = ledger.append_if_absent(organic("TKT-1", "staff-1")).await;
        let second = ledger.append_if_absent(organic("TKT-1", "staff-2")).await;

        assert_eq!(first, Ok(AppendOutcome::Inserted));
        match second.unwrap() {
            AppendOutcome::Existing(record) => assert_eq!(record.staff_id.as_str(), "staff-1"),
            AppendOutcome::Inserted => unreachable!("second append must see the first"),
        }
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn unconditional_append_always_writes() {
        let ledger = InMemoryLedger::new(FaultInjector::new());
        ledger.append_unconditional(organic("TKT-1", "staff-1")).await.unwrap();
        ledger.append_unconditional(organic("TKT-1", "staff-1")).await.unwrap();

        let history = ledger
            .records(&TicketCode::new("TKT-1"), &EventId::new("evt-001"))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn history_keeps_append_order_regardless_of_timestamps() {
        let ledger = InMemoryLedger::new(FaultInjector::new());
        let code = TicketCode::new("TKT-1");
        let later = organic("TKT-1", "staff-1");
        let mut earlier = organic("TKT-1", "staff-2");
        earlier.timestamp = later.timestamp - chrono::Duration::minutes(5);

        ledger.append_unconditional(later).await.unwrap();
        ledger.append_unconditional(earlier).await.unwrap();

        let history = ledger
            .records(&code, &EventId::new("evt-001"))
            .await
            .unwrap();
        let staff: Vec<_> = history.iter().map(|r| r.staff_id.as_str()).collect();
        assert_eq!(staff, ["staff-1", "staff-2"]);
    }

    #[tokio::test]
    async fn injected_outage_fails_without_writing() {
        let backend = InMemoryBackend::new();
        backend.faults.set(Fault::Unavailable);

        let result = backend
            .ledger
            .append_if_absent(organic("TKT-1", "staff-1"))
            .await;

        assert!(matches!(result, Err(PortError::Unavailable { store: "ledger", .. })));
        backend.faults.heal();
        assert!(backend.ledger.is_empty());
    }

    #[tokio::test]
    async fn fail_next_recovers_after_count() {
        let backend = InMemoryBackend::seeded();
        backend.faults.set(Fault::FailNext(2));
        let code = TicketCode::new("TKT-001-ABC");

        assert!(backend.tickets.lookup_ticket(&code).await.is_err());
        assert!(backend.tickets.lookup_ticket(&code).await.is_err());
        assert!(backend.tickets.lookup_ticket(&code).await.unwrap().is_some());
        assert_eq!(backend.faults.current(), Fault::Healthy);
        assert_eq!(backend.tickets.lookup_count(), 3);
    }

    #[tokio::test]
    async fn type_activation_is_mutable() {
        let backend = InMemoryBackend::seeded();
        let code = TicketCode::new("TKT-001-ABC");
        backend.tickets.set_type_active(&code, false);
        let ticket = backend.tickets.lookup_ticket(&code).await.unwrap().unwrap();
        assert!(!ticket.type_active);
    }
}
