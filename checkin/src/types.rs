//! Domain types for gate check-in.
//!
//! Identifiers are opaque strings issued by the ticketing platform
//! (`TKT-001-ABC`, `evt-001`, `staff-1`); this crate never generates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a ticketed event
    EventId
);
string_id!(
    /// Identifier of a gate staff member
    StaffId
);
string_id!(
    /// Identifier of a ticket type (General, VIP, ...)
    TicketTypeId
);
string_id!(
    /// Reference to the ticket holder shown to staff on admission
    AttendeeRef
);

/// A scanned or typed ticket code
///
/// Surrounding whitespace is stripped on construction; typed codes often
/// carry stray spaces and decoders sometimes append a newline.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TicketCode(String);

impl TicketCode {
    /// Normalize and wrap a raw code
    #[must_use]
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_string())
    }

    /// Borrow the normalized code
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether nothing but whitespace was supplied
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TicketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TicketCode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TicketCode {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<TicketCode> for String {
    fn from(code: TicketCode) -> Self {
        code.0
    }
}

/// Correlates a request sent into a session with its terminal result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random `RequestId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Records
// ============================================================================

/// Authoritative ticket record, owned by the ticketing platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Unique ticket code
    pub code: TicketCode,
    /// Event this ticket admits to
    pub event_id: EventId,
    /// Ticket type
    pub ticket_type_id: TicketTypeId,
    /// Whether the ticket type is currently honored
    pub type_active: bool,
    /// Holder shown to staff on admission
    pub attendee: AttendeeRef,
}

impl Ticket {
    /// Create an active ticket
    #[must_use]
    pub fn new(
        code: impl AsRef<str>,
        event_id: impl Into<String>,
        ticket_type_id: impl Into<String>,
        attendee: impl Into<String>,
    ) -> Self {
        Self {
            code: TicketCode::new(code),
            event_id: EventId::new(event_id),
            ticket_type_id: TicketTypeId::new(ticket_type_id),
            type_active: true,
            attendee: AttendeeRef::new(attendee),
        }
    }

    /// Mark the ticket type as no longer honored
    #[must_use]
    pub fn with_inactive_type(mut self) -> Self {
        self.type_active = false;
        self
    }
}

/// One admission written to the check-in ledger
///
/// Records are append-only. `override_reason` is `None` for organic
/// admissions and carries the audited reason for supervised overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInRecord {
    /// Ticket that was admitted
    pub ticket_code: TicketCode,
    /// Event the admission belongs to
    pub event_id: EventId,
    /// When the admission was written
    pub timestamp: DateTime<Utc>,
    /// Staff member who admitted the holder
    pub staff_id: StaffId,
    /// Reason for a supervised override
    pub override_reason: Option<String>,
}

impl CheckInRecord {
    /// An organic admission produced by the validation pipeline
    #[must_use]
    pub const fn organic(
        ticket_code: TicketCode,
        event_id: EventId,
        timestamp: DateTime<Utc>,
        staff_id: StaffId,
    ) -> Self {
        Self {
            ticket_code,
            event_id,
            timestamp,
            staff_id,
            override_reason: None,
        }
    }

    /// A supervised override admission
    #[must_use]
    pub const fn overridden(
        ticket_code: TicketCode,
        event_id: EventId,
        timestamp: DateTime<Utc>,
        staff_id: StaffId,
        reason: String,
    ) -> Self {
        Self {
            ticket_code,
            event_id,
            timestamp,
            staff_id,
            override_reason: Some(reason),
        }
    }

    /// Whether this record was written by an override
    #[must_use]
    pub const fn is_override(&self) -> bool {
        self.override_reason.is_some()
    }
}

/// Event metadata from the event registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    /// Event identifier
    pub id: EventId,
    /// Display name
    pub name: String,
    /// Staff assigned to work this event's gates
    pub staff: BTreeSet<StaffId>,
}

impl EventInfo {
    /// Create an event with a staff roster
    #[must_use]
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, staff: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: EventId::new(id),
            name: name.into(),
            staff: staff.into_iter().map(StaffId::new).collect(),
        }
    }

    /// Whether `staff_id` may run a gate session for this event
    #[must_use]
    pub fn has_staff(&self, staff_id: &StaffId) -> bool {
        self.staff.contains(staff_id)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Classification of one scan
///
/// Every variant except `TransientError` is a normal business outcome that
/// the gate UI renders distinctly. `TransientError` means a backing store
/// was unreachable and the scan may be retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationResult {
    /// Holder admitted
    Admitted {
        /// Ticket holder
        attendee: AttendeeRef,
        /// Ticket type (absent for overrides of unknown codes)
        ticket_type_id: Option<TicketTypeId>,
    },
    /// Ticket already used for this event
    AlreadyAdmitted {
        /// Timestamp of the reported ledger record
        first_timestamp: DateTime<Utc>,
        /// Staff member on the reported ledger record
        first_staff_id: StaffId,
    },
    /// Ticket belongs to another event
    WrongEvent {
        /// The event the ticket is actually for
        actual_event_id: EventId,
    },
    /// Ticket type is no longer honored
    InactiveType,
    /// No ticket with this code
    NotFound,
    /// A backing store was unreachable; safe to retry
    TransientError,
}

impl ValidationResult {
    /// Build an `AlreadyAdmitted` from the reported ledger record
    #[must_use]
    pub fn already_admitted(record: &CheckInRecord) -> Self {
        Self::AlreadyAdmitted {
            first_timestamp: record.timestamp,
            first_staff_id: record.staff_id.clone(),
        }
    }

    /// Whether the holder was let in
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    /// Stable lowercase label, used for logs and metric labels
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "admitted",
            Self::AlreadyAdmitted { .. } => "already_admitted",
            Self::WrongEvent { .. } => "wrong_event",
            Self::InactiveType => "inactive_type",
            Self::NotFound => "not_found",
            Self::TransientError => "transient_error",
        }
    }
}

/// Where a scan came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    /// Continuous camera decode stream
    Decode,
    /// Code typed into the manual entry form
    Manual,
}

impl fmt::Display for ScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => f.write_str("decode"),
            Self::Manual => f.write_str("manual"),
        }
    }
}
