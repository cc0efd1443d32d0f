//! Gatekeeper check-in: ticket validation and gate session engine.
//!
//! Gate staff scan or type ticket codes at venue entrances. This crate
//! classifies each code against authoritative records, admits a ticket **at
//! most once per event** even when several gates scan it at the same moment,
//! supports audited supervisor overrides and keeps per-session counters.
//!
//! # Architecture
//!
//! ```text
//!  camera decode ─┐                                   ┌──────────────┐
//!                 ├─▶ CheckInSession ─▶ IntakeReducer ─▶│  Validation  │─▶ TicketStore
//!  manual entry ──┘        │            (Store runtime) │   Pipeline   │─▶ CheckInLedger
//!                          │                  │         └──────────────┘
//!                          │                  ├──▶ SessionTally
//!                          └─ override ───────┴──▶ OverrideAuthority ─▶ CheckInLedger
//! ```
//!
//! # Precedence
//!
//! `NotFound > WrongEvent > AlreadyAdmitted > InactiveType > Admitted`
//!
//! # Backends
//!
//! - [`memory`]: in-process ports with fault injection, for tests and demos
//! - `postgres` (feature `postgres`): `sqlx` ports with advisory-lock admission

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod intake;
pub mod memory;
pub mod metrics;
pub mod overrides;
pub mod pipeline;
pub mod ports;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod server;
pub mod session;
pub mod tally;
pub mod types;

pub use config::{Config, ConfigError};
pub use intake::{DecoderSignal, DiscardReason, FeedFault, FeedFaultKind, FeedState, IntakePhase};
pub use memory::{Fault, InMemoryBackend};
pub use overrides::{OverrideAuthority, OverrideReason, OverrideRejection, OverrideRequest};
pub use pipeline::ValidationPipeline;
pub use ports::{AppendOutcome, CheckInLedger, EventRegistry, PortError, TicketStore};
pub use session::{CheckInSession, ScanOutcome, SessionConfig, SessionError};
pub use tally::SessionTally;
pub use types::*;
