//! API endpoints for gate clients.
//!
//! - Sessions: start, scan, override, feed control, tally, end
//! - Audit: ledger history of a ticket at an event

pub mod audit;
pub mod sessions;
