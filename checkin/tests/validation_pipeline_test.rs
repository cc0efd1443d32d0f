//! Validation pipeline behavior against in-memory ports.

#![allow(clippy::unwrap_used, clippy::panic)]

use gatekeeper_checkin::{
    CheckInLedger, CheckInRecord, EventId, InMemoryBackend, OverrideAuthority, StaffId, Ticket,
    TicketCode, ValidationPipeline, ValidationResult,
};
use gatekeeper_core::environment::Clock;
use gatekeeper_testing::{ManualClock, epoch};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Gate {
    backend: InMemoryBackend,
    clock: Arc<ManualClock>,
    pipeline: ValidationPipeline,
}

fn gate() -> Gate {
    let backend = InMemoryBackend::seeded();
    let clock = Arc::new(ManualClock::new(epoch()));
    let pipeline = ValidationPipeline::new(
        backend.tickets.clone(),
        backend.ledger.clone(),
        clock.clone(),
        Duration::from_millis(250),
    );
    Gate {
        backend,
        clock,
        pipeline,
    }
}

fn ids(code: &str, event: &str, staff: &str) -> (TicketCode, EventId, StaffId) {
    (TicketCode::new(code), EventId::new(event), StaffId::new(staff))
}

#[tokio::test]
async fn second_scan_reports_first_admission() {
    let gate = gate();
    let (code, event, staff) = ids("TKT-001-ABC", "evt-001", "staff-1");

    let first = gate.pipeline.validate(&code, &event, &staff).await;
    let admitted_at = gate.clock.now();
    gate.clock.advance(chrono::Duration::minutes(5));
    let second = gate
        .pipeline
        .validate(&code, &event, &StaffId::new("staff-2"))
        .await;

    assert!(first.is_admitted());
    assert_eq!(
        second,
        ValidationResult::AlreadyAdmitted {
            first_timestamp: admitted_at,
            first_staff_id: staff,
        }
    );
    assert_eq!(gate.backend.ledger.len(), 1);
}

#[tokio::test]
async fn unknown_code_is_not_found_for_any_event() {
    let gate = gate();
    for event in ["evt-001", "evt-002", "evt-404"] {
        let (code, event, staff) = ids("NOPE", event, "staff-1");
        assert_eq!(
            gate.pipeline.validate(&code, &event, &staff).await,
            ValidationResult::NotFound
        );
    }
    assert!(gate.backend.ledger.is_empty());
}

#[tokio::test]
async fn wrong_event_wins_even_after_admission_elsewhere() {
    let gate = gate();
    let (code, home, staff) = ids("TKT-001-ABC", "evt-001", "staff-1");
    assert!(gate.pipeline.validate(&code, &home, &staff).await.is_admitted());

    let result = gate
        .pipeline
        .validate(&code, &EventId::new("evt-002"), &StaffId::new("staff-2"))
        .await;

    assert_eq!(
        result,
        ValidationResult::WrongEvent {
            actual_event_id: home,
        }
    );
}

#[tokio::test]
async fn typed_code_with_whitespace_matches() {
    let gate = gate();
    let (code, event, staff) = ids("  TKT-001-DEF \t", "evt-001", "staff-2");
    assert!(gate.pipeline.validate(&code, &event, &staff).await.is_admitted());
}

#[tokio::test]
async fn already_admitted_reports_organic_record_over_earlier_override() {
    let gate = gate();
    let (code, event, _) = ids("TKT-001-ABC", "evt-001", "staff-1");
    let authority = OverrideAuthority::from_pipeline(&gate.pipeline);

    authority
        .confirm(&event, &StaffId::new("staff-2"), &code, "Lost ticket", None)
        .await
        .unwrap();
    let override_at = gate.clock.now();
    gate.clock.advance(chrono::Duration::seconds(30));

    // Only the override exists, so it is reported.
    match gate.pipeline.validate(&code, &event, &StaffId::new("staff-1")).await {
        ValidationResult::AlreadyAdmitted {
            first_timestamp,
            first_staff_id,
        } => {
            assert_eq!(first_timestamp, override_at);
            assert_eq!(first_staff_id, StaffId::new("staff-2"));
        },
        other => panic!("expected AlreadyAdmitted, got {other:?}"),
    }

    // An organic record written later takes precedence once present.
    let organic_at = gate.clock.now();
    gate.backend
        .ledger
        .append_unconditional(CheckInRecord::organic(
            code.clone(),
            event.clone(),
            organic_at,
            StaffId::new("staff-1"),
        ))
        .await
        .unwrap();
    let found = gate.backend.ledger.find_record(&code, &event).await.unwrap().unwrap();
    assert_eq!(found.timestamp, organic_at);
    assert!(!found.is_override());
}

#[tokio::test]
async fn wrong_event_outranks_inactive_type() {
    let gate = gate();
    gate.backend
        .tickets
        .insert(Ticket::new("TKT-002-OLD", "evt-002", "promo", "Barbara Liskov").with_inactive_type());

    let (code, event, staff) = ids("TKT-002-OLD", "evt-001", "staff-1");
    assert!(matches!(
        gate.pipeline.validate(&code, &event, &staff).await,
        ValidationResult::WrongEvent { .. }
    ));

    let (code, event, staff) = ids("TKT-002-OLD", "evt-002", "staff-2");
    assert_eq!(
        gate.pipeline.validate(&code, &event, &staff).await,
        ValidationResult::InactiveType
    );
}

/// Concrete walkthrough from the gate playbook.
#[tokio::test]
async fn gala_and_festival_scenario() {
    let gate = gate();
    let code = TicketCode::new("TKT-001-ABC");
    let gala = EventId::new("evt-001");
    let t0 = gate.clock.now();

    assert!(gate
        .pipeline
        .validate(&code, &gala, &StaffId::new("staff-1"))
        .await
        .is_admitted());
    gate.clock.advance(chrono::Duration::seconds(10));

    assert_eq!(
        gate.pipeline
            .validate(&code, &gala, &StaffId::new("staff-1"))
            .await,
        ValidationResult::AlreadyAdmitted {
            first_timestamp: t0,
            first_staff_id: StaffId::new("staff-1"),
        }
    );
    assert_eq!(
        gate.pipeline
            .validate(&code, &EventId::new("evt-002"), &StaffId::new("staff-2"))
            .await,
        ValidationResult::WrongEvent {
            actual_event_id: gala,
        }
    );
}

fn seeded_code() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("TKT-001-ABC"),
        Just("TKT-001-DEF"),
        Just("TKT-001-OLD"),
        Just("TKT-002-XYZ"),
        Just("NOPE"),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// However scans are interleaved, each (code, event) key is admitted at most once.
    #[test]
    fn admissions_never_repeat(
        scans in prop::collection::vec((seeded_code(), prop_oneof![Just("evt-001"), Just("evt-002")]), 1..24)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let gate = gate();
            let mut admitted = std::collections::HashSet::new();
            for (code, event) in &scans {
                let (code, event, staff) = ids(code, event, "staff-2");
                let result = gate.pipeline.validate(&code, &event, &staff).await;
                if result.is_admitted() {
                    prop_assert!(admitted.insert((code.clone(), event.clone())));
                }
                if matches!(result, ValidationResult::NotFound) {
                    prop_assert_eq!(code.as_str(), "NOPE");
                }
            }
            prop_assert_eq!(gate.backend.ledger.len(), admitted.len());
            Ok(())
        })?;
    }
}
