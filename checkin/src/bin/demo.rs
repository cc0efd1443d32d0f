//! Gate check-in walkthrough against in-memory ports.
//!
//! Runs two gate sessions over the seeded demo data:
//!
//! 1. staff-1 at evt-001 admits TKT-001-ABC, then scans it again
//! 2. staff-2 at evt-002 scans the same ticket
//! 3. staff-1 overrides the repeat admission for a VIP
//! 4. a camera decode is followed by a decode inside the cooldown window
//!
//! ```bash
//! cargo run --bin demo
//! ```

use gatekeeper_checkin::{
    CheckInLedger, CheckInSession, EventId, InMemoryBackend, OverrideAuthority, ScanOutcome,
    ScanSource, SessionConfig, StaffId, TicketCode, ValidationPipeline,
};
use gatekeeper_core::environment::SystemClock;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gatekeeper_checkin=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = InMemoryBackend::seeded();
    let pipeline = Arc::new(ValidationPipeline::new(
        backend.tickets.clone(),
        backend.ledger.clone(),
        Arc::new(SystemClock),
        Duration::from_secs(3),
    ));
    let overrides = Arc::new(OverrideAuthority::from_pipeline(&pipeline));
    let config = SessionConfig {
        cooldown: Duration::from_millis(500),
        ..SessionConfig::default()
    };

    let start = |event: &str, staff: &str| {
        CheckInSession::start(
            backend.events.as_ref(),
            pipeline.clone(),
            overrides.clone(),
            config,
            EventId::new(event),
            StaffId::new(staff),
        )
    };

    let gala = start("evt-001", "staff-1").await?;
    let festival = start("evt-002", "staff-2").await?;

    report("staff-1 @ evt-001", &gala.submit_scan("TKT-001-ABC", ScanSource::Manual).await?);
    report("staff-1 @ evt-001 (repeat)", &gala.submit_scan("TKT-001-ABC", ScanSource::Manual).await?);
    report("staff-2 @ evt-002", &festival.submit_scan("TKT-001-ABC", ScanSource::Manual).await?);
    report("staff-1 @ evt-001 (inactive type)", &gala.submit_scan("TKT-001-OLD", ScanSource::Manual).await?);

    let request = gala.open_override(Some(TicketCode::new("TKT-001-ABC"))).await?;
    let admitted = gala
        .confirm_override(TicketCode::new("TKT-001-ABC"), "VIP access", None)
        .await?;
    tracing::info!(request = %request.id, ?admitted, "Override confirmed");

    let history = backend
        .ledger
        .records(&TicketCode::new("TKT-001-ABC"), &EventId::new("evt-001"))
        .await?;
    for record in &history {
        tracing::info!(
            staff = %record.staff_id,
            at = %record.timestamp,
            reason = record.override_reason.as_deref().unwrap_or("-"),
            "Ledger record"
        );
    }

    report("camera decode", &gala.submit_scan("TKT-001-DEF", ScanSource::Decode).await?);
    report("camera decode (cooldown)", &gala.submit_scan("TKT-001-DEF", ScanSource::Decode).await?);
    report("manual entry (cooldown)", &gala.submit_scan("TKT-001-DEF", ScanSource::Manual).await?);

    for (label, session) in [("evt-001", gala), ("evt-002", festival)] {
        let tally = session.end().await?;
        tracing::info!(
            event = label,
            valid = tally.valid_count(),
            invalid = tally.invalid_count(),
            "Session closed"
        );
    }

    Ok(())
}

fn report(label: &str, outcome: &ScanOutcome) {
    match outcome {
        ScanOutcome::Completed { result } => {
            tracing::info!(scan = label, outcome = result.label(), ?result, "Scan completed");
        },
        ScanOutcome::Discarded { reason } => {
            tracing::info!(scan = label, reason = reason.label(), "Scan discarded");
        },
    }
}
