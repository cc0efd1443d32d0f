//! Prometheus metrics for gate check-in.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so library code and tests record freely.
//!
//! # Example
//!
//! ```rust,no_run
//! use gatekeeper_checkin::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! let (addr, _task) = server.serve().await?;
//! # Ok(())
//! # }
//! ```

use crate::intake::DiscardReason;
use crate::types::ValidationResult;
use axum::{Router, routing::get};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// This server does not own the installed recorder
    #[error("Metrics recorder not installed by this server")]
    NotInstalled,
    /// Failed to bind the scrape listener
    #[error("Failed to bind metrics listener on {addr}: {reason}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// OS error
        reason: String,
    },
}

/// Prometheus recorder plus the scrape listener on its own address.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed (several servers in one test binary) is
    /// tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// The address the scrape listener binds.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Scrape router serving `GET /metrics`.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn router(&self) -> Option<Router> {
        let handle = self.handle.clone()?;
        Some(Router::new().route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ))
    }

    /// Bind the configured address and serve the scrape router in the
    /// background. Returns the bound address and the serving task.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NotInstalled`] if `start` did not install the
    /// recorder, or [`MetricsError::Bind`] if the address is unavailable.
    pub async fn serve(&self) -> Result<(SocketAddr, JoinHandle<()>), MetricsError> {
        let router = self.router().ok_or(MetricsError::NotInstalled)?;
        let bind_error = |e: std::io::Error| MetricsError::Bind {
            addr: self.addr,
            reason: e.to_string(),
        };
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        let task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router).await {
                tracing::error!(%error, "Metrics listener stopped");
            }
        });
        tracing::info!(%addr, "Serving Prometheus metrics");
        Ok((addr, task))
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "checkin_validations_total",
        "Validation pipeline outcomes, labelled by outcome"
    );
    describe_histogram!(
        "checkin_validation_duration_seconds",
        "Time taken to classify one scan, store calls included"
    );
    describe_counter!(
        "checkin_overrides_total",
        "Override admissions written to the ledger"
    );
    describe_counter!(
        "checkin_overrides_rejected_total",
        "Override confirmations rejected before touching the ledger"
    );
    describe_counter!(
        "checkin_scans_discarded_total",
        "Scans dropped by the intake controller, labelled by reason"
    );
    describe_counter!(
        "checkin_feed_faults_total",
        "Decoder faults that disabled a camera feed"
    );
    describe_counter!(
        "checkin_sessions_started_total",
        "Gate sessions started"
    );
}

/// Check-in metrics recorder.
pub struct CheckInMetrics;

impl CheckInMetrics {
    /// Record one pipeline classification.
    pub fn record_validation(result: &ValidationResult, duration: Duration) {
        counter!("checkin_validations_total", "outcome" => result.label()).increment(1);
        histogram!("checkin_validation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an override admission.
    pub fn record_override() {
        counter!("checkin_overrides_total").increment(1);
    }

    /// Record a rejected override confirmation.
    pub fn record_override_rejected() {
        counter!("checkin_overrides_rejected_total").increment(1);
    }

    /// Record a discarded scan.
    pub fn record_discard(reason: DiscardReason) {
        counter!("checkin_scans_discarded_total", "reason" => reason.label()).increment(1);
    }

    /// Record a feed fault.
    pub fn record_feed_fault() {
        counter!("checkin_feed_faults_total").increment(1);
    }

    /// Record a session start.
    pub fn record_session_started() {
        counter!("checkin_sessions_started_total").increment(1);
    }
}
