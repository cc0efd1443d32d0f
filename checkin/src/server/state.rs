//! Application state for the check-in HTTP server.

use super::error::AppError;
use crate::overrides::OverrideAuthority;
use crate::pipeline::ValidationPipeline;
use crate::ports::EventRegistry;
use crate::session::{CheckInSession, SessionConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Application state shared across all HTTP handlers.
///
/// Cloned (cheaply via Arc) for each request.
#[derive(Clone)]
pub struct AppState {
    /// Event lookups for session start
    pub registry: Arc<dyn EventRegistry>,
    /// Shared validation pipeline
    pub pipeline: Arc<ValidationPipeline>,
    /// Shared override authority
    pub overrides: Arc<OverrideAuthority>,
    /// Timing applied to new sessions
    pub session_config: SessionConfig,
    /// Open sessions by id
    pub sessions: Arc<RwLock<HashMap<Uuid, CheckInSession>>>,
    /// Prometheus handle for `/metrics`, when a recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(
        registry: Arc<dyn EventRegistry>,
        pipeline: Arc<ValidationPipeline>,
        session_config: SessionConfig,
    ) -> Self {
        let overrides = Arc::new(OverrideAuthority::from_pipeline(&pipeline));
        Self {
            registry,
            pipeline,
            overrides,
            session_config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            metrics: None,
        }
    }

    /// Expose rendered metrics on `/metrics`
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Look up an open session
    ///
    /// # Errors
    ///
    /// Returns a 404 [`AppError`] if no session has this id.
    pub async fn session(&self, id: Uuid) -> Result<CheckInSession, AppError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("Session", id))
    }

    /// Number of open sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions that were ended elsewhere or have been idle for
    /// `max_idle`, ending the idle ones. Returns how many were removed.
    pub async fn sweep_sessions(&self, max_idle: Duration) -> usize {
        let stale: Vec<CheckInSession> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, s)| s.is_ended() || s.idle_for() >= max_idle)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &stale {
            if session.is_ended() {
                continue;
            }
            match session.end().await {
                Ok(tally) => tracing::info!(
                    session = %session.id(),
                    valid = tally.valid_count(),
                    invalid = tally.invalid_count(),
                    "Closed idle session"
                ),
                Err(error) => tracing::debug!(session = %session.id(), %error, "Idle session already closed"),
            }
        }
        stale.len()
    }
}
