//! HTTP server for gate clients.
//!
//! - Application state and the session registry
//! - Health and metrics endpoints
//! - Error responses
//! - Router configuration

pub mod error;
pub mod health;
pub mod routes;
pub mod state;

pub use error::AppError;
pub use health::health_check;
pub use routes::build_router;
pub use state::AppState;
