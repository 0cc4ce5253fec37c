//! Web server and API implementation.
//!
//! A thin dispatcher: each WebSocket connection gets its own session and
//! decode worker, and the batch endpoint runs the offline recognizer on the
//! blocking pool.

mod connection;
mod handlers;
mod metrics;
mod state;

pub use connection::serve_connection;
pub use handlers::{create_router, health_check, metrics_handler, BatchRequest, BatchResponse};
pub use metrics::ServiceMetrics;
pub use state::{AppState, SessionEntry};
