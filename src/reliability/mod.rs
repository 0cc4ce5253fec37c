//! Process-level reliability: log setup and graceful shutdown.

pub mod graceful_shutdown;
pub mod tracing;

pub use graceful_shutdown::{drain_sessions, GracefulShutdown};
pub use self::tracing::{init_tracing, set_log_verbosity, LogFormat, TracingConfig};
