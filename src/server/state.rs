//! Application state for dependency injection.
//!
//! This module provides the application state that is shared
//! between all request handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::asr::batch::BatchRecognizer;
use crate::asr::resource::DecodeResources;
use crate::reliability::GracefulShutdown;
use crate::server::metrics::ServiceMetrics;

/// Bookkeeping for one open streaming session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub started_at: Instant,
}

/// Shared application state containing dependencies.
#[derive(Clone)]
pub struct AppState {
    /// Model template, vocabulary and options every session is built from
    pub resources: Arc<DecodeResources>,

    pub batch: BatchRecognizer,

    pub metrics: Arc<ServiceMetrics>,

    /// Semaphore to limit concurrent streaming sessions
    pub session_semaphore: Arc<Semaphore>,

    /// Semaphore to limit concurrent batch requests
    pub batch_semaphore: Arc<Semaphore>,

    pub active_sessions: Arc<DashMap<Uuid, SessionEntry>>,

    pub shutdown: GracefulShutdown,

    /// Connections without traffic for this long are closed.
    pub idle_timeout: Duration,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Arguments
    /// * `resources` - Shared decoding resources
    /// * `max_concurrent_sessions` - Maximum number of open streaming sessions
    /// * `max_concurrent_batches` - Maximum number of concurrent batch requests
    /// * `idle_timeout` - Inactivity limit per connection
    /// * `shutdown` - Process-wide shutdown signal
    pub fn new(
        resources: Arc<DecodeResources>,
        max_concurrent_sessions: usize,
        max_concurrent_batches: usize,
        idle_timeout: Duration,
        shutdown: GracefulShutdown,
    ) -> Self {
        Self {
            batch: BatchRecognizer::new(Arc::clone(&resources)),
            resources,
            metrics: Arc::new(ServiceMetrics::new()),
            session_semaphore: Arc::new(Semaphore::new(max_concurrent_sessions)),
            batch_semaphore: Arc::new(Semaphore::new(max_concurrent_batches)),
            active_sessions: Arc::new(DashMap::new()),
            shutdown,
            idle_timeout,
        }
    }
}
