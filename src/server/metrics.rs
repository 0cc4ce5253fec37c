//! Service metrics tracking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::AppError;

/// Session and request counters exposed on `/metrics`.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    /// Sessions accepted since start
    total_sessions: Arc<AtomicU64>,

    /// Currently open streaming sessions
    active_sessions: Arc<AtomicUsize>,

    max_concurrent_sessions: Arc<AtomicUsize>,

    total_batches: Arc<AtomicU64>,
    active_batches: Arc<AtomicUsize>,

    /// Requests turned away at the capacity limit
    rejected_requests: Arc<AtomicU64>,

    partial_results: Arc<AtomicU64>,
    final_results: Arc<AtomicU64>,

    errors: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,

    start_time: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            total_sessions: Arc::new(AtomicU64::new(0)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            max_concurrent_sessions: Arc::new(AtomicUsize::new(0)),
            total_batches: Arc::new(AtomicU64::new(0)),
            active_batches: Arc::new(AtomicUsize::new(0)),
            rejected_requests: Arc::new(AtomicU64::new(0)),
            partial_results: Arc::new(AtomicU64::new(0)),
            final_results: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(Mutex::new(None)),
            start_time: Instant::now(),
        }
    }

    pub fn session_started(&self) {
        let active = self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_sessions.fetch_add(1, Ordering::SeqCst);
        self.max_concurrent_sessions
            .fetch_max(active, Ordering::SeqCst);
    }

    pub fn session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn batch_started(&self) {
        self.active_batches.fetch_add(1, Ordering::SeqCst);
        self.total_batches.fetch_add(1, Ordering::SeqCst);
    }

    pub fn batch_ended(&self) {
        self.active_batches.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_rejection(&self) {
        self.rejected_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_partial(&self) {
        self.partial_results.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_final(&self) {
        self.final_results.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_error(&self, error: &AppError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(format!("{}: {}", error.kind(), error));
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Shared live-session counter, for shutdown draining.
    pub fn active_sessions_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_sessions)
    }

    /// Get all metrics as a serde_json::Value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "total_sessions": self.total_sessions.load(Ordering::SeqCst),
            "active_sessions": self.active_sessions.load(Ordering::SeqCst),
            "max_concurrent_sessions": self.max_concurrent_sessions.load(Ordering::SeqCst),
            "total_batches": self.total_batches.load(Ordering::SeqCst),
            "active_batches": self.active_batches.load(Ordering::SeqCst),
            "rejected_requests": self.rejected_requests.load(Ordering::SeqCst),
            "partial_results": self.partial_results.load(Ordering::SeqCst),
            "final_results": self.final_results.load(Ordering::SeqCst),
            "errors": self.errors.load(Ordering::SeqCst),
            "last_error": self.last_error.lock().clone(),
        })
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
