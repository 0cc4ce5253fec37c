//! Tracing subscriber setup with runtime-adjustable verbosity.
//!
//! The `EnvFilter` sits behind a reload layer so the host can raise or lower
//! the log level of a running process.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, Registry,
};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    /// Default filter directive when `RUST_LOG` is unset.
    pub log_level: String,
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "amira-asr-runtime".to_string(),
            log_level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

static FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Install the global subscriber.
///
/// # Errors
/// `Configuration` if the level is not a valid filter or a subscriber is
/// already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            AppError::Configuration(format!("invalid log level '{}': {}", config.log_level, e))
        })?,
    };
    let (filter, handle) = reload::Layer::new(filter);
    let registry = Registry::default().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().with_target(true).with_thread_names(true).compact())
            .try_init(),
    };
    installed.map_err(|e| AppError::Configuration(format!("tracing already initialised: {}", e)))?;
    let _ = FILTER_HANDLE.set(handle);

    info!(service = %config.service_name, level = %config.log_level, "Tracing initialised");
    Ok(())
}

/// Filter directive for a numeric verbosity: 0 is info, 1 debug, 2 and up trace.
pub fn verbosity_directive(level: u8) -> &'static str {
    match level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Change the global log level at runtime.
///
/// # Errors
/// `Configuration` if tracing was not set up through [`init_tracing`].
pub fn set_log_verbosity(level: u8) -> Result<()> {
    let handle = FILTER_HANDLE
        .get()
        .ok_or_else(|| AppError::Configuration("tracing is not initialised".to_string()))?;
    let directive = verbosity_directive(level);
    handle
        .reload(EnvFilter::new(directive))
        .map_err(|e| AppError::Internal(format!("failed to reload log filter: {}", e)))?;
    info!(directive, "Log verbosity changed");
    Ok(())
}
