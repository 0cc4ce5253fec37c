//! The `amira_asr_runtime` core library.
//!
//! A streaming and batch speech recognition runtime: CTC prefix beam search
//! over a pluggable acoustic model, attention rescoring with an optional
//! right-to-left decoder, per-session decode workers and a WebSocket server.

pub mod api;
pub mod asr;
pub mod config;
pub mod error;
pub mod model;
pub mod reliability;
pub mod server;
pub mod session;

pub use api::{load_resources, Recognizer};
pub use config::Config;
pub use error::{AppError, Result};
