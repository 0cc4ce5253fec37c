//! Streaming sessions: the wire envelope, the per-connection state machine
//! and the background decode worker it drives.

pub mod machine;
pub mod protocol;
pub mod worker;

pub use crate::asr::options::SessionConfig;
pub use machine::{Session, SessionEvent, SessionState};
pub use protocol::{ClientMessage, ServerMessage, StartRequest};
pub use worker::{WorkerEvent, WorkerHandle, WorkerInput, WorkerState};
