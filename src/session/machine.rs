//! Per-connection session state machine.
//!
//! A [`Session`] turns client events into worker input and worker events into
//! server messages. It never decodes anything itself: the decode worker runs
//! on its own thread and the session only waits on its queues.
//!
//! Out-of-order client traffic is handled as follows:
//! - audio or `end` before `start`, or a second `start`, is a protocol
//!   violation and the session stays open;
//! - audio after `end` is a protocol violation;
//! - audio after an automatic endpoint closed a single-shot session is
//!   dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::asr::features::bytes_to_f32_samples;
use crate::asr::options::SessionConfig;
use crate::asr::resource::DecodeResources;
use crate::error::{AppError, Result};
use crate::session::protocol::{ServerMessage, StartRequest};
use crate::session::worker::{WorkerEvent, WorkerHandle, WorkerInput, WorkerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStart,
    Active,
    /// The last final result (or an error) has been produced.
    Finished,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingStart => "awaiting_start",
            SessionState::Active => "active",
            SessionState::Finished => "finished",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Client-side events fed into [`Session::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StartTag(StartRequest),
    /// 16-bit little-endian PCM.
    AudioChunk(Vec<u8>),
    EndTag,
    EndpointDetected,
    ConnectionClosed,
}

pub struct Session {
    id: Uuid,
    span: Span,
    state: SessionState,
    resources: Arc<DecodeResources>,
    config: Option<Arc<SessionConfig>>,
    worker: Option<WorkerHandle>,
    worker_exited: bool,
    end_requested: bool,
    outbox: VecDeque<ServerMessage>,
    finals: usize,
}

impl Session {
    pub fn new(resources: Arc<DecodeResources>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            span: info_span!("session", id = %id),
            state: SessionState::AwaitingStart,
            resources,
            config: None,
            worker: None,
            worker_exited: false,
            end_requested: false,
            outbox: VecDeque::new(),
            finals: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_deref()
    }

    pub fn worker_state(&self) -> Option<WorkerState> {
        self.worker.as_ref().map(|w| w.state())
    }

    /// Final results delivered so far.
    pub fn finals_emitted(&self) -> usize {
        self.finals
    }

    /// Apply a client event.
    ///
    /// # Errors
    /// `ProtocolViolation` or `InvalidInput` for traffic the session rejects;
    /// the session stays usable. `Cancelled` once the session is closed.
    pub async fn handle(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::StartTag(request) => self.start(request),
            SessionEvent::AudioChunk(pcm) => self.audio(pcm).await,
            SessionEvent::EndTag => self.end().await,
            SessionEvent::EndpointDetected => self.endpoint().await,
            SessionEvent::ConnectionClosed => {
                self.close().await;
                Ok(())
            }
        }
    }

    fn start(&mut self, request: StartRequest) -> Result<()> {
        if self.state != SessionState::AwaitingStart {
            return Err(self.violation("session already started"));
        }
        let config = Arc::new(request.into_config(self.resources.default_session())?);
        let decoder = self.resources.new_decoder(Arc::clone(&config))?;
        let worker = {
            let _entered = self.span.enter();
            info!(
                nbest = config.nbest,
                continuous = config.continuous_decoding,
                context_words = config.context_words.len(),
                "Session started"
            );
            WorkerHandle::spawn(decoder, self.resources.input_queue_capacity())
        };
        self.config = Some(config);
        self.worker = Some(worker);
        self.state = SessionState::Active;
        self.outbox.push_back(ServerMessage::ServerReady {
            session_id: self.id.to_string(),
        });
        Ok(())
    }

    async fn audio(&mut self, pcm: Vec<u8>) -> Result<()> {
        match self.state {
            SessionState::AwaitingStart => return Err(self.violation("audio before start")),
            SessionState::Closed => return Err(AppError::Cancelled),
            SessionState::Active | SessionState::Finished => {}
        }
        if self.end_requested {
            return Err(self.violation("audio after end of input"));
        }
        let samples = bytes_to_f32_samples(&pcm)
            .map_err(|e| AppError::ProtocolViolation(e.to_string()))?;

        let Some(worker) = self.worker.as_ref() else {
            return Err(self.violation("no decoder for audio"));
        };
        if self.state == SessionState::Finished || worker.send(WorkerInput::Audio(samples)).await.is_err()
        {
            debug!(parent: &self.span, bytes = pcm.len(), "Dropping audio after utterance end");
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        if self.state == SessionState::AwaitingStart {
            return Err(self.violation("end before start"));
        }
        if self.end_requested {
            return Err(self.violation("duplicate end of input"));
        }
        self.end_requested = true;
        if self.state == SessionState::Active {
            self.forward(WorkerInput::EndOfInput).await;
        }
        Ok(())
    }

    async fn endpoint(&mut self) -> Result<()> {
        match self.state {
            SessionState::AwaitingStart => Err(self.violation("endpoint before start")),
            SessionState::Active if !self.end_requested => {
                self.forward(WorkerInput::Endpoint).await;
                Ok(())
            }
            _ => {
                debug!(parent: &self.span, "Ignoring endpoint after end of input");
                Ok(())
            }
        }
    }

    async fn forward(&self, input: WorkerInput) {
        if let Some(worker) = self.worker.as_ref() {
            if worker.send(input).await.is_err() {
                debug!(parent: &self.span, "Decoder input already closed");
            }
        }
    }

    fn violation(&self, detail: &str) -> AppError {
        warn!(parent: &self.span, state = %self.state, detail, "Protocol violation");
        AppError::ProtocolViolation(detail.to_string())
    }

    /// Next message for the client.
    ///
    /// Pends forever when nothing more can be produced, so it can sit in a
    /// `select!` next to the socket.
    pub async fn next_output(&mut self) -> ServerMessage {
        loop {
            if let Some(message) = self.outbox.pop_front() {
                return message;
            }
            if self.worker_exited {
                return std::future::pending().await;
            }
            let Some(worker) = self.worker.as_mut() else {
                return std::future::pending().await;
            };
            match worker.next_event().await {
                Some(event) => self.on_worker_event(event),
                None => self.on_worker_exit(),
            }
        }
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Partial(result) => {
                if self.state == SessionState::Active {
                    self.outbox.push_back(ServerMessage::partial(result));
                }
            }
            WorkerEvent::Final { result, last } => {
                self.finals += 1;
                info!(
                    parent: &self.span,
                    best = result.best_sentence(),
                    last,
                    "Final result"
                );
                self.outbox.push_back(ServerMessage::final_result(result));
                if last {
                    self.outbox.push_back(ServerMessage::SpeechEnd);
                    self.finish();
                }
            }
            WorkerEvent::Aborted(error) => {
                self.outbox.push_back(ServerMessage::from_error(&error));
                self.finish();
            }
        }
    }

    fn on_worker_exit(&mut self) {
        self.worker_exited = true;
        let state = self.worker_state().unwrap_or(WorkerState::Aborted);
        if !state.is_terminal() && self.state != SessionState::Closed {
            let error = AppError::DecodeFailure(format!("decoder stopped while {}", state));
            self.outbox.push_back(ServerMessage::from_error(&error));
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.state == SessionState::Active {
            self.state = SessionState::Finished;
        }
    }

    /// Cancel the worker and wait for it to stop.
    pub async fn close(&mut self) -> Option<WorkerState> {
        self.state = SessionState::Closed;
        self.outbox.clear();
        let worker = self.worker.as_mut()?;
        let state = worker.shutdown().await;
        debug!(parent: &self.span, worker = %state, "Session closed");
        Some(state)
    }
}
