//! Background decode worker, one per session.
//!
//! The worker runs on the blocking thread pool and owns the session's
//! [`UtteranceDecoder`]. Audio arrives through a bounded FIFO queue, so a
//! producer that outpaces decoding waits instead of dropping audio. Results
//! and failures leave through an unbounded event channel, and the current
//! [`WorkerState`] is published on a watch channel.
//!
//! ```text
//! Idle -> Listening -> Decoding -> Finalizing -> Done
//!            ^                          |
//!            +---- continuous mode -----+
//! any non-Done state -> Aborted
//! ```

use std::fmt;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Span};

use crate::asr::decoder::{StepOutcome, UtteranceDecoder};
use crate::asr::types::DecodeResult;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Listening,
    Decoding,
    Finalizing,
    Done,
    Aborted,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Done | WorkerState::Aborted)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Listening => "listening",
            WorkerState::Decoding => "decoding",
            WorkerState::Finalizing => "finalizing",
            WorkerState::Done => "done",
            WorkerState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Items on the worker's input queue.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerInput {
    /// Samples in [-1.0, 1.0].
    Audio(Vec<f32>),
    /// End of the current utterance; the stream may continue.
    Endpoint,
    /// No more audio on this connection.
    EndOfInput,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Partial(DecodeResult),
    /// `last` is set when no further utterance follows on this session.
    Final { result: DecodeResult, last: bool },
    Aborted(AppError),
}

struct DecodeWorker {
    decoder: UtteranceDecoder,
    input: mpsc::Receiver<WorkerInput>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: watch::Sender<WorkerState>,
    cancel: CancellationToken,
    continuous: bool,
}

impl DecodeWorker {
    fn set_state(&self, state: WorkerState) {
        debug!(%state, "Worker state");
        self.state.send_replace(state);
    }

    fn emit(&self, event: WorkerEvent) {
        // The session may already be gone; there is nobody left to tell.
        let _ = self.events.send(event);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn run(mut self) {
        self.set_state(WorkerState::Listening);
        match self.decode_loop() {
            Ok(()) => info!("Decode worker finished"),
            Err(AppError::Cancelled) => {
                debug!("Decode worker cancelled");
                self.set_state(WorkerState::Aborted);
            }
            Err(e) => {
                error!(error = %e, "Decode worker aborted");
                self.set_state(WorkerState::Aborted);
                self.emit(WorkerEvent::Aborted(e));
            }
        }
    }

    fn decode_loop(&mut self) -> Result<()> {
        loop {
            self.check_cancelled()?;
            let input = match self.input.blocking_recv() {
                Some(input) => input,
                None => {
                    self.check_cancelled()?;
                    WorkerInput::EndOfInput
                }
            };

            let finished = match input {
                WorkerInput::Audio(samples) => {
                    if *self.state.borrow() == WorkerState::Listening {
                        self.set_state(WorkerState::Decoding);
                    }
                    self.decoder.accept_waveform(&samples)?;
                    self.run_steps()?
                }
                WorkerInput::Endpoint => self.finish_utterance(false)?,
                WorkerInput::EndOfInput => self.finish_utterance(true)?,
            };
            if finished {
                return Ok(());
            }
        }
    }

    /// Decode every complete chunk. Returns true once the worker is done.
    fn run_steps(&mut self) -> Result<bool> {
        loop {
            self.check_cancelled()?;
            match self.decoder.decode_step()? {
                StepOutcome::NeedMoreData => return Ok(false),
                StepOutcome::Decoded { changed: true } => {
                    self.emit(WorkerEvent::Partial(self.decoder.partial_result()));
                }
                StepOutcome::Decoded { changed: false } => {}
                StepOutcome::EndpointDetected => return self.finish_utterance(false),
            }
        }
    }

    /// Finalize the current utterance. Returns true once the worker is done.
    fn finish_utterance(&mut self, end_of_input: bool) -> Result<bool> {
        self.set_state(WorkerState::Finalizing);
        let last = end_of_input || !self.continuous;
        if last {
            self.input.close();
            while let Ok(input) = self.input.try_recv() {
                if let WorkerInput::Audio(samples) = input {
                    self.decoder.accept_waveform(&samples)?;
                }
            }
        }
        self.check_cancelled()?;

        let result = self.decoder.finalize()?;
        if last {
            self.set_state(WorkerState::Done);
            self.emit(WorkerEvent::Final { result, last: true });
            Ok(true)
        } else {
            self.decoder.reset();
            self.set_state(WorkerState::Listening);
            self.emit(WorkerEvent::Final {
                result,
                last: false,
            });
            Ok(false)
        }
    }
}

/// The session side of a running decode worker.
///
/// Dropping the handle cancels the worker; [`WorkerHandle::shutdown`] also
/// waits for it to stop.
pub struct WorkerHandle {
    input: Option<mpsc::Sender<WorkerInput>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    state: watch::Receiver<WorkerState>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start a worker for `decoder` with an input queue of `queue_capacity` items.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(decoder: UtteranceDecoder, queue_capacity: usize) -> Self {
        let continuous = decoder.config().continuous_decoding;
        let (input_tx, input_rx) = mpsc::channel(queue_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let cancel = CancellationToken::new();

        let worker = DecodeWorker {
            decoder,
            input: input_rx,
            events: event_tx,
            state: state_tx,
            cancel: cancel.clone(),
            continuous,
        };
        let span = Span::current();
        let join = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            worker.run();
        });

        Self {
            input: Some(input_tx),
            events: event_rx,
            state: state_rx,
            cancel,
            join: Some(join),
        }
    }

    /// Queue an input, waiting while the queue is full.
    ///
    /// # Errors
    /// `ProtocolViolation` if the worker no longer accepts input.
    pub async fn send(&self, input: WorkerInput) -> Result<()> {
        let closed = || AppError::ProtocolViolation("decoder input is closed".to_string());
        let sender = self.input.as_ref().ok_or_else(closed)?;
        sender.send(input).await.map_err(|_| closed())
    }

    /// Next event from the worker; `None` once the worker has exited.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the worker, close its input and wait until it has stopped.
    pub async fn shutdown(&mut self) -> WorkerState {
        self.cancel.cancel();
        self.input = None;
        self.join().await
    }

    /// Wait for the worker to stop on its own.
    pub async fn join(&mut self) -> WorkerState {
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "Decode worker panicked");
            }
        }
        self.state()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
