//! WebSocket connection loop for one streaming session.
//!
//! The loop multiplexes four sources: client frames, session output, an idle
//! timer and the process shutdown signal. Audio is forwarded with
//! backpressure: while the session's input queue is full the loop stops
//! reading the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, OwnedSemaphorePermit};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::error::{AppError, Result};
use crate::server::state::{AppState, SessionEntry};
use crate::session::{ClientMessage, ServerMessage, Session, SessionEvent, SessionState};

enum Step {
    Client(Option<std::result::Result<Message, axum::Error>>),
    Output(ServerMessage),
    IdleTimeout,
    Shutdown,
}

impl Step {
    /// Frames in either direction count as traffic.
    fn resets_idle_timer(&self) -> bool {
        matches!(self, Step::Client(Some(Ok(_))) | Step::Output(_))
    }
}

/// Map a WebSocket frame to a session event; `None` for frames that carry nothing.
pub(crate) fn client_event(message: Message) -> Option<Result<SessionEvent>> {
    match message {
        Message::Text(text) => Some(ClientMessage::parse(&text).map(|message| match message {
            ClientMessage::Start(request) => SessionEvent::StartTag(request),
            ClientMessage::End => SessionEvent::EndTag,
            ClientMessage::Endpoint => SessionEvent::EndpointDetected,
        })),
        Message::Binary(data) => Some(Ok(SessionEvent::AudioChunk(data))),
        Message::Close(_) => Some(Ok(SessionEvent::ConnectionClosed)),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

/// Run one streaming session until the client leaves, the session ends or
/// the server shuts down.
pub async fn serve_connection(ws: WebSocket, state: Arc<AppState>, permit: OwnedSemaphorePermit) {
    let session = Session::new(Arc::clone(&state.resources));
    let span = session.span().clone();
    async move {
        let id = session.id();
        let shutdown_rx = state.shutdown.subscribe();
        state.active_sessions.insert(
            id,
            SessionEntry {
                started_at: std::time::Instant::now(),
            },
        );
        state.metrics.session_started();
        info!("Session connected");

        run(ws, session, &state, shutdown_rx).await;

        let duration = state
            .active_sessions
            .remove(&id)
            .map(|(_, entry)| entry.started_at.elapsed())
            .unwrap_or_default();
        state.metrics.session_ended();
        info!(duration_ms = duration.as_millis() as u64, "Session disconnected");
        drop(permit);
    }
    .instrument(span)
    .await
}

async fn send(ws: &mut WebSocket, message: &ServerMessage) -> Result<()> {
    let json = message.to_json()?;
    ws.send(Message::Text(json))
        .await
        .map_err(|e| AppError::Internal(format!("websocket send failed: {}", e)))
}

async fn run(
    mut ws: WebSocket,
    mut session: Session,
    state: &AppState,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let idle_timeout = state.idle_timeout;
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        let step = if state.shutdown.is_triggered() {
            Step::Shutdown
        } else {
            tokio::select! {
                message = ws.next() => Step::Client(message),
                output = session.next_output() => Step::Output(output),
                _ = &mut idle => Step::IdleTimeout,
                _ = shutdown_rx.recv() => Step::Shutdown,
            }
        };
        if step.resets_idle_timer() {
            idle.as_mut().reset(Instant::now() + idle_timeout);
        }

        match step {
            Step::Client(Some(Ok(message))) => {
                let Some(event) = client_event(message) else {
                    continue;
                };
                let closing = matches!(event, Ok(SessionEvent::ConnectionClosed));
                let handled = match event {
                    Ok(event) => session.handle(event).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = handled {
                    state.metrics.record_error(&e);
                    if send(&mut ws, &ServerMessage::from_error(&e)).await.is_err() {
                        break;
                    }
                }
                if closing {
                    debug!("Client closed the connection");
                    break;
                }
            }
            Step::Client(Some(Err(e))) => {
                warn!(error = %e, "WebSocket receive failed");
                break;
            }
            Step::Client(None) => break,
            Step::Output(message) => {
                match &message {
                    ServerMessage::PartialResult { .. } => state.metrics.record_partial(),
                    ServerMessage::FinalResult { .. } => state.metrics.record_final(),
                    ServerMessage::Error { kind, message: detail } => {
                        warn!(kind = %kind, detail = %detail, "Session error");
                    }
                    _ => {}
                }
                if send(&mut ws, &message).await.is_err() {
                    break;
                }
                if message == ServerMessage::SpeechEnd {
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
            }
            Step::IdleTimeout => {
                warn!(
                    timeout_secs = idle_timeout.as_secs(),
                    "Closing idle session"
                );
                let error = AppError::ProtocolViolation(format!(
                    "no traffic for {} seconds",
                    idle_timeout.as_secs()
                ));
                let _ = send(&mut ws, &ServerMessage::from_error(&error)).await;
                break;
            }
            Step::Shutdown => {
                info!("Closing session for server shutdown");
                let _ = ws.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if session.state() != SessionState::Closed {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_map_to_session_events() {
        let event = client_event(Message::Text(r#"{"signal":"end"}"#.to_string()));
        assert!(matches!(event, Some(Ok(SessionEvent::EndTag))));

        let event = client_event(Message::Text(r#"{"signal":"endpoint"}"#.to_string()));
        assert!(matches!(event, Some(Ok(SessionEvent::EndpointDetected))));

        let event = client_event(Message::Binary(vec![0, 1]));
        assert!(matches!(event, Some(Ok(SessionEvent::AudioChunk(ref pcm))) if pcm == &vec![0, 1]));

        assert!(matches!(
            client_event(Message::Close(None)),
            Some(Ok(SessionEvent::ConnectionClosed))
        ));
        assert!(client_event(Message::Ping(vec![1])).is_none());
    }

    #[test]
    fn test_idle_timer_resets_on_traffic_both_ways() {
        let client = Step::Client(Some(Ok(Message::Binary(vec![0, 0]))));
        assert!(client.resets_idle_timer());
        assert!(Step::Output(ServerMessage::SpeechEnd).resets_idle_timer());

        assert!(!Step::Client(None).resets_idle_timer());
        assert!(!Step::IdleTimeout.resets_idle_timer());
        assert!(!Step::Shutdown.resets_idle_timer());
    }

    #[test]
    fn test_bad_text_frame_is_protocol_violation() {
        let event = client_event(Message::Text("{".to_string()));
        assert!(matches!(event, Some(Err(AppError::ProtocolViolation(_)))));
    }
}
