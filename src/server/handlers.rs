//! HTTP and WebSocket request handlers.

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::asr::types::DecodeResult;
use crate::error::{AppError, Result};
use crate::server::connection::serve_connection;
use crate::server::AppState;
use crate::session::StartRequest;

/// Request body for offline recognition of several utterances.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Raw 16-bit little-endian PCM, one entry per utterance
    pub utterances: Vec<Vec<u8>>,

    /// Session options; absent fields take the server defaults
    #[serde(default)]
    pub options: StartRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<DecodeResult>,
}

/// Handle WebSocket upgrade for a streaming session.
pub async fn handle_session(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let permit = match Arc::clone(&state.session_semaphore).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            state.metrics.record_rejection();
            error!("Rejected session: too many concurrent sessions");
            return AppError::CapacityExceeded("Too many concurrent sessions".to_string())
                .into_response();
        }
    };
    ws.on_upgrade(move |socket| serve_connection(socket, state, permit))
}

/// Decode a batch of complete utterances in one pass.
pub async fn handle_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    let _permit = state.batch_semaphore.try_acquire().map_err(|_| {
        state.metrics.record_rejection();
        AppError::CapacityExceeded("Too many concurrent batch requests".to_string())
    })?;
    if request.utterances.is_empty() {
        return Err(AppError::InvalidInput("no utterances in request".to_string()));
    }
    let config = request
        .options
        .into_config(state.resources.default_session())?;

    state.metrics.batch_started();
    let recognizer = state.batch.clone();
    let utterances = request.utterances;
    let count = utterances.len();
    let outcome =
        tokio::task::spawn_blocking(move || recognizer.decode_pcm(&utterances, &config)).await;
    state.metrics.batch_ended();

    let results = outcome
        .map_err(|e| AppError::Internal(format!("batch decode task failed: {}", e)))?
        .map_err(|e| {
            state.metrics.record_error(&e);
            e
        })?;
    info!(utterances = count, "Batch decoded");
    Ok(Json(BatchResponse { results }))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.resources.model_info(),
    }))
}

/// Metrics endpoint.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.to_json())
}

/// Create the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_session))
        .route("/v1/recognize/batch", post(handle_batch))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{options, pcm_for_tokens, resources, MockModel};
    use crate::reliability::GracefulShutdown;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_state(max_batches: usize) -> Arc<AppState> {
        Arc::new(AppState::new(
            resources(MockModel::new(), options(0)),
            4,
            max_batches,
            Duration::from_secs(30),
            GracefulShutdown::new(),
        ))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn batch_request(body: &BatchRequest) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/recognize/batch")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_model() {
        let response = create_router(app_state(1))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["model"]["end_marker_id"], 7);
    }

    #[tokio::test]
    async fn test_batch_endpoint_decodes_each_utterance() {
        let state = app_state(1);
        let request = BatchRequest {
            utterances: vec![pcm_for_tokens(&[1, 0, 2]), pcm_for_tokens(&[5])],
            options: StartRequest {
                nbest: Some(2),
                ..Default::default()
            },
        };
        let response = create_router(Arc::clone(&state))
            .oneshot(batch_request(&request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["nbest"][0]["sentence"], "ab");
        assert_eq!(results[1]["nbest"][0]["sentence"], "e");
        assert_eq!(state.metrics.to_json()["total_batches"], 1);
    }

    #[tokio::test]
    async fn test_batch_endpoint_rejects_bad_input() {
        let empty = BatchRequest {
            utterances: Vec::new(),
            options: StartRequest::default(),
        };
        let response = create_router(app_state(1))
            .oneshot(batch_request(&empty))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let odd = BatchRequest {
            utterances: vec![vec![1, 2, 3]],
            options: StartRequest::default(),
        };
        let response = create_router(app_state(1))
            .oneshot(batch_request(&odd))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_batch_capacity_limit() {
        let state = app_state(1);
        let _held = state.batch_semaphore.try_acquire().unwrap();
        let request = BatchRequest {
            utterances: vec![pcm_for_tokens(&[1])],
            options: StartRequest::default(),
        };
        let response = create_router(Arc::clone(&state))
            .oneshot(batch_request(&request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.metrics.to_json()["rejected_requests"], 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = create_router(app_state(1))
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["active_sessions"], 0);
    }
}
