//! Matchmaking HTTP API
//!
//! `POST /matchmaking` registers a player and holds the request open until a
//! session is formed or the registration times out.

use crate::error::{ErrorStatus, MatchmakingError};
use crate::orchestrator::RegistrationOrchestrator;
use crate::types::{Player, Session};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Body of a matchmaking request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakingRequest {
    pub id: String,
    pub rating: i64,
}

impl From<MatchmakingRequest> for Player {
    fn from(request: MatchmakingRequest) -> Self {
        Player::new(request.id, request.rating)
    }
}

/// Error body returned for every failed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub status: String,
}

/// Error type converted into an HTTP response
#[derive(Debug)]
pub struct ApiError(MatchmakingError);

impl From<MatchmakingError> for ApiError {
    fn from(err: MatchmakingError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(MatchmakingError::InvalidRequest {
            reason: rejection.body_text(),
        })
    }
}

fn status_code(status: ErrorStatus) -> StatusCode {
    match status {
        ErrorStatus::BadRequest => StatusCode::BAD_REQUEST,
        ErrorStatus::Conflict => StatusCode::CONFLICT,
        ErrorStatus::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorStatus::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let body = ErrorBody {
            error: self.0.to_string(),
            status: status.as_str().to_string(),
        };

        (status_code(status), Json(body)).into_response()
    }
}

/// Build the API router around `orchestrator`
pub fn router(orchestrator: Arc<RegistrationOrchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/matchmaking", post(matchmaking_handler))
        .layer(cors)
        .with_state(orchestrator)
}

async fn matchmaking_handler(
    State(orchestrator): State<Arc<RegistrationOrchestrator>>,
    payload: std::result::Result<Json<MatchmakingRequest>, JsonRejection>,
) -> std::result::Result<Json<Session>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        debug!("Rejected matchmaking request: {}", rejection.body_text());
        ApiError::from(rejection)
    })?;

    info!(
        "Matchmaking request - player: '{}', rating: {}",
        request.id, request.rating
    );

    match orchestrator.register_and_wait(request.into()).await {
        Ok(session) => Ok(Json(session)),
        Err(e) => {
            match e.status() {
                ErrorStatus::Internal => error!("Matchmaking request failed: {}", e),
                _ => debug!("Matchmaking request ended without a session: {}", e),
            }
            Err(e.into())
        }
    }
}

/// Bind the API listener
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid API server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;
    Ok(listener)
}

/// Serve the API on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    orchestrator: Arc<RegistrationOrchestrator>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Matchmaking API listening on http://{}", addr);

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move {
            if shutdown.recv().await.is_err() {
                warn!("API shutdown channel closed");
            }
            info!("API server shutdown signal received");
        })
        .await?;

    info!("API server stopped");
    Ok(())
}
