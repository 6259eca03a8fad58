//! HTTP surface
//!
//! Thin axum layer over the orchestrator and the live reconstruction.
//! Authentication happens upstream; the authenticated user id arrives in the
//! `x-user-id` header.

use crate::access::AccessPolicy;
use crate::error::{kind_of, Result, ThreadlineError};
use crate::generation::GenerationOrchestrator;
use crate::live::reconstruct;
use crate::storage::{ConversationId, Message, MessageId, SqliteStorage};

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    orchestrator: GenerationOrchestrator,
}

impl AppState {
    /// Wraps the orchestrator serving all requests
    pub fn new(orchestrator: GenerationOrchestrator) -> Self {
        Self { orchestrator }
    }

    fn storage(&self) -> &SqliteStorage {
        self.orchestrator.storage()
    }

    fn policy(&self) -> &Arc<dyn AccessPolicy> {
        self.orchestrator.policy()
    }
}

/// Error returned by handlers, rendered as `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match kind_of(&self.0) {
            Some(ThreadlineError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(ThreadlineError::Unauthorized) => StatusCode::UNAUTHORIZED,
            Some(ThreadlineError::PermissionDenied(_)) => StatusCode::FORBIDDEN,
            Some(ThreadlineError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ThreadlineError::GenerationInProgress(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
            "internal error".to_string()
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "Request rejected");
            self.0.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Requester(value.to_string()))
            .ok_or_else(|| ThreadlineError::Unauthorized.into())
    }
}

/// Body of `POST /api/chat`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatRequest {
    /// Existing conversation; a new one is created when absent
    pub conversation_id: Option<ConversationId>,
    /// User message
    pub message: Option<String>,
}

/// Response of `POST /api/chat`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    /// Conversation the message went to
    pub conversation_id: ConversationId,
    /// Assistant message being generated
    pub message_id: MessageId,
}

/// Body of `POST /api/stop`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopRequest {
    /// Assistant message to stop
    pub message_id: Option<MessageId>,
}

/// Response of `GET /api/conversations/{id}/messages`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    /// Conversation listed
    pub conversation_id: ConversationId,
    /// Display list with the in-flight text filled in
    pub messages: Vec<Message>,
    /// Whether the last message is still being generated
    pub is_streaming: bool,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn chat(
    State(state): State<AppState>,
    Requester(user): Requester,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let message = request
        .message
        .ok_or_else(|| ThreadlineError::Validation("message is required".to_string()))?;

    let started = state
        .orchestrator
        .generate(&user, request.conversation_id.as_deref(), &message)
        .await?;
    let (conversation_id, message_id) = started.detach();

    Ok(Json(ChatResponse {
        conversation_id,
        message_id,
    }))
}

async fn stop(
    State(state): State<AppState>,
    Requester(user): Requester,
    Json(request): Json<StopRequest>,
) -> ApiResult<Json<crate::generation::StopOutcome>> {
    let message_id = request
        .message_id
        .ok_or_else(|| ThreadlineError::Validation("messageId is required".to_string()))?;
    let orchestrator = state.orchestrator.clone();
    let outcome = state
        .storage()
        .run_blocking(move |_| orchestrator.stop(message_id, &user))
        .await?;
    Ok(Json(outcome))
}

async fn conversation_messages(
    State(state): State<AppState>,
    Requester(user): Requester,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<MessagesResponse>> {
    let policy = Arc::clone(state.policy());
    let response = state
        .storage()
        .run_blocking(move |storage| {
            let conversation = storage.get_conversation(&conversation_id)?.ok_or_else(|| {
                ThreadlineError::NotFound(format!("conversation {}", conversation_id))
            })?;
            if !policy.can_read(&conversation, &user) {
                return Err(ThreadlineError::PermissionDenied(format!(
                    "user {} may not read conversation {}",
                    user, conversation_id
                ))
                .into());
            }

            let (rows, chunks) = storage.read_conversation_tail(&conversation_id)?;
            let messages = reconstruct(&rows, &chunks);
            let is_streaming = messages.last().is_some_and(Message::is_in_flight);
            Ok(MessagesResponse {
                conversation_id,
                messages,
                is_streaming,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Builds the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/stop", post(stop))
        .route(
            "/api/conversations/:id/messages",
            get(conversation_messages),
        )
        .route("/health", get(health))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}
