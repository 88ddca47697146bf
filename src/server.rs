use crate::commands::{self, SendMessageRequest};
use crate::error::ChatError;
use crate::models::{AppSettings, Theme, AI_MODELS};
use crate::request::ChatRequest;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat_completion))
        .route("/api/models", get(list_models))
        .route("/api/chats", get(list_chats).delete(clear_chats))
        .route("/api/chats/{id}", get(get_chat).delete(delete_chat))
        .route("/api/chats/{id}/messages", post(send_message))
        .route("/api/chats/{id}/stop", post(stop_generation))
        .route("/api/chats/{id}/session", get(session_snapshot))
        .route("/api/chats/{id}/session/dismiss", post(dismiss_error))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/theme", get(get_theme).put(set_theme))
        .with_state(state)
}

// Errors come back as `{"error": ...}` rather than axum's plain-text rejections.
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ChatError> {
    serde_json::from_slice(body)
        .map_err(|e| ChatError::Validation(format!("Invalid request body: {}", e)))
}

fn parse_chat_id(raw: &str) -> Result<Uuid, ChatError> {
    Uuid::parse_str(raw).map_err(|_| ChatError::Validation(format!("Invalid chat ID format: {}", raw)))
}

fn text_stream_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn chat_completion(State(state): State<AppState>, body: Bytes) -> Result<Response, ChatError> {
    let request = ChatRequest::parse(&body)?;
    let deltas = commands::stream_completion(&state, &request).await?;

    let body = Body::from_stream(deltas.map(|delta| {
        delta
            .map(Bytes::from)
            .inspect_err(|e| log::error!("Chat stream aborted: {:#}", e))
    }));
    Ok(text_stream_response(body))
}

async fn list_models() -> impl IntoResponse {
    Json(AI_MODELS)
}

async fn list_chats(State(state): State<AppState>) -> impl IntoResponse {
    Json(commands::list_chats(&state).await)
}

async fn clear_chats(State(state): State<AppState>) -> impl IntoResponse {
    commands::clear_chats(&state).await;
    Json(serde_json::json!({ "cleared": true }))
}

async fn get_chat(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ChatError> {
    let chat = commands::get_chat(&state, parse_chat_id(&id)?).await?;
    Ok(Json(chat).into_response())
}

async fn delete_chat(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ChatError> {
    let chat_id = parse_chat_id(&id)?;
    commands::delete_chat(&state, chat_id).await;
    Ok(Json(serde_json::json!({ "deleted": chat_id })).into_response())
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ChatError> {
    let chat_id = parse_chat_id(&id)?;
    let request: SendMessageRequest = parse_json(&body)?;
    let mut rx = commands::send_message(&state, chat_id, request).await?;

    let deltas = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|delta| Ok::<_, std::convert::Infallible>(Bytes::from(delta)));
    Ok(text_stream_response(Body::from_stream(deltas)))
}

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

async fn stop_generation(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ChatError> {
    let stopped = commands::stop_generation(&state, parse_chat_id(&id)?).await;
    Ok(Json(StopResponse { stopped }).into_response())
}

async fn session_snapshot(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ChatError> {
    let snapshot = commands::session_snapshot(&state, parse_chat_id(&id)?).await;
    Ok(Json(snapshot).into_response())
}

async fn dismiss_error(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ChatError> {
    let snapshot = commands::dismiss_error(&state, parse_chat_id(&id)?).await;
    Ok(Json(snapshot).into_response())
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(commands::get_settings(&state).await)
}

async fn update_settings(State(state): State<AppState>, body: Bytes) -> Result<Response, ChatError> {
    let settings: AppSettings = parse_json(&body)?;
    Ok(Json(commands::update_settings(&state, settings).await).into_response())
}

#[derive(Serialize, Deserialize)]
struct ThemeBody {
    theme: Theme,
}

async fn get_theme(State(state): State<AppState>) -> impl IntoResponse {
    Json(ThemeBody {
        theme: commands::get_theme(&state).await,
    })
}

async fn set_theme(State(state): State<AppState>, body: Bytes) -> Result<Response, ChatError> {
    let ThemeBody { theme } = parse_json(&body)?;
    Ok(Json(ThemeBody {
        theme: commands::set_theme(&state, theme).await,
    })
    .into_response())
}
