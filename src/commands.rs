// Conversation-level operations behind the HTTP handlers

use crate::api::{DeltaStream, ModelHandle};
use crate::error::ChatError;
use crate::models::{find_model, AppSettings, Chat, FileAttachment, Provider, Role, Theme};
use crate::request::{
    annotate_attachments, build_messages, file_policy, ChatRequest, HistoryMessage, PendingTurn,
    ProviderMessage,
};
use crate::session::{
    drive, Exchange, SessionMessage, SessionSnapshot, SessionStatus, StreamOutcome,
    StreamingSession,
};
use crate::state::AppState;
use crate::sync::sync_session;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub const VISION_UNSUPPORTED: &str =
    "The selected model does not support image inputs. Please choose a vision-capable model.";

/// Body of a send in a conversation view. Model and provider default to the
/// ones stored in the settings.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    pub model: Option<String>,
    pub provider: Option<Provider>,
}

// --- Chat list ---

pub async fn list_chats(state: &AppState) -> Vec<Chat> {
    log::info!("Listing chats");
    state.storage.lock().await.get_chats().await
}

pub async fn get_chat(state: &AppState, chat_id: Uuid) -> Result<Chat, ChatError> {
    state
        .storage
        .lock()
        .await
        .get_chat(chat_id)
        .await
        .ok_or_else(|| ChatError::NotFound(format!("Chat {} not found", chat_id)))
}

/// Deletes a chat, stopping its exchange first so it is not written back.
pub async fn delete_chat(state: &AppState, chat_id: Uuid) {
    log::info!("Deleting chat {}", chat_id);
    if let Some(session) = state.sessions.remove(chat_id) {
        session.lock().await.cancel();
    }
    state.storage.lock().await.delete_chat(chat_id).await;
}

pub async fn clear_chats(state: &AppState) {
    log::info!("Clearing all chats");
    for chat_id in state.sessions.chat_ids() {
        if let Some(session) = state.sessions.remove(chat_id) {
            session.lock().await.cancel();
        }
    }
    state.storage.lock().await.clear_all_chats().await;
}

// --- Settings and theme ---

pub async fn get_settings(state: &AppState) -> AppSettings {
    state.storage.lock().await.get_settings().await
}

pub async fn update_settings(state: &AppState, settings: AppSettings) -> AppSettings {
    log::info!(
        "Model changed to: {} ({})",
        settings.current_model,
        settings.current_provider
    );
    state.storage.lock().await.save_settings(&settings).await;
    settings
}

pub async fn get_theme(state: &AppState) -> Theme {
    state.storage.lock().await.get_theme().await
}

pub async fn set_theme(state: &AppState, theme: Theme) -> Theme {
    state.storage.lock().await.save_theme(theme).await;
    theme
}

// --- Stateless completion ---

/// Resolves the provider and opens the increment stream for `POST /api/chat`.
pub async fn stream_completion(
    state: &AppState,
    request: &ChatRequest,
) -> Result<DeltaStream, ChatError> {
    log::info!(
        "Chat request: model={} provider={} messages={} files={}",
        request.model,
        request.provider,
        request.messages.len(),
        request.files.len()
    );
    for file in &request.files {
        log::info!(
            "  file: name={} type={} hasData={}",
            file.name,
            file.mime_type,
            !file.data.is_empty()
        );
    }

    let handle = state
        .providers
        .resolve_named(request.provider.as_str(), &request.model)?;
    let messages = request.provider_messages()?;
    if log::log_enabled!(log::Level::Debug) {
        log::debug!(
            "Formatted messages: {}",
            serde_json::to_string_pretty(&messages).unwrap_or_default()
        );
    }
    handle.stream(&messages).await
}

// --- Conversation view ---

async fn session_for(state: &AppState, chat_id: Uuid) -> Arc<Mutex<StreamingSession>> {
    if let Some(session) = state.sessions.get(chat_id) {
        return session;
    }
    let stored = state.storage.lock().await.get_chat(chat_id).await;
    state.sessions.get_or_insert_with(chat_id, || match &stored {
        Some(chat) => StreamingSession::from_chat(chat),
        None => StreamingSession::new(chat_id),
    })
}

/// Sends a user turn in chat `chat_id` and streams the reply.
///
/// Validation (empty input, images on a non-vision model, unsupported files,
/// missing credential) happens before the session changes. The exchange then
/// runs in a background task; the returned receiver yields each increment and
/// closes when the exchange ends. Dropping it does not stop generation.
pub async fn send_message(
    state: &AppState,
    chat_id: Uuid,
    request: SendMessageRequest,
) -> Result<mpsc::UnboundedReceiver<String>, ChatError> {
    if request.content.trim().is_empty() && request.images.is_empty() && request.files.is_empty() {
        return Err(ChatError::Validation("Message content is required".to_string()));
    }

    let settings = get_settings(state).await;
    let model = request.model.unwrap_or(settings.current_model);
    let provider = request.provider.unwrap_or(settings.current_provider);

    if !request.images.is_empty() {
        let supports_vision = find_model(&model).is_some_and(|m| m.supports_vision);
        if !supports_vision {
            return Err(ChatError::Validation(VISION_UNSUPPORTED.to_string()));
        }
    }
    for file in &request.files {
        file_policy(file)?;
    }
    let handle = state.providers.resolve(provider, &model)?;

    let session = session_for(state, chat_id).await;
    let text = annotate_attachments(&request.content, &request.files);
    let (exchange, provider_messages) = {
        let mut session = session.lock().await;
        let history: Vec<HistoryMessage> = session
            .messages()
            .iter()
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        let provider_messages = build_messages(
            &history,
            PendingTurn {
                text: &request.content,
                images: &request.images,
                files: &request.files,
            },
        )?;
        let exchange = session.begin(SessionMessage::new(Role::User, text))?;
        (exchange, provider_messages)
    };
    log::info!(
        "Chat {}: exchange {} submitted to {} ({})",
        chat_id,
        exchange.id,
        handle.model,
        handle.provider
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let state = state.clone();
    tokio::spawn(async move {
        run_exchange(state, chat_id, session, exchange, handle, provider_messages, tx).await;
    });
    Ok(rx)
}

async fn run_exchange(
    state: AppState,
    chat_id: Uuid,
    session: Arc<Mutex<StreamingSession>>,
    exchange: Exchange,
    handle: ModelHandle,
    messages: Vec<ProviderMessage>,
    tx: mpsc::UnboundedSender<String>,
) {
    let established = tokio::select! {
        biased;
        _ = exchange.token.cancelled() => None,
        result = handle.stream(&messages) => Some(result),
    };

    let outcome = match established {
        Some(Ok(stream)) => {
            drive(&session, &exchange, stream, |delta| {
                // The caller may have gone away; the exchange still completes.
                let _ = tx.send(delta.to_string());
            })
            .await
        }
        Some(Err(e)) => {
            let outcome = StreamOutcome::Failed(e.to_string());
            session.lock().await.finish(exchange.id, &outcome);
            outcome
        }
        None => {
            let outcome = StreamOutcome::Cancelled;
            session.lock().await.finish(exchange.id, &outcome);
            outcome
        }
    };
    drop(tx);
    log::info!("Chat {}: exchange {} ended: {:?}", chat_id, exchange.id, outcome);

    // Checked under the store lock; delete_chat deregisters before taking it.
    let storage = state.storage.lock().await;
    let still_registered = state
        .sessions
        .get(chat_id)
        .is_some_and(|current| Arc::ptr_eq(&current, &session));
    if !still_registered {
        log::warn!("Chat {} was deleted during the exchange, not saving", chat_id);
        return;
    }

    let (snapshot, idle) = {
        let session = session.lock().await;
        (session.messages().to_vec(), session.status() == SessionStatus::Idle)
    };
    sync_session(&storage, chat_id, &snapshot, &handle.model, handle.provider).await;

    // An idle session is fully persisted; errored ones stay for the banner.
    if idle && state.sessions.evict_if_unused(chat_id, &session) {
        log::debug!("Chat {}: session evicted after sync", chat_id);
    }
}

/// Stops the exchange running in `chat_id`. Returns false when idle.
pub async fn stop_generation(state: &AppState, chat_id: Uuid) -> bool {
    log::info!("Stop requested for chat {}", chat_id);
    match state.sessions.get(chat_id) {
        Some(session) => session.lock().await.cancel(),
        None => false,
    }
}

pub async fn session_snapshot(state: &AppState, chat_id: Uuid) -> SessionSnapshot {
    if let Some(session) = state.sessions.get(chat_id) {
        return session.lock().await.snapshot();
    }
    let stored = state.storage.lock().await.get_chat(chat_id).await;
    match stored {
        Some(chat) => StreamingSession::from_chat(&chat).snapshot(),
        None => StreamingSession::new(chat_id).snapshot(),
    }
}

pub async fn dismiss_error(state: &AppState, chat_id: Uuid) -> SessionSnapshot {
    if let Some(session) = state.sessions.get(chat_id) {
        session.lock().await.dismiss_error();
    }
    session_snapshot(state, chat_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LLMApiProvider, ProviderRegistry};
    use crate::config::Credentials;
    use crate::request::{ContentPart, MessageContent};
    use crate::storage::StorageManager;
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use std::time::Duration;

    // Replays fixed increments, optionally hanging afterwards.
    struct ScriptedProvider {
        deltas: Vec<&'static str>,
        hang: bool,
        fail_after: Option<&'static str>,
    }

    #[async_trait]
    impl LLMApiProvider for ScriptedProvider {
        async fn send_chat_stream_request(
            &self,
            _model: &str,
            _api_key: &str,
            _messages: &[ProviderMessage],
        ) -> anyhow::Result<DeltaStream> {
            let mut items: Vec<anyhow::Result<String>> =
                self.deltas.iter().map(|d| Ok(d.to_string())).collect();
            if let Some(message) = self.fail_after {
                items.push(Err(anyhow::anyhow!(message)));
            }
            let head = stream::iter(items);
            if self.hang {
                Ok(Box::pin(head.chain(stream::pending())))
            } else {
                Ok(Box::pin(head))
            }
        }
    }

    // Records the messages it is asked to send and replies with one increment.
    #[derive(Default)]
    struct CapturingProvider {
        sent: std::sync::Mutex<Vec<ProviderMessage>>,
    }

    #[async_trait]
    impl LLMApiProvider for CapturingProvider {
        async fn send_chat_stream_request(
            &self,
            _model: &str,
            _api_key: &str,
            messages: &[ProviderMessage],
        ) -> anyhow::Result<DeltaStream> {
            *self.sent.lock().unwrap() = messages.to_vec();
            Ok(Box::pin(stream::iter(vec![Ok::<_, anyhow::Error>("ok".to_string())])))
        }
    }

    async fn state_with(provider: ScriptedProvider) -> AppState {
        state_with_backend(Arc::new(provider)).await
    }

    async fn state_with_backend(backend: Arc<dyn LLMApiProvider>) -> AppState {
        let creds = Credentials {
            openai: Some("sk-test".into()),
            google: None,
        };
        let registry = ProviderRegistry::with_backends(creds, backend.clone(), backend);
        AppState::new(StorageManager::in_memory().await.unwrap(), registry)
    }

    fn text(content: &str) -> SendMessageRequest {
        SendMessageRequest {
            content: content.into(),
            ..Default::default()
        }
    }

    async fn wait_for_saved(state: &AppState, chat_id: Uuid, messages: usize) -> Chat {
        for _ in 0..200 {
            if let Ok(chat) = get_chat(state, chat_id).await {
                if chat.messages.len() == messages && session_snapshot(state, chat_id).await.status != SessionStatus::Streaming {
                    return chat;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("chat {} was not saved", chat_id);
    }

    #[tokio::test]
    async fn completed_exchange_is_persisted() {
        let state = state_with(ScriptedProvider { deltas: vec!["Hel", "lo"], hang: false, fail_after: None }).await;
        let chat_id = Uuid::new_v4();

        let mut rx = send_message(&state, chat_id, text("Hi")).await.unwrap();
        let mut streamed = String::new();
        while let Some(delta) = rx.recv().await {
            streamed.push_str(&delta);
        }
        assert_eq!(streamed, "Hello");

        let chat = wait_for_saved(&state, chat_id, 2).await;
        assert_eq!(chat.title, "Hi");
        assert_eq!(chat.messages[1].content, "Hello");
        assert_eq!(chat.model, "gpt-4o-mini");
        assert_eq!(get_settings(&state).await.current_chat_id, Some(chat_id));
    }

    #[tokio::test]
    async fn attachment_listing_is_stored_but_not_sent() {
        let capture = Arc::new(CapturingProvider::default());
        let state = state_with_backend(capture.clone()).await;
        let chat_id = Uuid::new_v4();

        let request = SendMessageRequest {
            content: "Hi".into(),
            files: vec![FileAttachment {
                name: "a.pdf".into(),
                mime_type: "application/pdf".into(),
                size_bytes: 5,
                data: "JVBERi0=".into(),
                extracted_text: None,
            }],
            ..Default::default()
        };
        let mut rx = send_message(&state, chat_id, request).await.unwrap();
        while rx.recv().await.is_some() {}

        let sent = capture.sent.lock().unwrap().clone();
        let parts = match &sent.last().unwrap().content {
            MessageContent::Parts(parts) => parts.clone(),
            other => panic!("expected multimodal content, got {:?}", other),
        };
        assert_eq!(parts[0], ContentPart::Text { text: "Hi".into() });
        assert_eq!(
            parts.last().unwrap(),
            &ContentPart::File {
                data: "JVBERi0=".into(),
                media_type: "application/pdf".into(),
            }
        );

        let chat = wait_for_saved(&state, chat_id, 2).await;
        assert_eq!(
            chat.messages[0].content,
            "Hi\n\n[Attached files:]\n- a.pdf (application/pdf)\n"
        );
    }

    #[tokio::test]
    async fn finished_session_is_evicted_after_sync() {
        let state = state_with(ScriptedProvider { deltas: vec!["done"], hang: false, fail_after: None }).await;
        let chat_id = Uuid::new_v4();

        let mut rx = send_message(&state, chat_id, text("Hi")).await.unwrap();
        while rx.recv().await.is_some() {}

        for _ in 0..200 {
            if !state.sessions.contains(chat_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!state.sessions.contains(chat_id));

        let snapshot = session_snapshot(&state, chat_id).await;
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[1].content, "done");
    }

    #[tokio::test]
    async fn stop_after_two_increments_keeps_hello() {
        let state = state_with(ScriptedProvider { deltas: vec!["Hel", "lo"], hang: true, fail_after: None }).await;
        let chat_id = Uuid::new_v4();

        let mut rx = send_message(&state, chat_id, text("Hi")).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("Hel"));
        assert_eq!(rx.recv().await.as_deref(), Some("lo"));

        let busy = send_message(&state, chat_id, text("again")).await.unwrap_err();
        assert!(matches!(busy, ChatError::SessionBusy(_)));

        assert!(stop_generation(&state, chat_id).await);
        assert_eq!(rx.recv().await, None);

        let chat = wait_for_saved(&state, chat_id, 2).await;
        assert_eq!(chat.messages[1].content, "Hello");
        let snapshot = session_snapshot(&state, chat_id).await;
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test]
    async fn stream_failure_surfaces_error_and_keeps_partial() {
        let state = state_with(ScriptedProvider { deltas: vec!["Par"], hang: false, fail_after: Some("upstream reset") }).await;
        let chat_id = Uuid::new_v4();

        let mut rx = send_message(&state, chat_id, text("Hi")).await.unwrap();
        while rx.recv().await.is_some() {}

        let chat = wait_for_saved(&state, chat_id, 2).await;
        assert_eq!(chat.messages[1].content, "Par");
        let snapshot = session_snapshot(&state, chat_id).await;
        assert_eq!(snapshot.status, SessionStatus::Error);
        assert_eq!(snapshot.error.as_deref(), Some("upstream reset"));

        let snapshot = dismiss_error(&state, chat_id).await;
        assert_eq!(snapshot.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn validation_happens_before_the_session_changes() {
        let state = state_with(ScriptedProvider { deltas: vec![], hang: false, fail_after: None }).await;
        let chat_id = Uuid::new_v4();

        let err = send_message(&state, chat_id, text("   ")).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let request = SendMessageRequest {
            content: "look".into(),
            images: vec!["data:image/png;base64,AA".into()],
            model: Some("gpt-3.5-turbo".into()),
            ..Default::default()
        };
        let err = send_message(&state, chat_id, request).await.unwrap_err();
        assert_eq!(err.to_string(), VISION_UNSUPPORTED);

        let request = SendMessageRequest {
            content: "hola".into(),
            model: Some("gemini-2.0-flash".into()),
            provider: Some(Provider::Google),
            ..Default::default()
        };
        let err = send_message(&state, chat_id, request).await.unwrap_err();
        assert!(matches!(err, ChatError::Configuration(_)));

        assert!(session_snapshot(&state, chat_id).await.messages.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_chat_stops_and_forgets_it() {
        let state = state_with(ScriptedProvider { deltas: vec!["x"], hang: true, fail_after: None }).await;
        let chat_id = Uuid::new_v4();

        let mut rx = send_message(&state, chat_id, text("Hi")).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("x"));
        delete_chat(&state, chat_id).await;
        assert_eq!(rx.recv().await, None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(get_chat(&state, chat_id).await.is_err());
    }
}
