use crate::models::{now_millis, Chat, Message, Provider, Role};
use crate::session::SessionMessage;
use crate::storage::StorageManager;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const TITLE_MAX_CHARS: usize = 50;
const DEFAULT_TITLE: &str = "New Chat";

/// Display title derived from the first user message.
pub fn generate_chat_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", truncated.trim_end())
}

/// Builds the chat record for a finished exchange.
///
/// Messages already stored keep their timestamp; new ones get `now`. The
/// title and `created_at` are taken from the stored record when there is one.
pub fn reconcile(
    existing: Option<&Chat>,
    chat_id: Uuid,
    messages: &[SessionMessage],
    model: &str,
    provider: Provider,
    now: DateTime<Utc>,
) -> Chat {
    let stored_timestamp = |id: Uuid| {
        existing
            .and_then(|chat| chat.messages.iter().find(|m| m.id == id))
            .map(|m| m.timestamp)
    };

    let messages: Vec<Message> = messages
        .iter()
        .map(|m| Message {
            id: m.id,
            role: m.role,
            content: m.content.clone(),
            images: None,
            files: None,
            timestamp: stored_timestamp(m.id).unwrap_or(now),
        })
        .collect();

    let title = match existing {
        Some(chat) if !chat.title.is_empty() => chat.title.clone(),
        _ => generate_chat_title(
            messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or(DEFAULT_TITLE),
        ),
    };
    let created_at = existing.map(|chat| chat.created_at).unwrap_or(now);

    Chat {
        id: chat_id,
        title,
        messages,
        model: model.to_string(),
        provider,
        created_at,
        updated_at: now.max(created_at),
    }
}

/// Writes the session's messages back to the chat list and marks the chat
/// as current. Does nothing for an empty session.
pub async fn sync_session(
    storage: &StorageManager,
    chat_id: Uuid,
    messages: &[SessionMessage],
    model: &str,
    provider: Provider,
) -> Option<Chat> {
    if messages.is_empty() {
        return None;
    }

    let existing = storage.get_chat(chat_id).await;
    let chat = reconcile(existing.as_ref(), chat_id, messages, model, provider, now_millis());
    storage.save_chat(&chat).await;

    let mut settings = storage.get_settings().await;
    if settings.current_chat_id != Some(chat_id) {
        settings.current_chat_id = Some(chat_id);
        storage.save_settings(&settings).await;
    }

    log::info!(
        "Synced chat {} ({} messages, title {:?})",
        chat_id,
        chat.messages.len(),
        chat.title
    );
    Some(chat)
}
