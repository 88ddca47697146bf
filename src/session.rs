//! In-flight exchange tracking for a conversation view.
//!
//! One `StreamingSession` exists per chat id. An exchange moves
//! `idle -> submitted -> streaming -> idle`, or ends in `error`; stopping it
//! from `submitted` or `streaming` returns straight to `idle` and keeps the
//! content received so far.

use crate::api::DeltaStream;
use crate::error::ChatError;
use crate::models::{Chat, Role};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    /// Request dispatched, nothing received yet.
    Submitted,
    /// At least one increment applied.
    Streaming,
    Error,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SessionMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
}

impl SessionMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Handle on the exchange started by `begin`.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub chat_id: Uuid,
    pub status: SessionStatus,
    pub messages: Vec<SessionMessage>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct StreamingSession {
    chat_id: Uuid,
    messages: Vec<SessionMessage>,
    status: SessionStatus,
    error: Option<String>,
    exchange_id: u64,
    cancel: CancellationToken,
    // assistant message receiving the current exchange's increments
    assistant_index: Option<usize>,
}

impl StreamingSession {
    pub fn new(chat_id: Uuid) -> Self {
        Self {
            chat_id,
            messages: Vec::new(),
            status: SessionStatus::Idle,
            error: None,
            exchange_id: 0,
            cancel: CancellationToken::new(),
            assistant_index: None,
        }
    }

    /// Seeds a session with a stored conversation.
    pub fn from_chat(chat: &Chat) -> Self {
        let mut session = Self::new(chat.id);
        session.messages = chat
            .messages
            .iter()
            .map(|m| SessionMessage {
                id: m.id,
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        session
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn messages(&self) -> &[SessionMessage] {
        &self.messages
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Submitted | SessionStatus::Streaming)
    }

    /// Starts an exchange with `user_message`. Rejected while another exchange
    /// is in flight; a pending error is cleared.
    pub fn begin(&mut self, user_message: SessionMessage) -> Result<Exchange, ChatError> {
        if self.is_active() {
            return Err(ChatError::SessionBusy(self.chat_id));
        }
        self.messages.push(user_message);
        self.error = None;
        self.status = SessionStatus::Submitted;
        self.exchange_id += 1;
        self.cancel = CancellationToken::new();
        self.assistant_index = None;
        Ok(Exchange {
            id: self.exchange_id,
            token: self.cancel.clone(),
        })
    }

    fn is_current(&self, exchange_id: u64) -> bool {
        self.exchange_id == exchange_id && self.is_active() && !self.cancel.is_cancelled()
    }

    /// Appends one increment to the in-progress assistant message, creating it
    /// on the first increment. Returns false when the exchange is no longer
    /// live (stopped or superseded).
    pub fn apply_delta(&mut self, exchange_id: u64, delta: &str) -> bool {
        if !self.is_current(exchange_id) {
            return false;
        }
        match self.assistant_index {
            Some(index) => self.messages[index].content.push_str(delta),
            None => {
                self.messages.push(SessionMessage::new(Role::Assistant, delta));
                self.assistant_index = Some(self.messages.len() - 1);
                self.status = SessionStatus::Streaming;
            }
        }
        true
    }

    /// Records how an exchange ended. Stale exchanges are ignored.
    pub fn finish(&mut self, exchange_id: u64, outcome: &StreamOutcome) {
        if self.exchange_id != exchange_id {
            return;
        }
        match outcome {
            StreamOutcome::Failed(message) if self.is_active() => {
                self.status = SessionStatus::Error;
                self.error = Some(message.clone());
            }
            StreamOutcome::Failed(_) => {}
            StreamOutcome::Completed | StreamOutcome::Cancelled => {
                if self.is_active() {
                    self.status = SessionStatus::Idle;
                }
            }
        }
        self.assistant_index = None;
    }

    /// Stops the in-flight exchange. Accumulated content stays as the final
    /// message. Returns false when nothing was running.
    pub fn cancel(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.cancel.cancel();
        self.status = SessionStatus::Idle;
        self.assistant_index = None;
        true
    }

    pub fn dismiss_error(&mut self) {
        if self.status == SessionStatus::Error {
            self.status = SessionStatus::Idle;
        }
        self.error = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            chat_id: self.chat_id,
            status: self.status,
            messages: self.messages.clone(),
            error: self.error.clone(),
        }
    }
}

/// Consumes `stream` into the session, in arrival order, until it ends,
/// fails or `exchange.token` is cancelled. `on_delta` sees every applied
/// increment after the session lock is released.
pub async fn drive<F>(
    session: &Mutex<StreamingSession>,
    exchange: &Exchange,
    mut stream: DeltaStream,
    mut on_delta: F,
) -> StreamOutcome
where
    F: FnMut(&str),
{
    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = exchange.token.cancelled() => break StreamOutcome::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delta)) => {
                log::debug!("Exchange {}: received {} byte increment", exchange.id, delta.len());
                let applied = session.lock().await.apply_delta(exchange.id, &delta);
                if !applied {
                    break StreamOutcome::Cancelled;
                }
                on_delta(&delta);
            }
            Some(Err(e)) => {
                log::error!("Exchange {}: error receiving stream delta: {:#}", exchange.id, e);
                break StreamOutcome::Failed(e.to_string());
            }
            None => break StreamOutcome::Completed,
        }
    };

    if outcome == StreamOutcome::Cancelled {
        log::warn!("Exchange {}: stopped by request", exchange.id);
    }
    session.lock().await.finish(exchange.id, &outcome);
    outcome
}

/// Sessions keyed by chat id; at most one per conversation view.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Mutex<StreamingSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat_id: Uuid) -> Option<Arc<Mutex<StreamingSession>>> {
        self.sessions.get(&chat_id).map(|entry| entry.value().clone())
    }

    pub fn get_or_insert_with<F>(&self, chat_id: Uuid, init: F) -> Arc<Mutex<StreamingSession>>
    where
        F: FnOnce() -> StreamingSession,
    {
        self.sessions
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .value()
            .clone()
    }

    pub fn remove(&self, chat_id: Uuid) -> Option<Arc<Mutex<StreamingSession>>> {
        self.sessions.remove(&chat_id).map(|(_, session)| session)
    }

    pub fn contains(&self, chat_id: Uuid) -> bool {
        self.sessions.contains_key(&chat_id)
    }

    /// Drops `session` from the registry if nobody but the caller still holds
    /// it. The store stays the source of truth for evicted chats.
    pub fn evict_if_unused(&self, chat_id: Uuid, session: &Arc<Mutex<StreamingSession>>) -> bool {
        // registry entry + caller
        self.sessions
            .remove_if(&chat_id, |_, current| {
                Arc::ptr_eq(current, session) && Arc::strong_count(current) == 2
            })
            .is_some()
    }

    pub fn chat_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }
}
