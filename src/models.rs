use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

// Author of a message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("Unknown message role: {}", other)),
        }
    }
}

/// Remote model service executing a completion.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Google => "google",
        }
    }

    /// Environment variable holding this provider's credential.
    pub fn credential_var(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OPENAI_API_KEY",
            Provider::Google => "GOOGLE_GENERATIVE_AI_API_KEY",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OpenAI",
            Provider::Google => "Google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::OpenAI),
            "google" => Ok(Provider::Google),
            other => Err(format!("Unsupported provider: {}", other)),
        }
    }
}

// A user-supplied document attached to one outgoing message.
// `data` is either raw base64 or a `data:` URL.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(rename = "size", default)]
    pub size_bytes: u64,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

// A single persisted message in a chat
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")] // Generate a new UUID if missing during deserialization
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileAttachment>>,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "now_millis")]
    pub timestamp: DateTime<Utc>,
}

/// Current time at the millisecond precision the stored documents keep.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A conversation as stored in the chat list document.
///
/// Timestamps serialize as epoch milliseconds so the stored document keeps the
/// shape the browser client wrote.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub title: String,
    pub messages: Vec<Message>,
    pub model: String,
    pub provider: Provider,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

// Entry of the static model catalog (never persisted)
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AIModel {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: Provider,
    pub supports_vision: bool,
    pub supports_streaming: bool,
}

pub const AI_MODELS: &[AIModel] = &[
    AIModel {
        id: "gpt-4o-mini",
        name: "GPT-4o Mini (OpenAI)",
        provider: Provider::OpenAI,
        supports_vision: true,
        supports_streaming: true,
    },
    AIModel {
        id: "gpt-3.5-turbo",
        name: "GPT-3.5 Turbo (OpenAI)",
        provider: Provider::OpenAI,
        supports_vision: false,
        supports_streaming: true,
    },
    AIModel {
        id: "gemini-2.0-flash",
        name: "Gemini 2.0 Flash",
        provider: Provider::Google,
        supports_vision: true,
        supports_streaming: true,
    },
    AIModel {
        id: "gemini-1.5-flash",
        name: "Gemini 1.5 Flash",
        provider: Provider::Google,
        supports_vision: true,
        supports_streaming: true,
    },
    AIModel {
        id: "gemini-1.5-flash-8b",
        name: "Gemini 1.5 Flash-8B",
        provider: Provider::Google,
        supports_vision: true,
        supports_streaming: true,
    },
    AIModel {
        id: "gemini-1.5-pro",
        name: "Gemini 1.5 Pro",
        provider: Provider::Google,
        supports_vision: true,
        supports_streaming: true,
    },
];

static MODEL_INDEX: LazyLock<HashMap<&'static str, &'static AIModel>> =
    LazyLock::new(|| AI_MODELS.iter().map(|m| (m.id, m)).collect());

/// Looks up a catalog entry. Unknown ids return `None`.
pub fn find_model(id: &str) -> Option<&'static AIModel> {
    MODEL_INDEX.get(id).copied()
}

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PROVIDER: Provider = Provider::OpenAI;

// Persisted application settings. `current_chat_id` is a weak reference:
// it may point at a deleted chat.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub current_chat_id: Option<Uuid>,
    pub current_model: String,
    pub current_provider: Provider,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            current_chat_id: None,
            current_model: DEFAULT_MODEL.to_string(),
            current_provider: DEFAULT_PROVIDER,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        }
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "system" => Ok(Theme::System),
            other => Err(format!("Unknown theme: {}", other)),
        }
    }
}
