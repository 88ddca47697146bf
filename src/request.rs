//! Inbound request schema and the provider-agnostic message builder.
//!
//! Everything here is pure: it turns client state (history, the new user
//! text, pending images and files) into the ordered message list handed to a
//! provider adapter.

use crate::error::ChatError;
use crate::models::{FileAttachment, Provider, Role};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const PDF_MEDIA_TYPE: &str = "application/pdf";
const EXTRACTION_FAILED: &str = "[Error: Could not extract text from file]";

// Browsers and editors hand over both padded and unpadded payloads.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// One block of a multimodal message body.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        image: String,
    },
    File {
        data: String,
        #[serde(rename = "mediaType")]
        media_type: String,
    },
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the message, ignoring image and file blocks.
    pub fn flattened_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Message in the shape sent to a provider adapter.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ProviderMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Prior message of a conversation, already flattened to text.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

/// The user turn being sent, with its pending attachments.
#[derive(Clone, Copy, Debug)]
pub struct PendingTurn<'a> {
    pub text: &'a str,
    pub images: &'a [String],
    pub files: &'a [FileAttachment],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilePolicy {
    /// Sent as a file block carrying the payload untouched.
    Pdf,
    /// Decoded and appended to the leading text block.
    InlineText,
}

/// Decides how a file is forwarded, rejecting types no rule covers.
pub fn file_policy(file: &FileAttachment) -> Result<FilePolicy, ChatError> {
    let mime = file.mime_type.as_str();
    if mime == PDF_MEDIA_TYPE {
        Ok(FilePolicy::Pdf)
    } else if mime.starts_with("text/") || mime == "application/json" {
        Ok(FilePolicy::InlineText)
    } else {
        Err(ChatError::Validation(format!(
            "Unsupported attachment type for {}: {}. Attach PDF, text or JSON files.",
            file.name,
            if mime.is_empty() { "unknown" } else { mime }
        )))
    }
}

/// Builds the outbound message list.
///
/// History passes through as flattened text. The pending turn becomes a
/// multimodal message when it carries attachments: text block first, then
/// images, then PDF blocks, each in attachment order. Text and JSON files are
/// folded into the text block.
pub fn build_messages(
    history: &[HistoryMessage],
    turn: PendingTurn<'_>,
) -> Result<Vec<ProviderMessage>, ChatError> {
    let mut messages: Vec<ProviderMessage> = history
        .iter()
        .map(|msg| ProviderMessage::text(msg.role, msg.content.clone()))
        .collect();

    if turn.images.is_empty() && turn.files.is_empty() {
        messages.push(ProviderMessage::text(Role::User, turn.text));
        return Ok(messages);
    }

    let mut text = turn.text.to_string();
    let mut file_parts = Vec::new();
    for file in turn.files {
        match file_policy(file)? {
            FilePolicy::Pdf => {
                log::info!("Adding PDF to message: {}", file.name);
                file_parts.push(ContentPart::File {
                    data: file.data.clone(),
                    media_type: PDF_MEDIA_TYPE.to_string(),
                });
            }
            FilePolicy::InlineText => {
                let extracted = extract_text(&file.data);
                text.push_str(&format!("\n\n--- File: {} ---\n{}\n---\n", file.name, extracted));
            }
        }
    }

    let mut parts = Vec::with_capacity(1 + turn.images.len() + file_parts.len());
    parts.push(ContentPart::Text { text });
    parts.extend(
        turn.images
            .iter()
            .map(|image| ContentPart::Image { image: image.clone() }),
    );
    parts.extend(file_parts);

    messages.push(ProviderMessage {
        role: Role::User,
        content: MessageContent::Parts(parts),
    });
    Ok(messages)
}

/// Appends the attachment listing shown in the conversation history.
pub fn annotate_attachments(text: &str, files: &[FileAttachment]) -> String {
    if files.is_empty() {
        return text.to_string();
    }
    let mut annotated = format!("{}\n\n[Attached files:]\n", text);
    for file in files {
        annotated.push_str(&format!("- {} ({})\n", file.name, file.mime_type));
    }
    annotated
}

// --- Attachment payload helpers ---

/// Returns the base64 portion of a raw payload or a `data:` URL.
pub fn strip_data_url(data: &str) -> &str {
    match data.split_once(',') {
        Some((_, payload)) if data.starts_with("data:") => payload,
        _ => data,
    }
}

/// Media type declared by a `data:` URL, if any.
pub fn data_url_media_type(data: &str) -> Option<&str> {
    let header = data.strip_prefix("data:")?.split_once(',')?.0;
    let media_type = header.split(';').next()?;
    (!media_type.is_empty()).then_some(media_type)
}

/// Best-effort image type for a reference without a usable header.
pub fn sniff_image_mime(image: &str) -> &'static str {
    if image.contains("image/png") {
        "image/png"
    } else if image.contains("image/gif") {
        "image/gif"
    } else if image.contains("image/webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Decodes a base64 text payload, tolerating line breaks and missing padding.
pub fn extract_text(data: &str) -> String {
    let compact: String = strip_data_url(data)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    match LENIENT.decode(compact) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            log::error!("Error extracting text from file: {}", e);
            EXTRACTION_FAILED.to_string()
        }
    }
}

// --- Inbound schema ---

#[derive(Deserialize)]
struct RawMessage {
    role: String,
    content: String,
    #[serde(default)]
    images: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RawChatRequest {
    messages: Vec<RawMessage>,
    model: String,
    provider: String,
    #[serde(default)]
    files: Option<Vec<FileAttachment>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub role: Role,
    pub content: String,
    pub images: Vec<String>,
}

/// Validated body of `POST /api/chat`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<InboundMessage>,
    pub model: String,
    pub provider: Provider,
    pub files: Vec<FileAttachment>,
}

impl ChatRequest {
    /// Parses and validates a request body in one pass. Nothing downstream
    /// re-checks these fields.
    pub fn parse(body: &[u8]) -> Result<Self, ChatError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ChatError::Validation(format!("Invalid request body: {}", e)))?;

        let has_messages = value
            .get("messages")
            .and_then(|m| m.as_array())
            .is_some_and(|m| !m.is_empty());
        if !has_messages {
            return Err(ChatError::Validation("Messages are required".to_string()));
        }

        let non_empty = |field: &str| {
            value
                .get(field)
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.is_empty())
        };
        if !non_empty("model") || !non_empty("provider") {
            return Err(ChatError::Validation(
                "Model and provider are required".to_string(),
            ));
        }

        let raw: RawChatRequest = serde_json::from_value(value)
            .map_err(|e| ChatError::Validation(format!("Invalid request body: {}", e)))?;

        let provider: Provider = raw
            .provider
            .parse()
            .map_err(|_| ChatError::UnsupportedProvider(raw.provider.clone()))?;

        let messages = raw
            .messages
            .into_iter()
            .map(|msg| {
                Ok(InboundMessage {
                    role: msg.role.parse().map_err(ChatError::Validation)?,
                    content: msg.content,
                    images: msg.images.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, ChatError>>()?;

        let files = raw.files.unwrap_or_default();
        for file in &files {
            file_policy(file)?;
        }

        Ok(Self {
            messages,
            model: raw.model,
            provider,
            files,
        })
    }

    /// Splits the request into history and pending turn and builds the
    /// provider messages. Attachments only ride on a trailing user message.
    pub fn provider_messages(&self) -> Result<Vec<ProviderMessage>, ChatError> {
        let (last, prior) = match self.messages.split_last() {
            Some(split) => split,
            None => return Err(ChatError::Validation("Messages are required".to_string())),
        };

        let history_of = |msgs: &[InboundMessage]| -> Vec<HistoryMessage> {
            msgs.iter()
                .map(|m| HistoryMessage {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect()
        };

        if last.role != Role::User {
            if !self.files.is_empty() {
                log::warn!(
                    "Ignoring {} file(s): last message is not from the user",
                    self.files.len()
                );
            }
            return Ok(history_of(&self.messages)
                .into_iter()
                .map(|m| ProviderMessage::text(m.role, m.content))
                .collect());
        }

        build_messages(
            &history_of(prior),
            PendingTurn {
                text: &last.content,
                images: &last.images,
                files: &self.files,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, mime: &str, data: &str) -> FileAttachment {
        FileAttachment {
            name: name.into(),
            mime_type: mime.into(),
            size_bytes: data.len() as u64,
            data: data.into(),
            extracted_text: None,
        }
    }

    fn parts_of(msg: &ProviderMessage) -> &[ContentPart] {
        match &msg.content {
            MessageContent::Parts(parts) => parts,
            MessageContent::Text(_) => panic!("expected multimodal content"),
        }
    }

    #[test]
    fn plain_turn_stays_text() {
        let history = vec![
            HistoryMessage { role: Role::User, content: "a".into() },
            HistoryMessage { role: Role::Assistant, content: "b".into() },
        ];
        let msgs = build_messages(
            &history,
            PendingTurn { text: "c", images: &[], files: &[] },
        )
        .unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1], ProviderMessage::text(Role::Assistant, "b"));
        assert_eq!(msgs[2], ProviderMessage::text(Role::User, "c"));
    }

    #[test]
    fn text_files_are_appended_in_order() {
        // "hello" and "{}" in base64, one as a data URL
        let files = vec![
            file("a.txt", "text/plain", "aGVsbG8="),
            file("pic.pdf", PDF_MEDIA_TYPE, "JVBERi0="),
            file("b.json", "application/json", "data:application/json;base64,e30="),
        ];
        let msgs = build_messages(&[], PendingTurn { text: "Read", images: &[], files: &files }).unwrap();
        let parts = parts_of(&msgs[0]);
        assert_eq!(
            parts[0],
            ContentPart::Text {
                text: "Read\n\n--- File: a.txt ---\nhello\n---\n\n\n--- File: b.json ---\n{}\n---\n"
                    .into()
            }
        );
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn images_follow_text_block_in_order() {
        let images = vec!["data:image/png;base64,AAA".to_string(), "BBB".to_string()];
        let msgs = build_messages(&[], PendingTurn { text: "", images: &images, files: &[] }).unwrap();
        let parts = parts_of(&msgs[0]);
        assert_eq!(parts[0], ContentPart::Text { text: String::new() });
        assert_eq!(parts[1], ContentPart::Image { image: images[0].clone() });
        assert_eq!(parts[2], ContentPart::Image { image: images[1].clone() });
    }

    #[test]
    fn pdf_becomes_trailing_file_block() {
        let files = vec![file("a.pdf", PDF_MEDIA_TYPE, "JVBERi0xLjQ=")];
        let images = vec!["data:image/jpeg;base64,/9j/".to_string()];
        let msgs = build_messages(&[], PendingTurn { text: "Hi", images: &images, files: &files }).unwrap();
        let parts = parts_of(&msgs[0]);
        assert_eq!(parts[0], ContentPart::Text { text: "Hi".into() });
        assert_eq!(
            parts.last().unwrap(),
            &ContentPart::File {
                data: "JVBERi0xLjQ=".into(),
                media_type: PDF_MEDIA_TYPE.into()
            }
        );
    }

    #[test]
    fn rejects_unhandled_file_types() {
        let files = vec![file(
            "memo.docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "UEs=",
        )];
        let err = build_messages(&[], PendingTurn { text: "x", images: &[], files: &files }).unwrap_err();
        assert!(matches!(err, ChatError::Validation(msg) if msg.contains("memo.docx")));
    }

    #[test]
    fn undecodable_text_file_yields_marker() {
        assert_eq!(extract_text("not base64!!"), EXTRACTION_FAILED);
    }

    #[test]
    fn text_payloads_decode_without_padding_or_with_line_breaks() {
        assert_eq!(extract_text("aGVsbG8"), "hello");
        assert_eq!(
            extract_text("aGVsbG8gd29ybGQs\nIHRoaXMgaXMgYSB0\r\nZXh0IGZpbGU="),
            "hello world, this is a text file"
        );
        assert_eq!(extract_text("data:text/plain;base64,aGk"), "hi");
    }

    #[test]
    fn data_url_helpers() {
        assert_eq!(strip_data_url("data:text/plain;base64,aGk="), "aGk=");
        assert_eq!(strip_data_url("aGk="), "aGk=");
        assert_eq!(data_url_media_type("data:image/webp;base64,xx"), Some("image/webp"));
        assert_eq!(data_url_media_type("xx"), None);
        assert_eq!(sniff_image_mime("iVBOR"), "image/jpeg");
    }

    #[test]
    fn annotation_lists_each_file() {
        let files = vec![file("a.pdf", PDF_MEDIA_TYPE, "")];
        assert_eq!(
            annotate_attachments("Hi", &files),
            "Hi\n\n[Attached files:]\n- a.pdf (application/pdf)\n"
        );
        assert_eq!(annotate_attachments("Hi", &[]), "Hi");
    }

    #[test]
    fn parse_reports_missing_fields_in_order() {
        let err = ChatRequest::parse(br#"{"messages":[],"model":"m","provider":"openai"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Messages are required");

        let err = ChatRequest::parse(br#"{"messages":[{"role":"user","content":"x"}],"provider":"openai"}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "Model and provider are required");

        let err = ChatRequest::parse(
            br#"{"messages":[{"role":"user","content":"x"}],"model":"m","provider":"mistral"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::UnsupportedProvider(p) if p == "mistral"));

        let err = ChatRequest::parse(b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("Invalid request body"));
    }

    #[test]
    fn files_attach_to_trailing_user_message_only() {
        let body = br#"{
            "messages": [
                {"role": "user", "content": "first", "images": ["ignored"]},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "Hi", "images": ["data:image/png;base64,AA"]}
            ],
            "model": "gpt-4o-mini",
            "provider": "openai",
            "files": [{"name": "a.pdf", "type": "application/pdf", "data": "JVBE"}]
        }"#;
        let request = ChatRequest::parse(body).unwrap();
        let msgs = request.provider_messages().unwrap();
        assert_eq!(msgs[0], ProviderMessage::text(Role::User, "first"));
        let parts = parts_of(&msgs[2]);
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[1], ContentPart::Image { .. }));
        assert!(matches!(parts[2], ContentPart::File { .. }));
    }

    #[test]
    fn serializes_blocks_with_type_tags() {
        let part = ContentPart::File {
            data: "x".into(),
            media_type: PDF_MEDIA_TYPE.into(),
        };
        assert_eq!(
            serde_json::to_value(&part).unwrap(),
            serde_json::json!({"type": "file", "data": "x", "mediaType": "application/pdf"})
        );
    }
}
