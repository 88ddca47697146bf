use crate::config::{Credentials, Endpoints};
use crate::error::ChatError;
use crate::models::{Provider, Role};
use crate::request::{
    data_url_media_type, sniff_image_mime, strip_data_url, ContentPart, MessageContent,
    ProviderMessage, PDF_MEDIA_TYPE,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

// Lazy, finite, non-restartable sequence of text increments.
// Dropping it stops consumption.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

// Trait defining the interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    // Returns a stream of content deltas.
    async fn send_chat_stream_request(
        &self,
        model: &str,
        api_key: &str,
        messages: &[ProviderMessage],
    ) -> Result<DeltaStream>;
}

/// A provider backend bound to a model id and credential.
#[derive(Clone)]
pub struct ModelHandle {
    pub provider: Provider,
    pub model: String,
    api_key: String,
    backend: Arc<dyn LLMApiProvider>,
}

impl ModelHandle {
    pub async fn stream(&self, messages: &[ProviderMessage]) -> Result<DeltaStream, ChatError> {
        log::info!(
            "Streaming with model: {} ({}), {} message(s)",
            self.model,
            self.provider,
            messages.len()
        );
        let stream = self
            .backend
            .send_chat_stream_request(&self.model, &self.api_key, messages)
            .await?;
        Ok(stream)
    }
}

/// Maps provider ids to backends and checks credentials before any network
/// call. Model ids are not checked against the catalog.
#[derive(Clone)]
pub struct ProviderRegistry {
    credentials: Credentials,
    openai: Arc<dyn LLMApiProvider>,
    google: Arc<dyn LLMApiProvider>,
}

impl ProviderRegistry {
    pub fn new(credentials: Credentials, endpoints: &Endpoints) -> Self {
        let client = Client::new();
        Self {
            credentials,
            openai: Arc::new(OpenAIProvider::new(client.clone(), &endpoints.openai_base_url)),
            google: Arc::new(GoogleProvider::new(client, &endpoints.google_base_url)),
        }
    }

    pub fn with_backends(
        credentials: Credentials,
        openai: Arc<dyn LLMApiProvider>,
        google: Arc<dyn LLMApiProvider>,
    ) -> Self {
        Self {
            credentials,
            openai,
            google,
        }
    }

    pub fn resolve(&self, provider: Provider, model: &str) -> Result<ModelHandle, ChatError> {
        let api_key = self.credentials.api_key(provider)?.to_string();
        let backend = match provider {
            Provider::OpenAI => self.openai.clone(),
            Provider::Google => self.google.clone(),
        };
        Ok(ModelHandle {
            provider,
            model: model.to_string(),
            api_key,
            backend,
        })
    }

    /// Like `resolve`, for a provider id taken off the wire.
    pub fn resolve_named(&self, provider: &str, model: &str) -> Result<ModelHandle, ChatError> {
        let provider: Provider = provider
            .parse()
            .map_err(|_| ChatError::UnsupportedProvider(provider.to_string()))?;
        self.resolve(provider, model)
    }
}

async fn ensure_success(response: reqwest::Response, provider: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_body = response
        .text()
        .await
        .unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("{} stream request failed with status {}: {}", provider, status, error_body);
    Err(anyhow::anyhow!(
        "{} API stream request failed with status {}: {}",
        provider,
        status,
        error_body
    ))
}

// --- OpenAI Provider Implementation ---

#[derive(Serialize, Debug)]
struct OpenAIRequestBody {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct OpenAIMessage {
    role: &'static str,
    content: OpenAIContent,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIPart>),
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIPart {
    Text { text: String },
    ImageUrl { image_url: OpenAIImageUrl },
    File { file: OpenAIFile },
}

#[derive(Serialize, Debug)]
struct OpenAIImageUrl {
    url: String,
}

#[derive(Serialize, Debug)]
struct OpenAIFile {
    filename: String,
    file_data: String,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

fn to_data_url(data: &str, media_type: &str) -> String {
    if data.starts_with("data:") {
        data.to_string()
    } else {
        format!("data:{};base64,{}", media_type, data)
    }
}

fn openai_message(msg: &ProviderMessage) -> OpenAIMessage {
    let content = match &msg.content {
        MessageContent::Text(text) => OpenAIContent::Text(text.clone()),
        MessageContent::Parts(parts) => {
            let mut file_index = 0;
            OpenAIContent::Parts(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => OpenAIPart::Text { text: text.clone() },
                        ContentPart::Image { image } => {
                            let url = if image.starts_with("http://") || image.starts_with("https://") {
                                image.clone()
                            } else {
                                to_data_url(image, sniff_image_mime(image))
                            };
                            OpenAIPart::ImageUrl {
                                image_url: OpenAIImageUrl { url },
                            }
                        }
                        ContentPart::File { data, media_type } => {
                            file_index += 1;
                            let extension = if media_type == PDF_MEDIA_TYPE { "pdf" } else { "bin" };
                            OpenAIPart::File {
                                file: OpenAIFile {
                                    filename: format!("attachment-{}.{}", file_index, extension),
                                    file_data: format!(
                                        "data:{};base64,{}",
                                        media_type,
                                        strip_data_url(data)
                                    ),
                                },
                            }
                        }
                    })
                    .collect(),
            )
        }
    };
    OpenAIMessage {
        role: msg.role.as_str(),
        content,
    }
}

// One SSE data payload -> optional content delta
fn parse_openai_event(event_data: &str) -> Result<Option<String>> {
    let event_data = event_data.trim();
    if event_data == "[DONE]" {
        log::info!("Stream finished with [DONE]");
        return Ok(None);
    }

    match serde_json::from_str::<OpenAIStreamChunk>(event_data) {
        Ok(chunk) => Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)),
        Err(e) => match serde_json::from_str::<serde_json::Value>(event_data) {
            Ok(json_value) if json_value.get("type").and_then(|t| t.as_str()) == Some("ping") => {
                log::debug!("Received stream ping event, skipping.");
                Ok(None)
            }
            Ok(json_value) => {
                let message = json_value
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_owned);
                log::warn!("Unexpected stream chunk: {} - Data: {}", e, event_data);
                match message {
                    Some(message) => Err(anyhow::anyhow!("OpenAI stream error: {}", message)),
                    None => Err(anyhow::Error::from(e)
                        .context(format!("Parsed as JSON but not a valid stream chunk: {}", event_data))),
                }
            }
            Err(_) => Err(anyhow::Error::from(e)
                .context(format!("Failed to parse stream chunk as JSON: {}", event_data))),
        },
    }
}

pub struct OpenAIProvider {
    client: Client,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LLMApiProvider for OpenAIProvider {
    async fn send_chat_stream_request(
        &self,
        model: &str,
        api_key: &str,
        messages: &[ProviderMessage],
    ) -> Result<DeltaStream> {
        let request_body = OpenAIRequestBody {
            model: model.to_string(),
            messages: messages.iter().map(openai_message).collect(),
            stream: true,
        };
        let request_url = format!("{}/chat/completions", self.base_url);
        log::info!("Sending STREAM request to {} using model: {}", request_url, model);

        let response = self
            .client
            .post(&request_url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send stream request to OpenAI API")?;
        let response = ensure_success(response, "OpenAI").await?;

        let delta_stream = response
            .bytes_stream()
            .eventsource()
            .map(|event_result| -> Result<Option<String>> {
                let event = event_result.context("Error reading stream event")?;
                parse_openai_event(&event.data)
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => {
                        log::error!("Error processing stream chunk: {:?}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(delta_stream))
    }
}

// --- Google (Gemini) Provider Implementation ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
}

#[derive(Serialize, Debug)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiBlob,
    },
    FileData {
        #[serde(rename = "fileData")]
        file_data: GeminiFileRef,
    },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiFileRef {
    mime_type: String,
    file_uri: String,
}

#[derive(Deserialize, Debug)]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    error: Option<GeminiError>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Deserialize, Debug)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize, Debug)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: Option<String>,
    status: Option<String>,
}

fn gemini_parts(content: &MessageContent) -> Vec<GeminiPart> {
    match content {
        MessageContent::Text(text) => vec![GeminiPart::Text { text: text.clone() }],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => GeminiPart::Text { text: text.clone() },
                ContentPart::Image { image }
                    if image.starts_with("http://") || image.starts_with("https://") =>
                {
                    GeminiPart::FileData {
                        file_data: GeminiFileRef {
                            mime_type: sniff_image_mime(image).to_string(),
                            file_uri: image.clone(),
                        },
                    }
                }
                ContentPart::Image { image } => GeminiPart::InlineData {
                    inline_data: GeminiBlob {
                        mime_type: data_url_media_type(image)
                            .unwrap_or_else(|| sniff_image_mime(image))
                            .to_string(),
                        data: strip_data_url(image).to_string(),
                    },
                },
                ContentPart::File { data, media_type } => GeminiPart::InlineData {
                    inline_data: GeminiBlob {
                        mime_type: media_type.clone(),
                        data: strip_data_url(data).to_string(),
                    },
                },
            })
            .collect(),
    }
}

fn gemini_request(messages: &[ProviderMessage]) -> GenerateContentRequest {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.extend(gemini_parts(&msg.content)),
            Role::User => contents.push(GeminiContent {
                role: Some("user"),
                parts: gemini_parts(&msg.content),
            }),
            Role::Assistant => contents.push(GeminiContent {
                role: Some("model"),
                parts: gemini_parts(&msg.content),
            }),
        }
    }
    GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system_parts,
        }),
    }
}

fn parse_gemini_event(event_data: &str) -> Result<Option<String>> {
    let chunk: GeminiStreamChunk = serde_json::from_str(event_data.trim())
        .with_context(|| format!("Failed to parse Gemini stream chunk: {}", event_data))?;

    if let Some(error) = chunk.error {
        return Err(anyhow::anyhow!(
            "Gemini stream error{}: {}",
            error.status.map(|s| format!(" ({})", s)).unwrap_or_default(),
            error.message.unwrap_or_else(|| "unknown error".to_string())
        ));
    }

    let text: String = chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    Ok((!text.is_empty()).then_some(text))
}

pub struct GoogleProvider {
    client: Client,
    base_url: String,
}

impl GoogleProvider {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LLMApiProvider for GoogleProvider {
    async fn send_chat_stream_request(
        &self,
        model: &str,
        api_key: &str,
        messages: &[ProviderMessage],
    ) -> Result<DeltaStream> {
        let request_body = gemini_request(messages);
        let request_url = format!("{}/models/{}:streamGenerateContent", self.base_url, model);
        log::info!("Sending STREAM request to {} using model: {}", request_url, model);

        let response = self
            .client
            .post(&request_url)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", api_key)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send stream request to Gemini API")?;
        let response = ensure_success(response, "Gemini").await?;

        let delta_stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event_result| async move {
                let parsed = event_result
                    .context("Error reading stream event")
                    .and_then(|event| parse_gemini_event(&event.data));
                match parsed {
                    Ok(Some(text)) => Some(Ok(text)),
                    Ok(None) => None,
                    Err(e) => {
                        log::error!("Error processing Gemini stream chunk: {:?}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(delta_stream))
    }
}
