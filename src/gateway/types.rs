//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage tracking and debugging.
///
/// Every request through the gateway carries attribution so we know:
/// - Which tenant the request was made on behalf of
/// - Which pipeline session it belongs to
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Tenant whose question triggered the call.
    pub tenant_id: Option<String>,
    /// Pipeline session this request is part of.
    pub session_id: Option<Uuid>,
    /// Which code path made this call, for debugging.
    /// Use a static string like "pipeline::analyst" or "retriever::embed".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Embedding model to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbedModel {
    /// OpenAI text-embedding-3-large (3072 dimensions)
    #[serde(rename = "text-embedding-3-large")]
    OpenAI3Large,
    /// OpenAI text-embedding-3-small (1536 dimensions)
    #[default]
    #[serde(rename = "text-embedding-3-small")]
    OpenAI3Small,
}

impl EmbedModel {
    /// Model id as routed through OpenRouter.
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedModel::OpenAI3Large => "openai/text-embedding-3-large",
            EmbedModel::OpenAI3Small => "openai/text-embedding-3-small",
        }
    }

    pub fn dimensions(&self) -> usize {
        match self {
            EmbedModel::OpenAI3Large => 3072,
            EmbedModel::OpenAI3Small => 1536,
        }
    }
}

/// Request to embed texts.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    /// Model to use for embedding.
    pub model: EmbedModel,
    /// Texts to embed. Each text produces one embedding vector.
    pub texts: Vec<String>,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(model: EmbedModel, texts: Vec<String>, attribution: Attribution) -> Self {
        Self {
            model,
            texts,
            attribution,
        }
    }

    /// Single text convenience constructor.
    pub fn single(model: EmbedModel, text: impl Into<String>, attribution: Attribution) -> Self {
        Self::new(model, vec![text.into()], attribution)
    }
}

/// Response from embedding request.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    /// Embedding vectors, one per input text.
    pub embeddings: Vec<Vec<f32>>,
    /// Total tokens consumed.
    pub tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Binary or text content attached to a user message.
///
/// Binary parts are encoded as base64 data URLs by the adapter.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        data: Vec<u8>,
    },
    Video {
        mime_type: String,
        data: Vec<u8>,
    },
    File {
        filename: String,
        mime_type: String,
        data: Vec<u8>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Approximate size used for request-size guards.
    pub fn approx_len(&self) -> usize {
        match self {
            ContentPart::Text { text } => text.len(),
            ContentPart::Image { data, .. }
            | ContentPart::Video { data, .. }
            | ContentPart::File { data, .. } => data.len(),
        }
    }
}

impl std::fmt::Debug for ContentPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentPart::Text { text } => f.debug_struct("Text").field("len", &text.len()).finish(),
            ContentPart::Image { mime_type, data } => f
                .debug_struct("Image")
                .field("mime_type", mime_type)
                .field("bytes", &data.len())
                .finish(),
            ContentPart::Video { mime_type, data } => f
                .debug_struct("Video")
                .field("mime_type", mime_type)
                .field("bytes", &data.len())
                .finish(),
            ContentPart::File {
                filename,
                mime_type,
                data,
            } => f
                .debug_struct("File")
                .field("filename", filename)
                .field("mime_type", mime_type)
                .field("bytes", &data.len())
                .finish(),
        }
    }
}

/// A chat message.
///
/// `parts` is empty for plain text messages; when present, the adapter sends
/// `content` as the leading text part followed by the parts in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            parts: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            parts: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            parts: Vec::new(),
        }
    }

    /// User message carrying attachments after the text.
    pub fn user_with_parts(content: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            parts,
        }
    }

    pub fn approx_len(&self) -> usize {
        self.content.len() + self.parts.iter().map(ContentPart::approx_len).sum::<usize>()
    }
}

/// Chat model specification.
#[derive(Debug, Clone)]
pub enum ChatModel {
    /// OpenRouter model, e.g. "google/gemini-2.5-flash"
    OpenRouter(String),
}

impl ChatModel {
    pub fn openrouter(model_id: impl Into<String>) -> Self {
        ChatModel::OpenRouter(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::OpenRouter(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::OpenRouter(_) => "openrouter",
        }
    }
}

/// JSON schema a structured completion must satisfy.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl ResponseSchema {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use.
    pub model: ChatModel,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Whether to request JSON output.
    pub json_mode: bool,
    /// Schema for structured output. Implies JSON mode.
    pub schema: Option<ResponseSchema>,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            json_mode: false,
            schema: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn schema(mut self, schema: ResponseSchema) -> Self {
        self.json_mode = true;
        self.schema = Some(schema);
        self
    }

    /// Whether any message carries binary parts.
    pub fn is_multimodal(&self) -> bool {
        self.messages.iter().any(|m| {
            m.parts
                .iter()
                .any(|p| !matches!(p, ContentPart::Text { .. }))
        })
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated content.
    pub content: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Convenience constructor for fakes and tests.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_implies_json_mode() {
        let req = ChatRequest::new(
            ChatModel::openrouter("test/model"),
            vec![Message::user("hi")],
            Attribution::new("test"),
        )
        .schema(ResponseSchema::new("answer", serde_json::json!({"type": "object"})));

        assert!(req.json_mode);
        assert_eq!(req.schema.as_ref().map(|s| s.name.as_str()), Some("answer"));
    }

    #[test]
    fn multimodal_detection_ignores_text_parts() {
        let text_only = ChatRequest::new(
            ChatModel::openrouter("test/model"),
            vec![Message::user_with_parts("hi", vec![ContentPart::text("more")])],
            Attribution::new("test"),
        );
        assert!(!text_only.is_multimodal());

        let with_image = ChatRequest::new(
            ChatModel::openrouter("test/model"),
            vec![Message::user_with_parts(
                "what is this?",
                vec![ContentPart::Image {
                    mime_type: "image/png".into(),
                    data: vec![1, 2, 3],
                }],
            )],
            Attribution::new("test"),
        );
        assert!(with_image.is_multimodal());
        assert_eq!(with_image.messages[0].approx_len(), "what is this?".len() + 3);
    }

    #[test]
    fn content_part_debug_hides_bytes() {
        let part = ContentPart::File {
            filename: "a.pdf".into(),
            mime_type: "application/pdf".into(),
            data: vec![0; 2048],
        };
        let rendered = format!("{part:?}");
        assert!(rendered.contains("2048"));
        assert!(!rendered.contains("0, 0"));
    }
}
