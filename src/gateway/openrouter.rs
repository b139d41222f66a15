//! OpenRouter adapter for chat completions and embeddings.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Raw backend calls, without retries or usage accounting.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

// =============================================================================
// OPENROUTER ADAPTER
// =============================================================================

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

/// Maximum allowed binary payload across all attachments of one request.
const MAX_BINARY_BYTES: usize = 64 * 1_024 * 1_024;

/// Fallback when a 429 carries no Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter API adapter.
#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenRouterAdapter {
    /// Create from API key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(120), None, None)
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;

        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        let referer = std::env::var("OPENROUTER_REFERER").ok();
        let app_title = std::env::var("OPENROUTER_APP_TITLE").ok();

        Self::with_config(api_key, base_url, timeout, referer, app_title)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        if let Some(ref r) = referer {
            if let Ok(v) = HeaderValue::from_str(r) {
                headers.insert("HTTP-Referer", v);
            }
        }

        if let Some(ref t) = app_title {
            if let Ok(v) = HeaderValue::from_str(t) {
                headers.insert("X-Title", v);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn extract_retry_after(headers: &HeaderMap) -> Duration {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }

    /// Check if message indicates a refusal.
    fn is_refusal(msg: &str) -> bool {
        let l = msg.trim_start().to_lowercase();
        let first_line = l.lines().next().unwrap_or("");

        const PREFIXES: &[&str] = &[
            "refus",
            "i cannot",
            "i can't",
            "i won't",
            "i will not",
            "i am unable to",
            "i'm unable to",
            "unable to comply",
            "unable to assist",
            "unable to help",
            "unable to provide",
        ];

        PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
    }

    /// Read the body while enforcing the response size limit.
    async fn read_body(mut response: reqwest::Response) -> Result<String, ProviderError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    "openrouter",
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Map a non-2xx response into a typed error.
    fn status_error(
        status: reqwest::StatusCode,
        headers: &HeaderMap,
        body: &str,
        ctx: ErrorContext,
    ) -> ProviderError {
        let parsed = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|e| e.error);
        let (message, ctx) = match parsed {
            Some(error) => {
                let ctx = match error.code {
                    Some(serde_json::Value::String(code)) => ctx.with_code(code),
                    Some(code) => ctx.with_code(code.to_string()),
                    None => ctx,
                };
                (error.message.unwrap_or_default(), ctx)
            }
            None => (format!("HTTP {}", status.as_u16()), ctx),
        };

        match status.as_u16() {
            429 => ProviderError::rate_limited_remote(Self::extract_retry_after(headers), ctx),
            400 | 413 | 422 => ProviderError::InvalidRequest {
                message,
                context: Some(ctx),
            },
            code => ProviderError::Provider {
                provider: "openrouter",
                message,
                retryable: code >= 500,
                context: Some(ctx),
            },
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiPart {
    Text { text: String },
    ImageUrl { image_url: ApiUrl },
    VideoUrl { video_url: ApiUrl },
    File { file: ApiFile },
}

#[derive(Serialize)]
struct ApiUrl {
    url: String,
}

#[derive(Serialize)]
struct ApiFile {
    filename: String,
    file_data: String,
}

fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(data))
}

impl From<&ContentPart> for ApiPart {
    fn from(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => ApiPart::Text { text: text.clone() },
            ContentPart::Image { mime_type, data } => ApiPart::ImageUrl {
                image_url: ApiUrl {
                    url: data_url(mime_type, data),
                },
            },
            ContentPart::Video { mime_type, data } => ApiPart::VideoUrl {
                video_url: ApiUrl {
                    url: data_url(mime_type, data),
                },
            },
            ContentPart::File {
                filename,
                mime_type,
                data,
            } => ApiPart::File {
                file: ApiFile {
                    filename: filename.clone(),
                    file_data: data_url(mime_type, data),
                },
            },
        }
    }
}

impl From<&Message> for ApiMessage {
    fn from(m: &Message) -> Self {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = if m.parts.is_empty() {
            ApiContent::Text(m.content.clone())
        } else {
            let mut parts = Vec::with_capacity(m.parts.len() + 1);
            if !m.content.is_empty() {
                parts.push(ApiPart::Text {
                    text: m.content.clone(),
                });
            }
            parts.extend(m.parts.iter().map(ApiPart::from));
            ApiContent::Parts(parts)
        };
        Self { role, content }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaFormat>,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

impl ResponseFormat {
    fn for_request(req: &ChatRequest) -> Option<Self> {
        match (&req.schema, req.json_mode) {
            (Some(schema), _) => Some(Self {
                format_type: "json_schema",
                json_schema: Some(JsonSchemaFormat {
                    name: schema.name.clone(),
                    schema: schema.schema.clone(),
                    strict: false,
                }),
            }),
            (None, true) => Some(Self {
                format_type: "json_object",
                json_schema: None,
            }),
            (None, false) => None,
        }
    }
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: Option<ToolFunction>,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct EmbedApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    data: Option<Vec<EmbeddingRow>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

// =============================================================================
// BACKEND IMPL
// =============================================================================

#[async_trait]
impl ProviderBackend for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let text_chars: usize = req
            .messages
            .iter()
            .map(|m| {
                m.content.len()
                    + m.parts
                        .iter()
                        .filter(|p| matches!(p, ContentPart::Text { .. }))
                        .map(ContentPart::approx_len)
                        .sum::<usize>()
            })
            .sum();
        if text_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {text_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let binary_bytes: usize = req
            .messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter(|p| !matches!(p, ContentPart::Text { .. }))
            .map(ContentPart::approx_len)
            .sum();
        if binary_bytes > MAX_BINARY_BYTES {
            return Err(ProviderError::invalid_request(format!(
                "Attachments too large: {binary_bytes} bytes (max {MAX_BINARY_BYTES})"
            )));
        }

        let start = Instant::now();

        let messages: Vec<ApiMessage> = req.messages.iter().map(ApiMessage::from).collect();

        let api_req = ChatApiRequest {
            model: req.model.model_id(),
            messages: &messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: ResponseFormat::for_request(req),
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let request_id = Self::extract_request_id(&headers);
        let body = Self::read_body(response).await?;

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            return Err(Self::status_error(status, &headers, &body, ctx));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("openrouter", format!("Invalid JSON: {e}"), false)
        })?;

        // Check for API-level error
        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if Self::is_refusal(&message) {
                return Err(ProviderError::refused(message));
            }
            return Err(ProviderError::provider("openrouter", message, false));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ProviderError::provider("openrouter", "No choices in response", false)
            })?;

        let content = choice
            .message
            .map(|m| {
                let content = m.content.unwrap_or_default();
                if !content.trim().is_empty() {
                    return content;
                }

                // Some models emit structured output via tool calls even when a
                // response_format is requested. Fall back to tool call args.
                m.tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tc| tc.function.and_then(|f| f.arguments))
                    .find(|s| !s.trim().is_empty())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        if Self::is_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| {
                (
                    u.prompt_tokens.unwrap_or(0),
                    u.completion_tokens.unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }

    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if req.texts.is_empty() {
            return Err(ProviderError::invalid_request("No texts to embed"));
        }
        let total_chars: usize = req.texts.iter().map(String::len).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();
        let response = self
            .client
            .post(self.embeddings_url())
            .json(&EmbedApiRequest {
                model: req.model.as_str(),
                input: &req.texts,
            })
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let request_id = Self::extract_request_id(&headers);
        let body = Self::read_body(response).await?;

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            return Err(Self::status_error(status, &headers, &body, ctx));
        }

        let parsed: EmbedApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("openrouter", format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::provider(
                "openrouter",
                error.message.unwrap_or_default(),
                false,
            ));
        }

        let mut rows = parsed.data.unwrap_or_default();
        if rows.len() != req.texts.len() {
            return Err(ProviderError::provider(
                "openrouter",
                format!(
                    "Expected {} embeddings, got {}",
                    req.texts.len(),
                    rows.len()
                ),
                false,
            ));
        }
        rows.sort_by_key(|r| r.index);

        let expected_dims = req.model.dimensions();
        if let Some(row) = rows.iter().find(|r| r.embedding.len() != expected_dims) {
            return Err(ProviderError::provider(
                "openrouter",
                format!(
                    "Embedding dimension mismatch: expected {expected_dims}, got {}",
                    row.embedding.len()
                ),
                false,
            ));
        }

        Ok(EmbedResponse {
            embeddings: rows.into_iter().map(|r| r.embedding).collect(),
            tokens: parsed.usage.and_then(|u| u.prompt_tokens).unwrap_or(0),
            latency: start.elapsed(),
        })
    }
}
