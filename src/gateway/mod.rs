//! Capability provider gateway: chat completions and embeddings via OpenRouter.

pub mod error;
pub mod openrouter;
pub mod structured;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use openrouter::{OpenRouterAdapter, ProviderBackend};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError, RateLimitSource};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// Text generation and embedding capabilities consumed by the pipeline.
///
/// Rate limits surface as [`ProviderError::RateLimited`]; each pipeline stage
/// decides its own backoff policy for them.
#[async_trait::async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries for transient failures (timeouts, 5xx, connect errors).
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait, B: ProviderBackend = OpenRouterAdapter> {
    backend: B,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait, B: ProviderBackend> CapabilityProvider for ProviderGateway<U, B> {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U, OpenRouterAdapter> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self {
            backend: openrouter,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }
}

impl<U: UsageSinkTrait, B: ProviderBackend> ProviderGateway<U, B> {
    pub fn with_config(backend: B, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            backend,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            match self.backend.chat(&req).await {
                Ok(resp) => {
                    let record = self
                        .base_record("chat/completions", req.model.model_id(), &req.attribution)
                        .tokens(resp.input_tokens, resp.output_tokens)
                        .attempt(attempt)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self
                        .base_record("chat/completions", req.model.model_id(), &req.attribution)
                        .attempt(attempt)
                        .latency(started.elapsed().as_millis() as u64)
                        .error(err.code());
                    self.usage_sink.record(record).await;

                    if !err.is_transient() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    tracing::debug!(
                        caller = req.attribution.caller,
                        attempt,
                        error = %err,
                        "transient chat failure; retrying"
                    );
                    sleep(backoff_delay(self.config.retry_base_delay, attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            match self.backend.embed(&req).await {
                Ok(resp) => {
                    let record = self
                        .base_record("embeddings", req.model.as_str(), &req.attribution)
                        .tokens(resp.tokens, 0)
                        .attempt(attempt)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self
                        .base_record("embeddings", req.model.as_str(), &req.attribution)
                        .attempt(attempt)
                        .latency(started.elapsed().as_millis() as u64)
                        .error(err.code());
                    self.usage_sink.record(record).await;

                    if !err.is_transient() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    sleep(backoff_delay(self.config.retry_base_delay, attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn base_record(
        &self,
        endpoint: &'static str,
        model: &str,
        attribution: &Attribution,
    ) -> ProviderCallRecord {
        ProviderCallRecord::new("openrouter", endpoint, model, attribution.caller)
            .tenant(attribution.tenant_id.clone())
            .session(attribution.session_id)
    }
}

/// Exponential backoff: `base * 2^attempt`, exponent capped at 5.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyBackend {
        failures: AtomicU32,
        error: fn() -> ProviderError,
    }

    #[async_trait::async_trait]
    impl ProviderBackend for FlakyBackend {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(ChatResponse::text("ok"))
        }

        async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
            Ok(EmbedResponse {
                embeddings: req.texts.iter().map(|_| vec![0.0; 4]).collect(),
                tokens: 1,
                latency: Duration::from_millis(1),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ProviderCallRecord>>);

    #[async_trait::async_trait]
    impl UsageSinkTrait for RecordingSink {
        async fn record(&self, record: ProviderCallRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn chat_req() -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter("test/model"),
            vec![Message::user("hi")],
            Attribution::new("test").with_tenant("acme"),
        )
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_recorded() {
        let sink = Arc::new(RecordingSink::default());
        let gateway = ProviderGateway::with_config(
            FlakyBackend {
                failures: AtomicU32::new(2),
                error: || ProviderError::provider("openrouter", "HTTP 503", true),
            },
            sink.clone(),
            fast_config(),
        );

        let resp = gateway.chat(chat_req()).await.unwrap();
        assert_eq!(resp.content, "ok");

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].error_code.as_deref(), Some("provider_error"));
        assert_eq!(records[2].attempt, 2);
        assert_eq!(records[2].tenant_id.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn rate_limits_are_surfaced_without_retry() {
        let sink = Arc::new(RecordingSink::default());
        let gateway = ProviderGateway::with_config(
            FlakyBackend {
                failures: AtomicU32::new(1),
                error: || ProviderError::rate_limited_local(Duration::from_secs(1)),
            },
            sink.clone(),
            fast_config(),
        );

        let err = gateway.chat(chat_req()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }
}
