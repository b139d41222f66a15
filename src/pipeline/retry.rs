//! Rate-limit retries and per-call timeouts for stages that call a provider.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use super::error::PipelineError;
use super::types::StageName;
use crate::config::PipelineConfig;
use crate::gateway::{backoff_delay, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound on each individual call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.provider.max_retries,
            base_delay: Duration::from_millis(config.provider.retry_base_delay_ms),
            call_timeout: config.call_timeout(),
        }
    }

    /// Run `op`, retrying rate-limit failures with exponential backoff.
    ///
    /// Exhausted rate limits become `QuotaExceeded`; a timeout or any other
    /// provider error becomes `Unhandled` immediately.
    pub async fn run<T, F, Fut>(&self, stage: StageName, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match timeout(self.call_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout(self.call_timeout, None)),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limited() => {
                    if attempt >= self.max_retries {
                        tracing::warn!(
                            stage = %stage,
                            attempts = attempt + 1,
                            "rate limit persisted through retries"
                        );
                        return Err(PipelineError::QuotaExceeded {
                            stage,
                            attempts: attempt + 1,
                        });
                    }
                    let delay = backoff_delay(self.base_delay, attempt);
                    tracing::debug!(
                        stage = %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited; backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(stage = %stage, error = %err, code = err.code(), "provider call failed");
                    return Err(PipelineError::from_provider(stage, &err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_rate_limit() {
        let calls = AtomicU32::new(0);
        let value = fast()
            .run(StageName::Analyst, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::rate_limited_local(Duration::from_secs(1)))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_is_quota_exceeded() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(StageName::Analyst, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::rate_limited_local(Duration::from_secs(1)))
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::QuotaExceeded {
                stage: StageName::Analyst,
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(StageName::Writer, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::invalid_request("bad"))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Unhandled {
                stage: StageName::Writer,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..fast()
        };
        let err = policy
            .run(StageName::Analyst, || async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, ProviderError>(())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }
}
