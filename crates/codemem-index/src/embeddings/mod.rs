//! Embedding provider trait and implementations.
//!
//! [`EmbeddingProvider`] is the raw provider interface. [`Embedder`] wraps a
//! provider with what the pipeline needs around every call: input
//! truncation, a per-call deadline, retry with exponential backoff for
//! transient failures, a bound on in-flight calls, a circuit breaker that
//! stops calling a provider that keeps failing, and usage accounting.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use codemem_config::EmbeddingConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Marker appended to inputs cut at `max_chars`.
pub const TRUNCATION_MARKER: &str = "\n...[TRUNCATED]";

/// Errors that can occur during embedding generation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Transient embedding failure: {0}")]
    Transient(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Embedding request rejected: {0}")]
    Permanent(String),

    #[error("Embedding call exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Embedding provider unavailable, calls resume in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
}

impl EmbeddingError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed multiple texts in a batch
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// OpenAI-compatible embeddings endpoint (`POST /v1/embeddings`).
pub struct OpenAiEmbeddings {
    api_key: String,
    model: String,
    dimensions: usize,
    client: Client,
    base_url: String,
}

impl OpenAiEmbeddings {
    /// Create a provider for `model` producing `dimensions`-sized vectors.
    pub fn new(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            api_key,
            model,
            dimensions,
            client: Client::new(),
            base_url: "https://api.openai.com/v1/embeddings".to_string(),
        }
    }

    /// Build from configuration; the API key may come from the environment.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            EmbeddingError::Permanent(format!(
                "no API key configured (set embedding.api_key or {})",
                codemem_config::API_KEY_ENV
            ))
        })?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EmbeddingError::Permanent(format!("HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            model: config.model.clone(),
            dimensions: config.dimensions,
            client,
            base_url: config.base_url.clone(),
        })
    }

    /// Set a custom base URL (useful for testing or proxies).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    async fn send_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        debug!(
            "Sending embedding request for {} texts to {}",
            texts.len(),
            self.base_url
        );

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Transient(format!("request timed out: {}", e))
                } else {
                    EmbeddingError::Transient(format!("network error: {}", e))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(EmbeddingError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("API error ({}): {}", status.as_u16(), body);
            return Err(if status.is_server_error() {
                EmbeddingError::Transient(message)
            } else {
                EmbeddingError::Permanent(message)
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Permanent(format!("invalid response: {}", e)))?;

        // Sort by index to ensure correct order
        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        if data.len() != texts.len() {
            return Err(EmbeddingError::Permanent(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        data.into_iter()
            .map(|d| {
                if d.embedding.len() == self.dimensions {
                    Ok(d.embedding)
                } else {
                    Err(EmbeddingError::Permanent(format!(
                        "expected {} dimensions, got {}",
                        self.dimensions,
                        d.embedding.len()
                    )))
                }
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.send_request(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Permanent("no embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.send_request(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Deadline and retry schedule for one embedding request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.backoff(),
            deadline: config.timeout(),
        }
    }

    /// Backoff before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Call and cost counters for one run.
#[derive(Debug, Default)]
pub struct EmbeddingUsage {
    calls: AtomicU64,
    failures: AtomicU64,
    chars: AtomicU64,
}

/// Point-in-time copy of [`EmbeddingUsage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub chars: u64,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl EmbeddingUsage {
    fn record_call(&self, chars: usize) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.chars.fetch_add(chars as u64, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Snapshot with a token estimate of chars / 4.
    pub fn snapshot(&self, price_per_million_tokens: f64) -> UsageSnapshot {
        let chars = self.chars.load(Ordering::Relaxed);
        let estimated_tokens = chars.div_ceil(4);
        UsageSnapshot {
            calls: self.calls(),
            failures: self.failures.load(Ordering::Relaxed),
            chars,
            estimated_tokens,
            estimated_cost_usd: estimated_tokens as f64 / 1_000_000.0 * price_per_million_tokens,
        }
    }
}

/// Stops calling a provider that keeps failing.
///
/// After `threshold` consecutive failed requests the breaker opens and
/// requests fail fast with [`EmbeddingError::CircuitOpen`]. Once `cooldown`
/// has passed a single trial request goes through: success closes the
/// breaker, failure keeps it open for another cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    opened_at: Option<Instant>,
    /// Start of the trial request while half-open
    trial_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.state().opened_at.is_some()
    }

    /// Let a request through, or say how long the breaker stays open.
    fn admit(&self) -> Result<(), EmbeddingError> {
        let mut state = self.state();
        let Some(opened_at) = state.opened_at else {
            return Ok(());
        };
        let waited = opened_at.elapsed();
        if waited < self.cooldown {
            return Err(EmbeddingError::CircuitOpen {
                retry_in: self.cooldown - waited,
            });
        }
        // an abandoned trial frees the slot after another cooldown
        if let Some(trial_at) = state.trial_at {
            if trial_at.elapsed() < self.cooldown {
                return Err(EmbeddingError::CircuitOpen {
                    retry_in: self.cooldown - trial_at.elapsed(),
                });
            }
        }
        state.trial_at = Some(Instant::now());
        info!("Embedding breaker half-open, sending a trial request");
        Ok(())
    }

    fn succeeded(&self) {
        let mut state = self.state();
        if state.opened_at.is_some() {
            info!("Embedding breaker closed");
        }
        *state = BreakerState::default();
    }

    fn failed(&self) {
        let mut state = self.state();
        state.failures += 1;
        state.trial_at = None;
        if state.opened_at.is_some() {
            state.opened_at = Some(Instant::now());
            warn!("Embedding trial request failed, breaker stays open");
        } else if state.failures >= self.threshold {
            state.opened_at = Some(Instant::now());
            error!(
                "Embedding breaker opened after {} consecutive failures",
                state.failures
            );
        }
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_input(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Owned(format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER)),
        None => Cow::Borrowed(text),
    }
}

/// Provider wrapper applying truncation, deadline, retry, concurrency
/// limiting and usage accounting.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
    max_chars: usize,
    permits: Arc<Semaphore>,
    /// Shared by every run using this provider
    breaker: Arc<CircuitBreaker>,
    usage: Arc<EmbeddingUsage>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            policy,
            max_chars: 24_000,
            permits: Arc::new(Semaphore::new(8)),
            breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
            usage: Arc::new(EmbeddingUsage::default()),
        }
    }

    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self::new(provider, RetryPolicy::from_config(config))
            .with_max_chars(config.max_chars)
            .with_concurrency(config.max_concurrency)
            .with_breaker(config.breaker_threshold, config.breaker_cooldown())
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(threshold, cooldown));
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Same provider, limits and breaker with fresh usage counters.
    pub fn for_run(&self) -> Self {
        Self {
            usage: Arc::new(EmbeddingUsage::default()),
            ..self.clone()
        }
    }

    pub fn usage(&self) -> &EmbeddingUsage {
        &self.usage
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Embed one text. A deadline expiry returns [`EmbeddingError::Timeout`]
    /// without retrying; transient errors are retried with backoff. While
    /// the breaker is open no call is made.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Err(err) = self.breaker.admit() {
            self.usage.record_failure();
            return Err(err);
        }
        let input = truncate_input(text, self.max_chars);
        let mut attempt = 0u32;
        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| EmbeddingError::Permanent("embedder closed".to_string()))?;
                self.usage.record_call(input.chars().count());
                tokio::time::timeout(self.policy.deadline, self.provider.embed(&input)).await
            };

            let err = match result {
                Ok(Ok(vector)) => {
                    self.breaker.succeeded();
                    return Ok(vector);
                }
                Ok(Err(err)) => err,
                Err(_) => EmbeddingError::Timeout(self.policy.deadline),
            };

            attempt += 1;
            if !err.is_transient() || attempt > self.policy.max_retries {
                self.usage.record_failure();
                match err {
                    // the provider answered; only this input is bad
                    EmbeddingError::Permanent(_) => self.breaker.succeeded(),
                    _ => self.breaker.failed(),
                }
                return Err(err);
            }

            let delay = match &err {
                EmbeddingError::RateLimited {
                    retry_after: Some(after),
                } => *after,
                _ => self.policy.delay(attempt),
            };
            warn!(
                "Embedding attempt {}/{} failed ({}), retrying in {:?}",
                attempt, self.policy.max_retries, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
