//! External call gate.
//!
//! Every outbound call to an external provider goes through [`CallGate`],
//! which applies, per provider: a token bucket (requests/second), a
//! concurrency semaphore (max in-flight), a per-attempt timeout, and
//! exponential backoff with full jitter on transient failures. Callers
//! never reimplement retry; a single central gate per provider keeps
//! retry storms bounded.
//!
//! Requests to different providers never serialize against each other.

pub mod error;

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use error::{CallError, GateError, GateResult};

type ProviderRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Retry and throttling policy for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Token-bucket refill rate, requests per second
    pub rps: u32,
    /// Maximum in-flight requests
    pub max_in_flight: usize,
    /// Per-attempt timeout
    pub per_attempt_timeout: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Status codes treated as transient
    pub retriable_statuses: Vec<u16>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            rps: 5,
            max_in_flight: 4,
            per_attempt_timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            retriable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl ProviderConfig {
    /// Backoff ceiling for a given attempt number (1-based).
    fn delay_cap(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }

    fn is_retriable(&self, error: &CallError) -> bool {
        match error {
            CallError::Transient(_) => true,
            CallError::Permanent(_) => false,
            CallError::Status { code, .. } => self.retriable_statuses.contains(code),
        }
    }
}

struct ProviderState {
    config: ProviderConfig,
    limiter: ProviderRateLimiter,
    semaphore: Semaphore,
}

impl ProviderState {
    fn new(config: ProviderConfig) -> Self {
        let rps = NonZeroU32::new(config.rps.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rps)),
            semaphore: Semaphore::new(config.max_in_flight.max(1)),
            config,
        }
    }
}

/// Central gate wrapping all outbound provider calls.
pub struct CallGate {
    providers: HashMap<String, ProviderState>,
}

impl CallGate {
    /// Build a gate from per-provider configs.
    pub fn new(configs: HashMap<String, ProviderConfig>) -> Self {
        Self {
            providers: configs
                .into_iter()
                .map(|(id, config)| (id, ProviderState::new(config)))
                .collect(),
        }
    }

    /// Provider ids known to this gate.
    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Run `op` against `provider_id` under the provider's policy.
    ///
    /// Transient failures (including per-attempt timeouts) are retried up
    /// to `max_attempts` with full-jitter backoff; permanent failures and
    /// non-retriable statuses surface immediately. The cancellation token
    /// is observed at every suspension point.
    pub async fn call<T, F, Fut>(
        &self,
        provider_id: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> GateResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let state = self
            .providers
            .get(provider_id)
            .ok_or_else(|| GateError::UnknownProvider(provider_id.to_string()))?;
        let config = &state.config;

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Err(GateError::Cancelled);
            }

            // Token-bucket admission.
            tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                _ = state.limiter.until_ready() => {}
            }

            // In-flight cap. Held for the duration of the attempt only.
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                permit = state.semaphore.acquire() => permit
                    .map_err(|_| GateError::internal("provider semaphore closed"))?,
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                result = tokio::time::timeout(config.per_attempt_timeout, op()) => result,
            };
            drop(permit);

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => CallError::transient(format!(
                    "attempt timed out after {:?}",
                    config.per_attempt_timeout
                )),
            };

            if !config.is_retriable(&error) {
                warn!(provider = provider_id, error = %error, "Permanent provider failure");
                return Err(GateError::Permanent {
                    provider: provider_id.to_string(),
                    source: error,
                });
            }

            if attempt >= config.max_attempts {
                warn!(
                    provider = provider_id,
                    attempts = attempt,
                    error = %error,
                    "Provider retries exhausted"
                );
                return Err(GateError::Exhausted {
                    provider: provider_id.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            // Full jitter: sleep a uniform amount of the backoff ceiling.
            let cap = config.delay_cap(attempt);
            let delay = {
                let mut rng = rand::rng();
                Duration::from_millis(rand::Rng::random_range(
                    &mut rng,
                    0..=cap.as_millis() as u64,
                ))
            };
            debug!(
                provider = provider_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient provider failure, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
