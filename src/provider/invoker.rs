//! Retrying provider invocation.
//!
//! Every provider call made by the engine goes through [`ProviderInvoker`],
//! which routes it to the right provider, retries transient failures with
//! bounded exponential backoff, and aborts promptly on cancellation.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ProviderError, ReconcileError, Result};

use super::registry::ProviderRegistry;
use super::traits::{Operation, ProviderResponse, ResourceRequest};

/// Upper bound on the backoff exponent.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Retry behaviour for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Builds the policy from the `engine` section of a stack file.
    #[must_use]
    pub const fn from_engine(engine: &EngineConfig) -> Self {
        Self::new(
            engine.max_attempts,
            Duration::from_millis(engine.base_delay_ms),
            Duration::from_millis(engine.max_delay_ms),
        )
    }

    /// Backoff before retry number `retries_used + 1`: `base * 2^n`, capped.
    #[must_use]
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let factor = 1_u32 << retries_used.min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next retry, honouring a provider-supplied retry-after.
    #[must_use]
    pub fn delay_for(&self, retries_used: u32, error: &ProviderError) -> Duration {
        error.retry_after_secs().map_or_else(
            || self.backoff(retries_used),
            |secs| Duration::from_secs(secs).min(self.max_delay),
        )
    }
}

/// Routes calls to providers and retries transient failures.
#[derive(Debug, Clone)]
pub struct ProviderInvoker {
    registry: ProviderRegistry,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ProviderInvoker {
    /// Creates an invoker with the default retry policy.
    #[must_use]
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that aborts in-flight calls and backoff sleeps.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The active retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns the provider's fatal error, or `MaxRetriesExceeded` once
    /// transient failures exhaust the retry budget.
    pub async fn create(&self, request: &ResourceRequest) -> Result<ProviderResponse> {
        let provider = self.registry.resolve(&request.type_token)?;
        self.call(Operation::Create, &request.name, || provider.create(request))
            .await
    }

    /// Reads a resource's live state.
    ///
    /// # Errors
    ///
    /// As for [`Self::create`].
    pub async fn read(&self, request: &ResourceRequest) -> Result<ProviderResponse> {
        let provider = self.registry.resolve(&request.type_token)?;
        self.call(Operation::Read, &request.name, || provider.read(request))
            .await
    }

    /// Updates a resource in place.
    ///
    /// # Errors
    ///
    /// As for [`Self::create`].
    pub async fn update(&self, request: &ResourceRequest) -> Result<ProviderResponse> {
        let provider = self.registry.resolve(&request.type_token)?;
        self.call(Operation::Update, &request.name, || provider.update(request))
            .await
    }

    /// Deletes a resource. A resource that is already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// As for [`Self::create`].
    pub async fn delete(&self, request: &ResourceRequest) -> Result<()> {
        let provider = self.registry.resolve(&request.type_token)?;
        let provider = provider.as_ref();
        self.call(Operation::Delete, &request.name, || async move {
            match provider.delete(request).await {
                Err(ProviderError::NotFound { id }) => {
                    info!("Resource {} ({id}) already absent", request.name);
                    Ok(())
                }
                other => other,
            }
        })
        .await
    }

    /// Calls a provider function.
    ///
    /// # Errors
    ///
    /// As for [`Self::create`].
    pub async fn invoke(&self, token: &str, args: &Value) -> Result<Value> {
        let provider = self.registry.resolve(token)?;
        self.call(Operation::Invoke, token, || provider.invoke(token, args))
            .await
    }

    async fn call<T, F, Fut>(&self, operation: Operation, target: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut retries_used = 0_u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ProviderError::Cancelled.into());
            }

            debug!("{operation} {target} (attempt {})", retries_used + 1);
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(ProviderError::Cancelled),
                result = attempt() => result,
            };

            match outcome {
                Ok(value) => {
                    if retries_used > 0 {
                        info!("{operation} {target} succeeded after {retries_used} retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    let attempts = retries_used + 1;
                    if attempts >= max_attempts {
                        warn!("{operation} {target} giving up after {attempts} attempts: {err}");
                        return Err(ReconcileError::MaxRetriesExceeded {
                            attempts,
                            resource: target.to_string(),
                            last_error: err,
                        }
                        .into());
                    }

                    let delay = self.retry.delay_for(retries_used, &err);
                    warn!(
                        "{operation} {target} failed ({err}), retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            return Err(ProviderError::Cancelled.into());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    retries_used += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
