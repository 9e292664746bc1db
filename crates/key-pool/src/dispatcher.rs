//! Retry loop over the key pool
//!
//! A unit of work is a closure that, given one API key, performs exactly one
//! remote call. The dispatcher runs it against the selected key, classifies
//! failures, and reacts: rate limits exhaust the key and rotate to the next
//! one after a fixed backoff, rejected keys and unexpected failures mark the
//! key errored and fail the call, transient failures retry on the same key.
//!
//! One dispatch holds the pool's gate from its first attempt to its final
//! outcome, so concurrent callers never race on selection or rotation. Key
//! administration goes through the same gate, so the key list never changes
//! under an attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use transport::{ErrorClassification, InvokeError};

use crate::error::{self, DispatchError};
use crate::pool::{Credential, CredentialPool};
use crate::quota::classify;

/// Retry and pacing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait after a successful rotation (and after a transient failure)
    /// before the next attempt.
    #[serde(default = "default_backoff_ms")]
    pub rotation_backoff_ms: u64,
    /// Wait between successful batch items.
    #[serde(default = "default_backoff_ms")]
    pub batch_pacing_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            rotation_backoff_ms: default_backoff_ms(),
            batch_pacing_ms: default_backoff_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn rotation_backoff(&self) -> Duration {
        Duration::from_millis(self.rotation_backoff_ms)
    }

    pub fn batch_pacing(&self) -> Duration {
        Duration::from_millis(self.batch_pacing_ms)
    }
}

/// Executes units of remote work through a credential pool.
pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    config: DispatchConfig,
    gate: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    pub fn new(pool: Arc<CredentialPool>, config: DispatchConfig) -> Self {
        Self {
            pool,
            config,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Add a key to the pool between dispatches.
    pub async fn add_credential(&self, value: &str) -> error::Result<bool> {
        let _gate = self.gate.lock().await;
        self.pool.add_credential(value)
    }

    /// Remove the key at `index` between dispatches.
    pub async fn remove_credential(&self, index: usize) -> error::Result<Credential> {
        let _gate = self.gate.lock().await;
        self.pool.remove_credential(index)
    }

    /// Run `work` with the configured attempt budget.
    pub async fn execute<T, F, Fut>(
        &self,
        work: F,
        cancel: &CancellationToken,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(Secret<String>) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        self.execute_with(work, self.config.max_attempts, cancel)
            .await
    }

    /// Run `work` with at most `max_attempts` attempts (at least one).
    #[instrument(skip_all, fields(dispatch_id = %uuid::Uuid::new_v4().as_simple(), max_attempts = max_attempts))]
    pub async fn execute_with<T, F, Fut>(
        &self,
        mut work: F,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(Secret<String>) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        let result = self.run(&mut work, max_attempts.max(1), cancel).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "dispatch failed");
                e.kind()
            }
        };
        metrics::counter!("keypool_dispatch_total", "outcome" => outcome).increment(1);
        result
    }

    async fn run<T, F, Fut>(
        &self,
        work: &mut F,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(Secret<String>) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        let _gate = tokio::select! {
            guard = self.gate.lock() => guard,
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
        };

        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if !self.pool.has_available() {
                return Err(DispatchError::AllCredentialsExhausted { last_error });
            }

            self.pool.select_available();
            let index = self.pool.mark_in_use();
            let in_flight = InFlight {
                pool: &self.pool,
                index,
                settled: false,
            };
            let credential = self.pool.current_credential();
            metrics::counter!("keypool_dispatch_attempts_total").increment(1);
            debug!(attempt, index, "dispatch attempt");

            let result = work(credential).await;
            in_flight.settle();
            let error = match result {
                Ok(value) => {
                    self.pool.mark_success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            let classification = classify(&error);
            let more_attempts = attempt < max_attempts;
            debug!(attempt, index, classification = classification.label(), "attempt failed");
            match classification {
                ErrorClassification::RateLimited => {
                    warn!(attempt, index, status = ?error.status, "rate limited");
                    last_error = Some(error.message);
                    if !self.pool.mark_exhausted_and_rotate() {
                        return Err(DispatchError::AllCredentialsExhausted { last_error });
                    }
                    metrics::counter!("keypool_rotations_total").increment(1);
                    if more_attempts {
                        sleep_or_cancel(self.config.rotation_backoff(), cancel).await?;
                    }
                }
                ErrorClassification::InvalidCredential => {
                    self.pool.mark_error(&error.message);
                    return Err(DispatchError::InvalidCredential {
                        message: error.message,
                    });
                }
                ErrorClassification::Transient => {
                    info!(attempt, index, error = %error, "transient failure, retrying same key");
                    self.pool.release();
                    last_error = Some(error.message);
                    if more_attempts {
                        sleep_or_cancel(self.config.rotation_backoff(), cancel).await?;
                    }
                }
                ErrorClassification::Other => {
                    self.pool.mark_error(&error.message);
                    return Err(DispatchError::Upstream(error));
                }
            }
        }

        Err(DispatchError::RetriesExceeded {
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Releases the in-flight key when an attempt is dropped before its call
/// returns, so an abandoned dispatch never leaves a key InUse.
struct InFlight<'a> {
    pool: &'a CredentialPool,
    index: usize,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(index = self.index, "dispatch dropped mid-call, releasing key");
            self.pool.release();
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), DispatchError> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => {
            info!("cancelled during backoff");
            Err(DispatchError::Cancelled)
        }
    }
}
