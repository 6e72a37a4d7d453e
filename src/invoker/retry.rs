use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{Completion, InvokeError, ModelCallLimiter, ModelInvoker};
use crate::catalog::{ExecutionConfig, ModelConfig};
use crate::error::EngineError;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_execution(cfg: &ExecutionConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.timeout_seconds.max(1)),
            max_retries: cfg.max_retries,
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        if self.backoff.is_zero() || attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug)]
pub enum InvocationOutcome {
    Success {
        completion: Completion,
        attempts: u32,
        latency_ms: f64,
    },
    Failed {
        error: EngineError,
        attempts: u32,
    },
    /// The cancellation flag was observed before a retry attempt.
    Cancelled { attempts: u32 },
}

impl InvocationOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            InvocationOutcome::Success { attempts, .. }
            | InvocationOutcome::Failed { attempts, .. }
            | InvocationOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Calls the model under a per-attempt deadline, re-executing the same request
/// on timeout or transient failure up to `policy.max_retries` times. Every
/// attempt takes its own permit from the global limiter.
pub async fn invoke_with_retry(
    invoker: &dyn ModelInvoker,
    limiter: &ModelCallLimiter,
    model: &ModelConfig,
    prompt: &str,
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
) -> InvocationOutcome {
    let mut attempts = 0u32;
    let mut last_error = EngineError::Internal("no invocation attempted".to_string());

    while attempts < policy.max_attempts() {
        if attempts > 0 {
            let delay = policy.delay_before(attempts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if *cancel.borrow() {
                debug!(attempts, "Cancellation observed before retry");
                return InvocationOutcome::Cancelled { attempts };
            }
        }

        let Some(_permit) = limiter.acquire().await else {
            return InvocationOutcome::Failed {
                error: EngineError::Internal("model call limiter closed".to_string()),
                attempts,
            };
        };

        attempts += 1;
        let start = Instant::now();
        let result = tokio::time::timeout(policy.timeout, invoker.invoke(model, prompt)).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(Ok(completion)) => {
                return InvocationOutcome::Success {
                    completion,
                    attempts,
                    latency_ms,
                }
            }
            Ok(Err(InvokeError::Fatal(msg))) => {
                warn!(model = %model.model, attempt = attempts, error = %msg, "Model invocation rejected");
                return InvocationOutcome::Failed {
                    error: EngineError::InvokerFatal(msg),
                    attempts,
                };
            }
            Ok(Err(InvokeError::Transient(msg))) => {
                warn!(model = %model.model, attempt = attempts, error = %msg, "Transient model invocation failure");
                last_error = EngineError::InvokerTransient(msg);
            }
            Err(_) => {
                warn!(
                    model = %model.model,
                    attempt = attempts,
                    timeout_secs = policy.timeout.as_secs(),
                    "Model invocation timed out"
                );
                last_error = EngineError::InvokerTimeout(policy.timeout.as_secs());
            }
        }
    }

    InvocationOutcome::Failed {
        error: last_error,
        attempts,
    }
}
