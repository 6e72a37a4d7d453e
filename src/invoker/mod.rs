//! Model invocation: the pluggable capability, the global call ceiling and the
//! timeout/retry discipline shared by job units and the judge evaluator.

pub mod http;
pub mod pricing;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::catalog::ModelConfig;

pub use http::HttpInvoker;
pub use retry::{invoke_with_retry, InvocationOutcome, RetryPolicy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// May succeed on a fresh attempt (network error, rate limit, 5xx).
    Transient(String),
    /// Will not succeed by retrying.
    Fatal(String),
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeError::Transient(msg) => write!(f, "transient: {}", msg),
            InvokeError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Checked at run submission; an error here is a configuration error.
    fn validate(&self, model: &ModelConfig) -> Result<(), String>;

    async fn invoke(&self, model: &ModelConfig, prompt: &str) -> Result<Completion, InvokeError>;
}

/// Platform-wide ceiling on concurrent model calls, shared by every run.
#[derive(Clone)]
pub struct ModelCallLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ModelCallLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_total() {
        let usage = Usage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
    }

    #[tokio::test]
    async fn test_limiter_permits() {
        let limiter = ModelCallLimiter::new(2);
        assert_eq!(limiter.capacity(), 2);
        let a = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 1);
        drop(a);
        assert_eq!(limiter.available(), 2);
    }

    #[test]
    fn test_limiter_minimum_capacity() {
        assert_eq!(ModelCallLimiter::new(0).capacity(), 1);
    }
}
