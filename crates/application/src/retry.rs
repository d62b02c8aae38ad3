use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{ConnectionError, RequestError};

/// 退避策略
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^(attempt-1)`，不超过 `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次尝试（从 1 开始）之前的等待时间
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::exponential(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

/// 错误是否值得重试
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for RequestError {
    fn is_retryable(&self) -> bool {
        match self {
            RequestError::Transport(_) => true,
            RequestError::Http { status, .. } => *status >= 500,
            RequestError::Decode(_) => false,
        }
    }
}

impl Retryable for ConnectionError {
    fn is_retryable(&self) -> bool {
        matches!(self, ConnectionError::Transport(_))
    }
}

pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || !e.is_retryable() {
                    return Err(e);
                }
                let delay = config.backoff.delay_at(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "操作失败，准备重试");
                sleep(delay).await;
            }
        }
    }
}
