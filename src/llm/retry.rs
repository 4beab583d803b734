//! 重试与指数退避
//!
//! 批处理：最多 3 次，间隔 1s / 2s / 4s（基数逐次翻倍，封顶 max_delay）。
//! 交互轮次：最多重试一次。退避等待可被关闭信号打断，打断后返回最后一次错误。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// 最多尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// 第 attempt 次失败（从 0 计）之后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// 按策略重试 `op`；仅当 `is_retryable` 为真时重试
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryConfig,
    cancel: Option<&CancellationToken>,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let last = attempt + 1 >= policy.max_attempts;
                if last || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt + 1,
                    policy.max_attempts,
                    err,
                    delay
                );
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => {
                                tracing::info!("Retry aborted by shutdown signal");
                                return Err(err);
                            }
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
                attempt += 1;
            }
        }
    }
}
