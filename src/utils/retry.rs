//! 指数退避重试
//!
//! 第 n 次重试前等待 `2^(n-1) * base_delay`

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 首次失败后的额外重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// 第 `retry`（从 1 开始）次重试前的等待时长
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// 按策略重试异步操作，返回最终结果以及实际尝试次数
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> (Result<T, E>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if attempt <= policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} 第 {} 次尝试失败: {}，{}ms 后重试",
                    label,
                    attempt,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let (result, attempts) = retry_with_backoff(policy, "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("boom")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let policy = RetryPolicy::new(1, Duration::from_millis(1));
        let (result, attempts) =
            retry_with_backoff(policy, "test", |_| async { Err::<(), _>("down") }).await;
        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }
}
