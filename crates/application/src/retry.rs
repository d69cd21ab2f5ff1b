use std::future::Future;
use std::time::Duration;

use config::CallConfig;
use rand::Rng;
use tokio::time::sleep;

/// 指数退避 + 随机抖动的重试策略。
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            max_attempts: config.notify_max_attempts.max(1),
            base_delay: Duration::from_millis(config.notify_base_delay_ms),
            max_delay: Duration::from_millis(config.notify_max_delay_ms),
            jitter: true,
        }
    }

    /// 第 `attempt` 次失败后的等待时间（从 1 开始计数）。
    pub fn delay_at(&self, attempt: u32) -> Duration {
        let exp = std::cmp::min(attempt.saturating_sub(1), 20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() / 2) as u64;
        let extra = rand::rng().random_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CallConfig::default())
    }
}

/// 按策略重试异步操作，返回最后一次的错误。
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_at(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "操作失败，稍后重试"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter: false,
        }
    }

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let policy = policy(5);
        assert_eq!(policy.delay_at(1), Duration::from_millis(100));
        assert_eq!(policy.delay_at(2), Duration::from_millis(200));
        assert_eq!(policy.delay_at(3), Duration::from_millis(400));
        assert_eq!(policy.delay_at(5), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(5)
        };
        for _ in 0..50 {
            let delay = policy.delay_at(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_async(&policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("broker down".to_string()) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "broker down");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_async(&policy(5), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
