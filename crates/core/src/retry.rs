use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Backoff {
    /// `base_ms * 2^(attempt-1)`, capped at 16x the base.
    #[serde(rename_all = "camelCase")]
    Exponential { base_ms: u64 },
    /// `step_ms * attempt`.
    #[serde(rename_all = "camelCase")]
    Linear { step_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Fixed { delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base_ms: u64) -> Self {
        Self { max_retries, backoff: Backoff::Exponential { base_ms } }
    }

    pub fn linear(max_retries: u32, step_ms: u64) -> Self {
        Self { max_retries, backoff: Backoff::Linear { step_ms } }
    }

    pub fn none() -> Self {
        Self { max_retries: 0, backoff: Backoff::Fixed { delay_ms: 0 } }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = match self.backoff {
            Backoff::Exponential { base_ms } => base_ms * (1u64 << (attempt - 1).min(4)),
            Backoff::Linear { step_ms } => step_ms * attempt as u64,
            Backoff::Fixed { delay_ms } => delay_ms,
        };
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget runs out. The closure receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                warn!(label, attempt, max_retries = self.max_retries, delay_ms = delay.as_millis() as u64, "Retrying");
                tokio::time::sleep(delay).await;
            }
            match op(attempt).await {
                Ok(v) => {
                    if attempt > 0 {
                        info!(label, attempt, "Succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if attempt >= self.max_retries || !is_retryable(&e) {
                        warn!(label, error = %e, attempt, "Giving up");
                        return Err(e);
                    }
                    warn!(label, error = %e, attempt, "Attempt failed");
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays() {
        let exp = RetryPolicy::exponential(5, 100);
        assert_eq!(exp.delay_for(0), Duration::ZERO);
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(3), Duration::from_millis(400));
        assert_eq!(exp.delay_for(9), Duration::from_millis(1600));

        let lin = RetryPolicy::linear(3, 250);
        assert_eq!(lin.delay_for(2), Duration::from_millis(500));
        assert_eq!(lin.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3, 10);
        let res: Result<(), String> = policy
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal".to_string()) }
                },
                |e: &String| e != "fatal",
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(2, 10);
        let res: Result<(), String> = policy
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("flaky".to_string()) }
                },
                |_| true,
            )
            .await;
        assert_eq!(res, Err("flaky".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers() {
        let policy = RetryPolicy::linear(3, 10);
        let res: Result<u32, String> = policy
            .run(
                "test",
                |attempt| async move {
                    if attempt < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(attempt)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(res, Ok(2));
    }
}
