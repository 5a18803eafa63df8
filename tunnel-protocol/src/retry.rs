//! # Retry with exponential backoff and jitter
//!
//! Shared by the LifecycleController (control-plane calls, transport
//! dial) and the OriginExecutor (origin dials). See spec §4.5 and the
//! bounds tested in §8 item 6.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Parameters for [`retry`]. `base` and `max` bound the exponential
/// backoff; `jitter` is the uniform multiplier range applied on top
/// (spec §4.4: `uniform(0.5, 1.5)` for LifecycleController backoff;
/// callers needing a different spread can pass their own range).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: (f64, f64),
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter: (0.5, 1.5),
        }
    }
}

impl RetryConfig {
    /// The un-jittered sleep before attempt `attempt` (0-indexed, i.e.
    /// the sleep taken after the 1st failure is `backoff(0)`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt).as_secs_f64();
        let (lo, hi) = self.jitter;
        let factor = rand::thread_rng().gen_range(lo..=hi);
        Duration::from_secs_f64(base * factor)
    }
}

/// Invokes `op` until it succeeds, `is_transient` says to stop, attempts
/// are exhausted, or `cancel` fires. At most `max_attempts` invocations
/// of `op`; sleeps between attempts are monotonically non-decreasing and
/// bounded by `cfg.max` (before jitter).
pub async fn retry<T, E, Op, Fut, IsTransient>(
    cfg: RetryConfig,
    cancel: &CancellationToken,
    mut is_transient: IsTransient,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    IsTransient: FnMut(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = op().await;
        match result {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= cfg.max_attempts || !is_transient(&e) {
                    return Err(e);
                }
                let sleep = cfg.jittered_backoff(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
        }
    }
}
