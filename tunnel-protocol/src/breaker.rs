//! # Circuit breaker
//!
//! Three-state breaker per spec §4.5 / §3 (`CircuitBreakerState`).
//! State is updated through compare-and-swap style transitions so
//! only one probe slot is ever granted while `HalfOpen` (spec §5).
//! [`CircuitBreakerRegistry`] keys breakers by target (remote server
//! address, or origin `host:port`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_duration: Duration::from_secs(30) }
    }
}

/// A snapshot of breaker metrics (spec §4.5: "state, consecutive_failures,
/// total_failures, total_successes, last_state_change").
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_state_change: Instant,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probe_outstanding: bool,
    last_state_change: Instant,
}

/// Error returned by [`CircuitBreaker::call`] when the breaker is open
/// (or a probe slot is already taken in `HalfOpen`) and the caller's
/// operation never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_probe_outstanding: false,
                last_state_change: Instant::now(),
            }),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
        }
    }

    /// Call before attempting the guarded operation. Returns `Ok(())`
    /// if the call may proceed (state was `Closed`, or `HalfOpen` and
    /// this caller won the single probe slot); transitions `Open` to
    /// `HalfOpen` first if `open_duration` has elapsed.
    ///
    /// The returned guard must be resolved with [`CircuitBreaker::on_success`]
    /// or [`CircuitBreaker::on_failure`] — never held across further
    /// suspension beyond the guarded call itself.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.cfg.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probe_outstanding = true;
                    inner.last_state_change = Instant::now();
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probe_outstanding {
                    Err(CircuitOpen)
                } else {
                    inner.half_open_probe_outstanding = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.consecutive_failures = 0;
        inner.half_open_probe_outstanding = false;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.last_state_change = Instant::now();
        }
    }

    pub fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.half_open_probe_outstanding = false;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.last_state_change = Instant::now();
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.last_state_change = Instant::now();
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        BreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            last_state_change: inner.last_state_change,
        }
    }

    /// Runs `op`, recording success/failure against the breaker. Short
    /// critical sections only: `try_acquire`/`on_success`/`on_failure`
    /// never hold the mutex across `op`'s own await points.
    pub async fn call<T, E, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T, BreakerCallError<E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(|_| BreakerCallError::Open)?;
        match op().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerCallError::Inner(e))
            }
        }
    }
}

#[derive(Debug)]
pub enum BreakerCallError<E> {
    Open,
    Inner(E),
}

/// Per-target breaker registry, keyed by e.g. remote server address or
/// origin `host:port` (spec §4.5: "The breaker is per target key").
pub struct CircuitBreakerRegistry {
    cfg: BreakerConfig,
    breakers: DashMap<String, std::sync::Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self { cfg, breakers: DashMap::new() }
    }

    pub fn get(&self, key: &str) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.cfg)))
            .clone()
    }
}
