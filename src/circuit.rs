//! Three-state circuit breaker (C5) protecting calls to the upstream adapter.
//!
//! Transitions are serialized behind a single mutex that is never held
//! across the guarded call itself — the pre-call check and the post-call
//! recording are each their own critical section, matching the design's
//! concurrency contract in §5.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{FlagrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CircuitStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

struct Inner {
    state: State,
    failures: u32,
    half_open_successes: u32,
    last_state_change: Instant,
    stats: CircuitStats,
}

pub struct CircuitBreaker {
    max_failures: u32,
    timeout: Duration,
    half_open_successes_to_close: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, timeout: Duration) -> Self {
        Self {
            max_failures,
            timeout,
            half_open_successes_to_close: 2,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: 0,
                half_open_successes: 0,
                last_state_change: Instant::now(),
                stats: CircuitStats::default(),
            }),
        }
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitStats {
        self.inner.lock().await.stats.clone()
    }

    /// Runs `call` through the breaker: fails fast with `CircuitOpen` while
    /// open, lets exactly the call that arrives after `timeout` has elapsed
    /// through as a half-open trial, and otherwise passes calls straight
    /// through while recording the outcome.
    pub async fn call<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.admit().await {
            return Err(FlagrError::CircuitOpen);
        }
        match call().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }

    async fn admit(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.stats.requests += 1;
        match inner.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open => {
                if inner.last_state_change.elapsed() >= self.timeout {
                    debug!("circuit breaker timeout elapsed, admitting trial call");
                    inner.state = State::HalfOpen;
                    inner.last_state_change = Instant::now();
                    inner.half_open_successes = 0;
                    true
                } else {
                    inner.stats.rejections += 1;
                    false
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.successes += 1;
        match inner.state {
            State::Closed => {
                inner.failures = 0;
            }
            State::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.half_open_successes_to_close {
                    debug!("circuit breaker closing after consecutive half-open successes");
                    inner.state = State::Closed;
                    inner.failures = 0;
                    inner.last_state_change = Instant::now();
                }
            }
            State::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.failures += 1;
        match inner.state {
            State::Closed => {
                inner.failures += 1;
                if inner.failures >= self.max_failures {
                    warn!(failures = inner.failures, "circuit breaker opening");
                    inner.state = State::Open;
                    inner.last_state_change = Instant::now();
                }
            }
            State::HalfOpen => {
                warn!("circuit breaker reopening after half-open trial failure");
                inner.state = State::Open;
                inner.last_state_change = Instant::now();
                inner.half_open_successes = 0;
            }
            State::Open => {}
        }
    }
}
