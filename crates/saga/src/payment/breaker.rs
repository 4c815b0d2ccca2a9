//! Circuit breaker for calls to the payment gateway.
//!
//! Closed: calls pass, consecutive failures are counted. Open: calls are
//! refused until the open timeout has elapsed. Half-open: calls pass again,
//! and enough consecutive successes close the circuit; one failure reopens it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit {name} is open")]
    Open { name: &'static str },

    #[error(transparent)]
    Inner(E),
}

/// Counters since the breaker was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerStats {
    pub calls: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct Circuit {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: Arc<BreakerConfig>,
    circuit: Arc<Mutex<Circuit>>,
    calls: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config: Arc::new(config),
            circuit: Arc::new(Mutex::new(Circuit {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            })),
            calls: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state, moving an expired open circuit to half-open.
    pub async fn state(&self) -> BreakerState {
        let mut circuit = self.circuit.lock().await;
        self.expire(&mut circuit);
        circuit.state
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Runs `operation` unless the circuit is open.
    ///
    /// Only errors for which `trips` returns true count as failures; the
    /// others are outcomes of a healthy dependency and count as successes.
    pub async fn call<T, E, Fut>(
        &self,
        operation: impl FnOnce() -> Fut,
        trips: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.admit().await {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name)
                .increment(1);
            tracing::warn!(breaker = self.name, "circuit open, call rejected");
            return Err(BreakerError::Open { name: self.name });
        }

        let result = operation().await;
        match &result {
            Err(err) if trips(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.record_failure().await;
            }
            _ => self.record_success().await,
        }
        result.map_err(BreakerError::Inner)
    }

    /// Forces the circuit closed.
    pub async fn reset(&self) {
        let mut circuit = self.circuit.lock().await;
        self.transition(&mut circuit, BreakerState::Closed);
    }

    async fn admit(&self) -> bool {
        let mut circuit = self.circuit.lock().await;
        self.expire(&mut circuit);
        circuit.state != BreakerState::Open
    }

    fn expire(&self, circuit: &mut Circuit) {
        if circuit.state == BreakerState::Open
            && circuit
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.open_timeout)
        {
            self.transition(circuit, BreakerState::HalfOpen);
        }
    }

    async fn record_success(&self) {
        let mut circuit = self.circuit.lock().await;
        match circuit.state {
            BreakerState::Closed => circuit.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut circuit, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut circuit = self.circuit.lock().await;
        match circuit.state {
            BreakerState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut circuit, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => self.transition(&mut circuit, BreakerState::Open),
            BreakerState::Open => circuit.opened_at = Some(Instant::now()),
        }
    }

    fn transition(&self, circuit: &mut Circuit, to: BreakerState) {
        if circuit.state != to {
            tracing::info!(breaker = self.name, from = %circuit.state, %to, "circuit breaker transition");
        }
        circuit.state = to;
        circuit.consecutive_failures = 0;
        circuit.consecutive_successes = 0;
        circuit.opened_at = (to == BreakerState::Open).then(Instant::now);
    }
}
