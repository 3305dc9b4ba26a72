//! Per-downstream circuit breaker.

use std::future::Future;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Instant;

use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::ServiceError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Opens after `failure_threshold` consecutive failures, fails fast for
/// `cool_down`, then lets probes through until `success_threshold`
/// successes close it again. Any failure while half-open re-opens it.
pub struct CircuitBreaker {
    service: String,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            config,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Whether a call may proceed now. Moves open → half-open once the
    /// cool-down has passed.
    pub fn is_allowed(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .read()
                    .ok()
                    .and_then(|guard| *guard)
                    .is_some_and(|at| at.elapsed() >= self.config.cool_down);
                if cooled {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                    self.success_count.store(0, Ordering::SeqCst);
                    info!(service = %self.service, "Circuit half-open, probing");
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);

        if self.state() == CircuitState::HalfOpen {
            let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.config.success_threshold {
                self.state
                    .store(CircuitState::Closed as u8, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
                info!(service = %self.service, "Circuit closed");
            }
        }
    }

    pub fn record_failure(&self) {
        self.success_count.store(0, Ordering::SeqCst);
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;

        if self.state() == CircuitState::HalfOpen || count >= self.config.failure_threshold {
            if let Ok(mut guard) = self.opened_at.write() {
                *guard = Some(Instant::now());
            }
            if self.state() != CircuitState::Open {
                warn!(service = %self.service, failures = count, "Circuit opened");
            }
            self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
        }
    }

    /// Run `op` through the breaker. Fails fast with
    /// `ServiceError::Unavailable` while open.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if !self.is_allowed() {
            return Err(ServiceError::Unavailable {
                service: self.service.clone(),
            });
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                // A rejected request says nothing about the service's health.
                if !matches!(e, ServiceError::Rejected { .. }) {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .field("success_count", &self.success_count.load(Ordering::Relaxed))
            .finish()
    }
}
