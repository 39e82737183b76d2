//! Per-upstream circuit breaker with sliding-window failure counting
//!
//! States:
//!
//! - **Closed**: normal operation, requests pass through
//! - **Open**: requests fail immediately
//! - **HalfOpen**: limited probing after the reset timeout
//!
//! Outcomes are tracked in two bounded timestamp deques pruned by the window
//! duration before every decision. Only configured failure kinds count
//! toward tripping; an empty trigger set counts every proxy failure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::BreakerSettings;
use crate::proxy::error::ProxyErrorKind;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Probing recovery
    HalfOpen,
}

/// Runtime circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures inside the window that trip the breaker
    pub failure_threshold: usize,
    /// How long an open breaker waits before probing
    pub reset_timeout: Duration,
    /// Successes in half-open state that close the breaker
    pub success_threshold: usize,
    /// Maximum outcomes retained per deque
    pub window_size: usize,
    /// Sliding window duration
    pub window_duration: Duration,
    /// Failure kinds that count toward tripping; empty counts all
    pub trigger_failures: Vec<ProxyErrorKind>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout: settings.reset_timeout(),
            success_threshold: settings.success_threshold,
            window_size: settings.window_size,
            window_duration: settings.window_duration(),
            trigger_failures: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    successes: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: usize,
    half_open_inflight: usize,
}

/// Circuit breaker for a single upstream
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                successes: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                half_open_inflight: 0,
            }),
        }
    }

    /// The upstream this breaker guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("breaker lock poisoned").state
    }

    /// Decide whether a request may be dispatched
    ///
    /// An open breaker transitions to half-open once the reset timeout has
    /// elapsed; that first admitted request is the probe. Half-open admits
    /// while in-flight probes stay within `success_threshold + 1`.
    pub fn allow_request(&self) -> bool {
        let mut st = self.state.lock().expect("breaker lock poisoned");
        self.prune(&mut st);

        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = st
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    st.state = CircuitState::HalfOpen;
                    st.half_open_successes = 0;
                    st.half_open_inflight = 1;
                    tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if st.half_open_inflight < self.config.success_threshold + 1 {
                    st.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful upstream exchange
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut st = self.state.lock().expect("breaker lock poisoned");
        st.successes.push_back(now);
        self.prune(&mut st);

        match st.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                st.half_open_inflight = st.half_open_inflight.saturating_sub(1);
                st.half_open_successes += 1;
                if st.half_open_successes >= self.config.success_threshold {
                    self.close(&mut st);
                }
            }
            CircuitState::Open => {
                tracing::debug!(breaker = %self.name, "success recorded while open");
            }
        }
    }

    /// Record a failed upstream exchange
    ///
    /// Kinds outside the trigger set release half-open probe slots but do
    /// not count toward tripping.
    pub fn record_failure(&self, kind: ProxyErrorKind) {
        let counts = self.config.trigger_failures.is_empty()
            || self.config.trigger_failures.contains(&kind);

        let now = Instant::now();
        let mut st = self.state.lock().expect("breaker lock poisoned");
        if counts {
            st.failures.push_back(now);
        }
        self.prune(&mut st);

        match st.state {
            CircuitState::Closed => {
                if counts && st.failures.len() >= self.config.failure_threshold {
                    self.open(&mut st);
                }
            }
            CircuitState::HalfOpen => {
                st.half_open_inflight = st.half_open_inflight.saturating_sub(1);
                if counts {
                    self.open(&mut st);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear all recorded outcomes
    pub fn reset(&self) {
        let mut st = self.state.lock().expect("breaker lock poisoned");
        self.close(&mut st);
        tracing::info!(breaker = %self.name, "circuit breaker manually reset");
    }

    fn open(&self, st: &mut BreakerState) {
        st.state = CircuitState::Open;
        st.opened_at = Some(Instant::now());
        st.half_open_successes = 0;
        st.half_open_inflight = 0;
        tracing::warn!(breaker = %self.name, "circuit breaker opened");
    }

    fn close(&self, st: &mut BreakerState) {
        st.state = CircuitState::Closed;
        st.opened_at = None;
        st.failures.clear();
        st.successes.clear();
        st.half_open_successes = 0;
        st.half_open_inflight = 0;
        tracing::info!(breaker = %self.name, "circuit breaker closed");
    }

    /// Drop entries older than the window and cap both deques at the window
    /// size, oldest first.
    fn prune(&self, st: &mut BreakerState) {
        let horizon = Instant::now()
            .checked_sub(self.config.window_duration)
            .unwrap_or_else(Instant::now);

        while st.failures.front().is_some_and(|t| *t < horizon) {
            st.failures.pop_front();
        }
        while st.successes.front().is_some_and(|t| *t < horizon) {
            st.successes.pop_front();
        }
        while st.failures.len() > self.config.window_size {
            st.failures.pop_front();
        }
        while st.successes.len() > self.config.window_size {
            st.successes.pop_front();
        }
    }
}

/// Process-wide breaker registry keyed by upstream authority
///
/// Construct one per application and pass it by handle; the first request to
/// a host lazily creates its breaker with the registry's config.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    /// Create a registry applying `config` to every new breaker
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Breaker for an upstream authority, created on first access
    pub fn for_upstream(&self, authority: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(authority.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(authority, self.config.clone()))
            })
            .clone()
    }

    /// Look up an existing breaker without creating one
    pub fn get(&self, authority: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(authority).map(|entry| entry.clone())
    }

    /// Number of tracked upstreams
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no upstream has been seen yet
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
