//! Per-client circuit breaker.
//!
//! closed -> open after `failure_threshold` consecutive failures; open ->
//! half-open once the cool-down elapses; half-open admits exactly one trial
//! call, which closes the circuit on success and reopens it on failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

/// Rejection returned while the circuit is open.
#[derive(Debug, Clone, Copy)]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

/// What a recorded failure did to the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEffect {
    Counted(u32),
    Opened(u32),
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

type States = Arc<Mutex<HashMap<String, CircuitState>>>;

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitSettings,
    states: States,
}

/// Admission ticket for one logical request. Must be resolved with
/// [`CircuitBreaker::record_success`] or [`CircuitBreaker::record_failure`];
/// dropping it unresolved (for example on cancellation) frees the half-open
/// trial slot without counting a failure.
#[derive(Debug)]
pub struct CircuitPermit {
    client_id: String,
    trial: bool,
    states: States,
    resolved: bool,
}

impl CircuitPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            let mut states = lock(&self.states);
            if let Some(state) = states.get_mut(&self.client_id) {
                state.trial_in_flight = false;
            }
        }
    }
}

fn lock(states: &States) -> MutexGuard<'_, HashMap<String, CircuitState>> {
    states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CircuitBreaker {
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            settings,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit or reject a call for `client_id`.
    pub fn check(&self, client_id: &str) -> Result<CircuitPermit, CircuitOpen> {
        let mut states = lock(&self.states);
        let state = states.entry(client_id.to_string()).or_default();
        let now = Instant::now();

        let trial = match state.open_until {
            None => false,
            Some(until) if now < until => {
                return Err(CircuitOpen {
                    retry_after: until - now,
                });
            }
            Some(_) if state.trial_in_flight => {
                return Err(CircuitOpen {
                    retry_after: Duration::ZERO,
                });
            }
            Some(_) => {
                state.trial_in_flight = true;
                log::info!("circuit for {client_id} half-open, admitting trial call");
                true
            }
        };

        Ok(CircuitPermit {
            client_id: client_id.to_string(),
            trial,
            states: self.states.clone(),
            resolved: false,
        })
    }

    pub fn record_success(&self, mut permit: CircuitPermit) {
        permit.resolved = true;
        let mut states = lock(&self.states);
        let state = states.entry(permit.client_id.clone()).or_default();
        if state.open_until.is_some() {
            // Admitted before the circuit opened; only the trial may close it.
            if !permit.trial {
                log::debug!("late success for {} ignored, circuit not closed", permit.client_id);
                return;
            }
            log::info!("circuit for {} closed", permit.client_id);
        }
        *state = CircuitState::default();
    }

    pub fn record_failure(&self, mut permit: CircuitPermit) -> FailureEffect {
        permit.resolved = true;
        let mut states = lock(&self.states);
        let state = states.entry(permit.client_id.clone()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if permit.trial {
            state.trial_in_flight = false;
        }

        if permit.trial || state.consecutive_failures >= self.settings.failure_threshold {
            state.open_until = Some(Instant::now() + self.settings.cooldown());
            log::warn!(
                "circuit for {} opened after {} consecutive failures",
                permit.client_id,
                state.consecutive_failures
            );
            FailureEffect::Opened(state.consecutive_failures)
        } else {
            FailureEffect::Counted(state.consecutive_failures)
        }
    }

    pub fn status(&self, client_id: &str) -> CircuitStatus {
        let states = lock(&self.states);
        match states.get(client_id).and_then(|state| state.open_until) {
            None => CircuitStatus::Closed,
            Some(until) if Instant::now() < until => CircuitStatus::Open,
            Some(_) => CircuitStatus::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self, client_id: &str) -> u32 {
        lock(&self.states)
            .get(client_id)
            .map(|state| state.consecutive_failures)
            .unwrap_or(0)
    }
}
