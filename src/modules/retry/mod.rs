//! Retry and circuit engine.
//!
//! Wraps one logical request: circuit admission, pacing, the network call on
//! the client's current session, and outcome-driven recovery (rotation,
//! backoff, cool-off). Every sleep here is an ordinary tokio sleep, so
//! dropping the future cancels the whole loop cleanly.

mod circuit;

pub use circuit::{CircuitBreaker, CircuitOpen, CircuitPermit, CircuitStatus, FailureEffect};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::config::RetrySettings;
use crate::modules::events::{
    AttemptEvent, CircuitEvent, EventDispatcher, ExecutorEvent, ResponseEvent, RetryEvent,
    RotationEvent,
};
use crate::modules::jitter::Jitter;
use crate::modules::pacing::RateGovernor;
use crate::modules::session::{RotationKind, SessionError, SessionHandle, SessionManager};
use crate::modules::transport::{RawResponse, TransportError};

/// How the engine reacts to one attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 403: the identity was recognised. Full rotation plus cool-off.
    Blocked,
    /// 407: the proxy refused our credentials. Identity rotation only.
    ProxyAuth,
    /// 429 / 503: slow down, rotate identity.
    Throttled,
    /// Other 5xx, timeouts, connection failures: back off, same session.
    Transient,
    /// Proxy hop failed: full rotation plus backoff.
    ProxyFailure,
    /// Anything else: give up immediately.
    Rejected,
}

impl Outcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Outcome::Success,
            403 => Outcome::Blocked,
            407 => Outcome::ProxyAuth,
            429 | 503 => Outcome::Throttled,
            500..=599 => Outcome::Transient,
            _ => Outcome::Rejected,
        }
    }

    pub fn from_error(error: &TransportError) -> Self {
        match error {
            TransportError::Proxy(_) => Outcome::ProxyFailure,
            TransportError::Build(_) => Outcome::Rejected,
            _ => Outcome::Transient,
        }
    }
}

/// Last thing that went wrong before the attempt budget ran out.
#[derive(Debug, Clone)]
pub enum LastFailure {
    Status(u16),
    Transport(TransportError),
}

impl std::fmt::Display for LastFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LastFailure::Status(status) => write!(f, "status {status}"),
            LastFailure::Transport(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("circuit open for {client_id}, retry after {retry_after:?}")]
    CircuitOpen { client_id: String, retry_after: Duration },
    #[error("request rejected with status {}", .response.status)]
    Rejected { response: RawResponse },
    #[error("request failed: {0}")]
    Fatal(TransportError),
    #[error("gave up after {attempts} attempts, last failure: {last}")]
    AttemptsExhausted { attempts: u32, last: LastFailure },
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct RetryEngine {
    settings: RetrySettings,
    sessions: Arc<SessionManager>,
    governor: Arc<RateGovernor>,
    circuit: Arc<CircuitBreaker>,
    jitter: Arc<Jitter>,
    events: Arc<EventDispatcher>,
}

impl RetryEngine {
    pub fn new(
        settings: RetrySettings,
        sessions: Arc<SessionManager>,
        governor: Arc<RateGovernor>,
        circuit: Arc<CircuitBreaker>,
        jitter: Arc<Jitter>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            settings,
            sessions,
            governor,
            circuit,
            jitter,
            events,
        }
    }

    /// Backoff before retrying after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)` plus up to `backoff_jitter`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.settings.backoff_base().saturating_mul(1u32 << exponent);
        base + self.jitter.up_to(self.settings.backoff_jitter())
    }

    fn block_cooloff(&self) -> Duration {
        let (min, max) = self.settings.block_cooloff_range();
        self.jitter.between(min, max)
    }

    /// Run `request_fn` against the client's current session until it
    /// succeeds, fails permanently, or the attempt budget is spent.
    pub async fn execute<F, Fut>(&self, client_id: &str, mut request_fn: F) -> Result<RawResponse, RetryError>
    where
        F: FnMut(SessionHandle) -> Fut,
        Fut: Future<Output = Result<RawResponse, TransportError>>,
    {
        let permit = self.circuit.check(client_id).map_err(|open| RetryError::CircuitOpen {
            client_id: client_id.to_string(),
            retry_after: open.retry_after,
        })?;

        let mut last = LastFailure::Status(0);
        for attempt in 1..=self.settings.max_attempts {
            self.governor.await_turn(client_id).await;

            let session = match self.sessions.get_session(client_id) {
                Ok(session) => session,
                Err(err) => {
                    self.fail(client_id, permit);
                    return Err(err.into());
                }
            };

            self.events.dispatch(ExecutorEvent::Attempt(AttemptEvent {
                client_id: client_id.to_string(),
                attempt,
                identity: session.identity().tag(),
                session_generation: session.generation(),
                timestamp: Utc::now(),
            }));
            let result = request_fn(session).await;
            let outcome = match &result {
                Ok(response) => {
                    self.events.dispatch(ExecutorEvent::Response(ResponseEvent {
                        client_id: client_id.to_string(),
                        attempt,
                        url: response.url.clone(),
                        status: response.status,
                        latency: response.latency,
                        timestamp: Utc::now(),
                    }));
                    Outcome::from_status(response.status)
                }
                Err(err) => {
                    self.events.error(client_id, err);
                    Outcome::from_error(err)
                }
            };

            // Only successes count toward threshold rotation; failures get
            // their own rotation in `recover`.
            if outcome == Outcome::Success {
                if let Some(kind) = self.sessions.note_request(client_id) {
                    self.emit_rotation(client_id, kind, "request threshold");
                }
            }

            match (outcome, result) {
                (Outcome::Success, Ok(response)) => {
                    self.circuit.record_success(permit);
                    return Ok(response);
                }
                (Outcome::Rejected, Ok(response)) => {
                    self.fail(client_id, permit);
                    return Err(RetryError::Rejected { response });
                }
                (Outcome::Rejected, Err(err)) => {
                    self.fail(client_id, permit);
                    return Err(RetryError::Fatal(err));
                }
                (_, Ok(response)) => last = LastFailure::Status(response.status),
                (_, Err(err)) => last = LastFailure::Transport(err),
            }

            // Rotations apply even after the final attempt so the next call
            // starts on a fresh identity.
            let delay = match self.recover(client_id, outcome, attempt) {
                Ok(delay) => delay,
                Err(err) => {
                    self.fail(client_id, permit);
                    return Err(err.into());
                }
            };
            if attempt == self.settings.max_attempts {
                break;
            }

            self.events.dispatch(ExecutorEvent::Retry(RetryEvent {
                client_id: client_id.to_string(),
                attempt,
                reason: last.to_string(),
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        self.fail(client_id, permit);
        Err(RetryError::AttemptsExhausted {
            attempts: self.settings.max_attempts,
            last,
        })
    }

    /// Apply the rotation an outcome calls for and return the delay before
    /// the next attempt.
    fn recover(&self, client_id: &str, outcome: Outcome, attempt: u32) -> Result<Duration, SessionError> {
        let delay = match outcome {
            Outcome::Blocked => {
                self.sessions.rotate(client_id)?;
                self.emit_rotation(client_id, RotationKind::Session, "blocked (403)");
                self.block_cooloff()
            }
            Outcome::ProxyAuth => {
                self.sessions.rotate_identity(client_id)?;
                self.emit_rotation(client_id, RotationKind::Identity, "proxy auth (407)");
                Duration::ZERO
            }
            Outcome::Throttled => {
                self.sessions.rotate_identity(client_id)?;
                self.emit_rotation(client_id, RotationKind::Identity, "throttled");
                self.backoff_delay(attempt)
            }
            Outcome::ProxyFailure => {
                self.sessions.rotate(client_id)?;
                self.emit_rotation(client_id, RotationKind::Session, "proxy failure");
                self.backoff_delay(attempt)
            }
            _ => self.backoff_delay(attempt),
        };
        Ok(delay)
    }

    fn fail(&self, client_id: &str, permit: CircuitPermit) {
        if let FailureEffect::Opened(failures) = self.circuit.record_failure(permit) {
            self.events.dispatch(ExecutorEvent::Circuit(CircuitEvent {
                client_id: client_id.to_string(),
                state: CircuitStatus::Open.as_str(),
                consecutive_failures: failures,
                timestamp: Utc::now(),
            }));
        }
    }

    fn emit_rotation(&self, client_id: &str, kind: RotationKind, reason: &str) {
        let identity = self
            .sessions
            .current_identity(client_id)
            .map(|identity| identity.tag())
            .unwrap_or_default();
        self.events.dispatch(ExecutorEvent::Rotation(RotationEvent {
            client_id: client_id.to_string(),
            kind,
            reason: reason.to_string(),
            identity,
            timestamp: Utc::now(),
        }));
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}
