//! Event system for the request executor.
//!
//! Provides hooks for metrics, logging, and custom reactions around attempts,
//! rotations, retries, circuit transitions and captcha token activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;
use super::session::RotationKind;

/// One network attempt is about to start.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub client_id: String,
    pub attempt: u32,
    pub identity: String,
    pub session_generation: u64,
    pub timestamp: DateTime<Utc>,
}

/// A response came back, whatever its status.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub client_id: String,
    pub attempt: u32,
    pub url: Url,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RotationEvent {
    pub client_id: String,
    pub kind: RotationKind,
    pub reason: String,
    pub identity: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub client_id: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub client_id: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenActivity {
    Solved,
    SolveFailed,
    Rejected,
    Purged,
}

#[derive(Debug, Clone)]
pub struct TokenEvent {
    pub activity: TokenActivity,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub client_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    Attempt(AttemptEvent),
    Response(ResponseEvent),
    Rotation(RotationEvent),
    Retry(RetryEvent),
    Circuit(CircuitEvent),
    Token(TokenEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ExecutorEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ExecutorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn token(&self, activity: TokenActivity, detail: impl Into<String>) {
        self.dispatch(ExecutorEvent::Token(TokenEvent {
            activity,
            detail: detail.into(),
            timestamp: Utc::now(),
        }));
    }

    pub fn error(&self, client_id: &str, error: impl ToString) {
        self.dispatch(ExecutorEvent::Error(ErrorEvent {
            client_id: client_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }));
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ExecutorEvent) {
        match event {
            ExecutorEvent::Attempt(attempt) => {
                log::debug!(
                    "[{}] attempt {} via {} (session {})",
                    attempt.client_id,
                    attempt.attempt,
                    attempt.identity,
                    attempt.session_generation
                );
            }
            ExecutorEvent::Response(response) => {
                log::debug!(
                    "[{}] <- {} -> {} ({:.2}s)",
                    response.client_id,
                    response.url,
                    response.status,
                    response.latency.as_secs_f64()
                );
            }
            ExecutorEvent::Rotation(rotation) => {
                log::info!(
                    "[{}] {:?} rotation ({}), now using {}",
                    rotation.client_id,
                    rotation.kind,
                    rotation.reason,
                    rotation.identity
                );
            }
            ExecutorEvent::Retry(retry) => {
                log::info!(
                    "[{}] retry after attempt {} ({}) in {:.2}s",
                    retry.client_id,
                    retry.attempt,
                    retry.reason,
                    retry.scheduled_after.as_secs_f64()
                );
            }
            ExecutorEvent::Circuit(circuit) => {
                log::warn!(
                    "[{}] circuit {} after {} consecutive failures",
                    circuit.client_id,
                    circuit.state,
                    circuit.consecutive_failures
                );
            }
            ExecutorEvent::Token(token) => match token.activity {
                TokenActivity::Solved => log::debug!("captcha token solved {}", token.detail),
                TokenActivity::SolveFailed => log::warn!("captcha solve failed: {}", token.detail),
                TokenActivity::Rejected => log::info!("captcha token rejected by site {}", token.detail),
                TokenActivity::Purged => log::debug!("captcha tokens purged: {}", token.detail),
            },
            ExecutorEvent::Error(error) => {
                log::warn!("[{}] {}", error.client_id, error.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &ExecutorEvent) {
        match event {
            ExecutorEvent::Response(response) => {
                self.metrics
                    .record_response(&response.client_id, response.status, response.latency);
            }
            ExecutorEvent::Rotation(rotation) => self.metrics.record_rotation(&rotation.client_id),
            ExecutorEvent::Retry(retry) => self.metrics.record_retry(&retry.client_id),
            ExecutorEvent::Circuit(circuit) if circuit.state == "open" => {
                self.metrics.record_circuit_open(&circuit.client_id);
            }
            ExecutorEvent::Token(token) => match token.activity {
                TokenActivity::Solved => self.metrics.record_token_solved(),
                TokenActivity::SolveFailed => self.metrics.record_token_failed(),
                _ => {}
            },
            ExecutorEvent::Error(error) => self.metrics.record_error(&error.client_id),
            _ => {}
        }
    }
}
