//! Request executor.
//!
//! Wires the identity pool, sessions, pacing, retry/circuit engine, failure
//! cache and captcha token supply into the single entry point used by
//! parsers and business services.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use url::Url;

use crate::config::{ConfigError, ResilienceConfig};
use crate::external_deps::captcha::{CaptchaError, CaptchaSolver, CaptchaTask};
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler, MetricsHandler};
use crate::modules::failure_cache::{FailureCache, FailureCacheStats};
use crate::modules::identity::{Identity, IdentityError, IdentityPool};
use crate::modules::jitter::Jitter;
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::pacing::RateGovernor;
use crate::modules::retry::{CircuitBreaker, CircuitStatus, LastFailure, RetryEngine, RetryError};
use crate::modules::session::{SessionError, SessionHandle, SessionManager};
use crate::modules::token_supply::{TokenOutcome, TokenStats, TokenSupply};
use crate::modules::transport::{
	RawResponse, ReqwestTransportFactory, RequestSpec, TransportError, TransportFactory,
};

/// Result alias used across the executor.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Coarse classification of terminal failures for collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	/// Startup or wiring problem; retrying will not help.
	Configuration,
	/// Circuit open, no captcha token, deadline exceeded: retry later.
	TemporarilyUnavailable,
	/// The target refused this request outright.
	PermanentlyRejected,
	/// Every attempt failed with recoverable errors.
	UpstreamExhausted,
}

/// Terminal failure surfaced by the executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Identity(#[from] IdentityError),
	#[error("circuit open for {client_id}, retry after {retry_after:?}")]
	CircuitOpen {
		client_id: String,
		retry_after: Duration,
	},
	#[error("deadline exceeded")]
	DeadlineExceeded,
	#[error("no captcha token available: {0}")]
	NoTokenAvailable(CaptchaError),
	#[error("request rejected with status {}", .response.status)]
	Rejected {
		response: Box<RawResponse>,
		cached: bool,
	},
	#[error("captcha rejected by the target twice")]
	CaptchaRejected,
	#[error("request failed: {0}")]
	Transport(TransportError),
	#[error("gave up after {attempts} attempts, last failure: {last}")]
	AttemptsExhausted { attempts: u32, last: LastFailure },
	#[error(transparent)]
	Session(#[from] SessionError),
}

impl ExecutorError {
	pub fn kind(&self) -> FailureKind {
		match self {
			ExecutorError::Configuration(_)
			| ExecutorError::Config(_)
			| ExecutorError::Identity(_)
			| ExecutorError::Session(_) => FailureKind::Configuration,
			ExecutorError::Transport(TransportError::Build(_)) => FailureKind::Configuration,
			ExecutorError::CircuitOpen { .. }
			| ExecutorError::DeadlineExceeded
			| ExecutorError::NoTokenAvailable(_) => FailureKind::TemporarilyUnavailable,
			ExecutorError::Rejected { .. }
			| ExecutorError::CaptchaRejected
			| ExecutorError::Transport(_) => FailureKind::PermanentlyRejected,
			ExecutorError::AttemptsExhausted { .. } => FailureKind::UpstreamExhausted,
		}
	}

	/// Status code of a rejected response, if any.
	pub fn status(&self) -> Option<u16> {
		match self {
			ExecutorError::Rejected { response, .. } => Some(response.status),
			ExecutorError::AttemptsExhausted {
				last: LastFailure::Status(status),
				..
			} => Some(*status),
			_ => None,
		}
	}
}

impl From<RetryError> for ExecutorError {
	fn from(err: RetryError) -> Self {
		match err {
			RetryError::CircuitOpen {
				client_id,
				retry_after,
			} => ExecutorError::CircuitOpen {
				client_id,
				retry_after,
			},
			RetryError::Rejected { response } => ExecutorError::Rejected {
				response: Box::new(response),
				cached: false,
			},
			RetryError::Fatal(err) => ExecutorError::Transport(err),
			RetryError::AttemptsExhausted { attempts, last } => {
				ExecutorError::AttemptsExhausted { attempts, last }
			}
			RetryError::Session(err) => ExecutorError::Session(err),
		}
	}
}

/// Read-only health view of one logical client.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
	pub client_id: String,
	pub request_count: u64,
	pub rotation_count: u64,
	pub current_identity_tag: Option<String>,
	/// Identities a rotation could move to right now.
	pub available_identities: usize,
	pub pool_size: usize,
	pub circuit_state: CircuitStatus,
	pub consecutive_failures: u32,
	pub captcha_tokens: Option<TokenStats>,
}

/// Fluent builder for [`RequestExecutor`].
pub struct RequestExecutorBuilder {
	config: ResilienceConfig,
	seed: Option<u64>,
	identities: Option<Vec<Identity>>,
	transport: Option<Arc<dyn TransportFactory>>,
	solver: Option<Arc<dyn CaptchaSolver>>,
	captcha_task: Option<CaptchaTask>,
	handlers: Vec<Arc<dyn EventHandler>>,
	enable_metrics: bool,
}

impl RequestExecutorBuilder {
	pub fn new() -> Self {
		Self {
			config: ResilienceConfig::default(),
			seed: None,
			identities: None,
			transport: None,
			solver: None,
			captcha_task: None,
			handlers: Vec::new(),
			enable_metrics: true,
		}
	}

	pub fn with_config(mut self, config: ResilienceConfig) -> Self {
		self.config = config;
		self
	}

	/// Seed every random delay, making pacing and backoff reproducible.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}

	/// Use these identities instead of the configured `[[identities]]`.
	pub fn with_identities(mut self, identities: Vec<Identity>) -> Self {
		self.identities = Some(identities);
		self
	}

	pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
		self.transport = Some(factory);
		self
	}

	pub fn with_captcha_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
		self.solver = Some(solver);
		self
	}

	/// Captcha to pre-solve. Defaults to `captcha.site_key` / `captcha.page_url`.
	pub fn with_captcha_task(mut self, task: CaptchaTask) -> Self {
		self.captcha_task = Some(task);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.enable_metrics = false;
		self
	}

	pub fn build(self) -> ExecutorResult<RequestExecutor> {
		RequestExecutor::from_builder(self)
	}
}

impl Default for RequestExecutorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Resilient request executor shared by all collaborators of a process.
pub struct RequestExecutor {
	engine: RetryEngine,
	failures: FailureCache,
	tokens: Option<TokenSupply>,
	captcha_invalid: Regex,
	metrics: Option<MetricsCollector>,
	// Last session fingerprint the token pool was bound to, per client.
	token_sessions: Mutex<HashMap<String, String>>,
}

impl RequestExecutor {
	/// Executor over the configured identities with the reqwest transport.
	pub fn new(config: ResilienceConfig) -> ExecutorResult<Self> {
		RequestExecutorBuilder::new().with_config(config).build()
	}

	pub fn builder() -> RequestExecutorBuilder {
		RequestExecutorBuilder::new()
	}

	fn from_builder(builder: RequestExecutorBuilder) -> ExecutorResult<Self> {
		let RequestExecutorBuilder {
			config,
			seed,
			identities,
			transport,
			solver,
			captcha_task,
			handlers,
			enable_metrics,
		} = builder;

		config.validate()?;

		let pool = match identities {
			Some(identities) => IdentityPool::new(identities)?,
			None => IdentityPool::from_settings(&config.identities, config.rotation.allow_direct)?,
		};
		let jitter = Arc::new(match seed {
			Some(seed) => Jitter::seeded(seed),
			None => Jitter::from_entropy(),
		});

		let metrics = enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let factory = transport
			.unwrap_or_else(|| Arc::new(ReqwestTransportFactory::new(config.transport.clone())));
		let sessions = Arc::new(SessionManager::new(
			Arc::new(pool),
			factory,
			config.rotation.clone(),
		));
		let engine = RetryEngine::new(
			config.retry.clone(),
			sessions,
			Arc::new(RateGovernor::new(config.pacing.clone(), jitter.clone())),
			Arc::new(CircuitBreaker::new(config.circuit.clone())),
			jitter.clone(),
			events.clone(),
		);

		let tokens = match solver {
			Some(solver) => {
				let task = match captcha_task {
					Some(task) => task,
					None => captcha_task_from_config(&config)?,
				};
				Some(TokenSupply::new(
					config.captcha.clone(),
					solver,
					task,
					jitter,
					events,
				))
			}
			None => None,
		};

		let captcha_invalid = Regex::new(&config.captcha.invalid_pattern)
			.map_err(|err| ExecutorError::Configuration(err.to_string()))?;

		log::info!(
			"request executor ready: {} identities, captcha {}",
			engine.sessions().pool().len(),
			if tokens.is_some() { "enabled" } else { "disabled" }
		);

		Ok(Self {
			engine,
			failures: FailureCache::new(config.failure_cache.clone()),
			tokens,
			captcha_invalid,
			metrics,
			token_sessions: Mutex::new(HashMap::new()),
		})
	}

	/// Execute one logical request for `client_id`, retrying and rotating as
	/// needed. `deadline` bounds the whole call, including pacing waits and
	/// backoff sleeps.
	pub async fn execute(
		&self,
		client_id: &str,
		request: RequestSpec,
		deadline: Option<Instant>,
	) -> ExecutorResult<RawResponse> {
		if let Some(response) = self.failures.lookup(&request) {
			return Err(ExecutorError::Rejected {
				response: Box::new(response),
				cached: true,
			});
		}

		let request = &request;
		let run = self.engine.execute(client_id, |session: SessionHandle| async move {
			session.send(request).await
		});

		match with_deadline(deadline, run).await? {
			Ok(response) => Ok(response),
			Err(RetryError::Rejected { response }) => {
				self.failures.store(request, &response);
				Err(ExecutorError::Rejected {
					response: Box::new(response),
					cached: false,
				})
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Execute a captcha-gated request: inject a pooled (or freshly solved)
	/// token, and if the site reports the captcha invalid, discard the token
	/// and retry once with another one.
	pub async fn execute_captcha_gated(
		&self,
		client_id: &str,
		request: RequestSpec,
		deadline: Option<Instant>,
	) -> ExecutorResult<RawResponse> {
		let tokens = self.tokens.as_ref().ok_or_else(|| {
			ExecutorError::Configuration("no captcha solver configured".into())
		})?;

		for round in 1..=2 {
			let session = self.bind_tokens_to_session(client_id, tokens)?;
			let token = match tokens.acquire_for(&session) {
				Some(token) => token,
				None => with_deadline(deadline, tokens.solve_inline(Some(&session)))
					.await?
					.map_err(ExecutorError::NoTokenAvailable)?,
			};
			// Released on drop if this future is cancelled mid-request.
			let lease = tokens.lease(token);

			let result = self
				.execute(client_id, request.with_captcha_token(lease.value()), deadline)
				.await;

			match result {
				Ok(response) if self.captcha_invalid.is_match(&response.text()) => {
					log::warn!("captcha token rejected for {client_id} (round {round})");
					lease.settle(TokenOutcome::Rejected);
				}
				Ok(response) => {
					lease.settle(TokenOutcome::Accepted);
					return Ok(response);
				}
				Err(err) => {
					// The site never judged the token.
					lease.settle(TokenOutcome::Accepted);
					return Err(err);
				}
			}
		}

		Err(ExecutorError::CaptchaRejected)
	}

	/// Purge tokens bound to a session the client no longer uses.
	fn bind_tokens_to_session(&self, client_id: &str, tokens: &TokenSupply) -> ExecutorResult<String> {
		let fingerprint = self.engine.sessions().get_session(client_id)?.fingerprint();
		let mut bound = self
			.token_sessions
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		let previous = bound.insert(client_id.to_string(), fingerprint.clone());
		if previous.as_deref() != Some(fingerprint.as_str()) && previous.is_some() {
			tokens.rebind_session(&fingerprint);
		}
		Ok(fingerprint)
	}

	pub fn status(&self, client_id: &str) -> StatusSnapshot {
		let sessions = self.engine.sessions();
		let current = sessions.current_identity(client_id);
		let pool_size = sessions.pool().len();
		let available_identities = match current {
			Some(_) => pool_size.saturating_sub(1).max(1),
			None => pool_size,
		};

		StatusSnapshot {
			client_id: client_id.to_string(),
			request_count: sessions.request_count(client_id),
			rotation_count: sessions.rotation_count(client_id),
			current_identity_tag: current.map(|identity| identity.tag()),
			available_identities,
			pool_size,
			circuit_state: self.engine.circuit().status(client_id),
			consecutive_failures: self.engine.circuit().consecutive_failures(client_id),
			captcha_tokens: self.tokens.as_ref().map(TokenSupply::stats),
		}
	}

	/// Force a full session rotation for `client_id`.
	pub fn rotate(&self, client_id: &str) -> ExecutorResult<()> {
		self.engine.sessions().rotate(client_id)?;
		Ok(())
	}

	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	pub fn token_stats(&self) -> Option<TokenStats> {
		self.tokens.as_ref().map(TokenSupply::stats)
	}

	/// Drop every pooled captcha token; the refill loop replaces them.
	pub fn invalidate_tokens(&self) -> usize {
		self.tokens.as_ref().map(TokenSupply::invalidate_all).unwrap_or(0)
	}

	/// Start pre-solving captcha tokens now instead of on first demand.
	pub fn warm_up(&self) {
		if let Some(tokens) = &self.tokens {
			tokens.ensure_started();
		}
	}

	pub fn failure_cache_stats(&self) -> FailureCacheStats {
		self.failures.stats()
	}

	pub fn clear_failure_cache(&self) {
		self.failures.clear();
	}

	/// Stop background work. The executor stays usable.
	pub fn shutdown(&self) {
		if let Some(tokens) = &self.tokens {
			tokens.shutdown();
		}
	}
}

async fn with_deadline<F: Future>(deadline: Option<Instant>, future: F) -> ExecutorResult<F::Output> {
	match deadline {
		Some(deadline) => timeout_at(deadline, future)
			.await
			.map_err(|_| ExecutorError::DeadlineExceeded),
		None => Ok(future.await),
	}
}

fn captcha_task_from_config(config: &ResilienceConfig) -> ExecutorResult<CaptchaTask> {
	let (Some(site_key), Some(page_url)) = (&config.captcha.site_key, &config.captcha.page_url) else {
		return Err(ExecutorError::Configuration(
			"captcha solver given without a task or captcha.site_key/page_url".into(),
		));
	};
	let page_url = Url::parse(page_url)
		.map_err(|err| ExecutorError::Configuration(format!("captcha.page_url: {err}")))?;
	Ok(CaptchaTask::new(site_key.clone(), page_url))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn failure_kinds() {
		assert_eq!(
			ExecutorError::DeadlineExceeded.kind(),
			FailureKind::TemporarilyUnavailable
		);
		assert_eq!(
			ExecutorError::CaptchaRejected.kind(),
			FailureKind::PermanentlyRejected
		);
		assert_eq!(
			ExecutorError::Transport(TransportError::Build("tls".into())).kind(),
			FailureKind::Configuration
		);
		assert_eq!(
			ExecutorError::AttemptsExhausted {
				attempts: 3,
				last: LastFailure::Status(503),
			}
			.kind(),
			FailureKind::UpstreamExhausted
		);
	}

	#[test]
	fn empty_identity_pool_fails_at_build() {
		let err = RequestExecutor::new(ResilienceConfig::default()).err().unwrap();
		assert_eq!(err.kind(), FailureKind::Configuration);
		assert!(matches!(err, ExecutorError::Identity(IdentityError::EmptyPool)));
	}

	#[test]
	fn solver_without_task_is_a_configuration_error() {
		let config = ResilienceConfig::default();
		assert!(matches!(
			captcha_task_from_config(&config),
			Err(ExecutorError::Configuration(_))
		));
	}
}
