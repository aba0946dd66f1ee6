//! # resilient-scraper
//!
//! Resilient request execution for scrapers that talk to sites which
//! actively push back on automated traffic.
//!
//! Every request goes through the same pipeline:
//!
//! - A session bound to one egress identity (proxy + browser fingerprint),
//!   rotated on a request-count threshold or when the site blocks it
//! - Per-client pacing with jitter and periodic long pauses
//! - Retry with exponential backoff, and a per-client circuit breaker
//! - A negative cache for requests the site has permanently rejected
//! - For captcha-gated endpoints, a process-wide pool of pre-solved tokens
//!   kept topped up by a supervised background task
//!
//! ## Example
//!
//! ```no_run
//! use resilient_scraper::{RequestExecutor, RequestSpec, ResilienceConfig};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ResilienceConfig::load("resilience.toml".as_ref())?;
//!     let executor = RequestExecutor::new(config)?;
//!
//!     let request = RequestSpec::get(Url::parse("https://example.com/api/cars")?);
//!     let response = executor.execute("marketplace", request, None).await?;
//!     println!("{} -> {}", response.url, response.status);
//!     Ok(())
//! }
//! ```

mod executor;

pub mod config;
pub mod external_deps;
pub mod modules;

pub use crate::executor::{
    ExecutorError,
    ExecutorResult,
    FailureKind,
    RequestExecutor,
    RequestExecutorBuilder,
    StatusSnapshot,
};

pub use crate::config::{
    CaptchaSettings,
    CircuitSettings,
    ConfigError,
    FailureCacheSettings,
    IdentitySettings,
    PacingSettings,
    ResilienceConfig,
    RetrySettings,
    RotationSettings,
    TransportSettings,
};

pub use crate::external_deps::captcha::{
    CapSolverProvider,
    CaptchaConfig,
    CaptchaError,
    CaptchaResult,
    CaptchaSolution,
    CaptchaSolver,
    CaptchaTask,
};

pub use crate::modules::{
    BrowserFingerprint,
    CaptchaField,
    CaptchaPlacement,
    CaptchaToken,
    CircuitStatus,
    EventDispatcher,
    EventHandler,
    ExecutorEvent,
    FailureCacheStats,
    Identity,
    IdentityError,
    LastFailure,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    ProxyEndpoint,
    RawResponse,
    RequestBody,
    RequestSpec,
    ReqwestTransportFactory,
    RotationKind,
    TokenLease,
    TokenOutcome,
    TokenStats,
    Transport,
    TransportError,
    TransportFactory,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
