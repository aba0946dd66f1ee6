//! Cross-cutting services module
//!
//! The building blocks behind the request executor: identities and
//! sessions, pacing, retry and circuit breaking, the captcha token supply,
//! the failure cache, and the event/metrics plumbing that observes them.

pub mod events;
pub mod failure_cache;
pub mod identity;
pub mod jitter;
pub mod metrics;
pub mod pacing;
pub mod retry;
pub mod session;
pub mod token_supply;
pub mod transport;

// Re-export commonly used types
pub use events::{
    AttemptEvent, CircuitEvent, ErrorEvent, EventDispatcher, EventHandler, ExecutorEvent,
    LoggingHandler, MetricsHandler, ResponseEvent, RetryEvent, RotationEvent, TokenActivity,
    TokenEvent,
};
pub use failure_cache::{FailureCache, FailureCacheStats};
pub use identity::{BrowserFingerprint, Identity, IdentityError, IdentityPool, ProxyEndpoint};
pub use jitter::Jitter;
pub use metrics::{ClientStats, GlobalStats, MetricsCollector, MetricsSnapshot};
pub use pacing::{PacingSnapshot, RateGovernor};
pub use retry::{
    CircuitBreaker, CircuitStatus, LastFailure, Outcome, RetryEngine, RetryError,
};
pub use session::{RotationKind, SessionError, SessionHandle, SessionManager};
pub use token_supply::{CaptchaToken, TokenLease, TokenOutcome, TokenStats, TokenSupply};
pub use transport::{
    CaptchaField, CaptchaPlacement, RawResponse, RequestBody, RequestSpec, ReqwestTransport,
    ReqwestTransportFactory, Transport, TransportError, TransportFactory,
};
