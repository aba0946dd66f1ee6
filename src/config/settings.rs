//! Configuration types and loading.
//!
//! All durations are expressed as millisecond integers in TOML and exposed as
//! [`Duration`] through accessor methods. Every field has a default, so an
//! empty document is a valid configuration (apart from the identity list,
//! which is checked when the executor is built).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub pacing: PacingSettings,
    pub rotation: RotationSettings,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    pub captcha: CaptchaSettings,
    pub transport: TransportSettings,
    pub failure_cache: FailureCacheSettings,
    pub identities: Vec<IdentitySettings>,
}

/// Inter-request spacing for one logical client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    pub min_interval_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Take a long pause every this many requests. Zero disables it.
    pub long_pause_every: u32,
    pub long_pause_min_ms: u64,
    pub long_pause_max_ms: u64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            jitter_min_ms: 0,
            jitter_max_ms: 100,
            long_pause_every: 20,
            long_pause_min_ms: 1_000,
            long_pause_max_ms: 3_000,
        }
    }
}

impl PacingSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn jitter_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.jitter_min_ms),
            Duration::from_millis(self.jitter_max_ms),
        )
    }

    pub fn long_pause_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.long_pause_min_ms),
            Duration::from_millis(self.long_pause_max_ms),
        )
    }

    /// No spacing, no jitter, no pauses.
    pub fn unpaced() -> Self {
        Self {
            min_interval_ms: 0,
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            long_pause_every: 0,
            long_pause_min_ms: 0,
            long_pause_max_ms: 0,
        }
    }
}

/// Session and identity rotation thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// Rebuild the whole session (cookies, connections, identity) after this many requests.
    pub session_rotation_threshold: u32,
    /// Rebind a new identity, keeping cookies, after this many requests. Zero disables it.
    pub identity_rotation_threshold: u32,
    /// Build proxy-less identities from the user-agent catalogue when none are configured.
    pub allow_direct: bool,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            session_rotation_threshold: 50,
            identity_rotation_threshold: 15,
            allow_direct: false,
        }
    }
}

/// Retry and backoff policy for a single logical request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,
    pub block_cooloff_min_ms: u64,
    pub block_cooloff_max_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_jitter_ms: 500,
            block_cooloff_min_ms: 3_000,
            block_cooloff_max_ms: 5_000,
        }
    }
}

impl RetrySettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_jitter(&self) -> Duration {
        Duration::from_millis(self.backoff_jitter_ms)
    }

    pub fn block_cooloff_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.block_cooloff_min_ms),
            Duration::from_millis(self.block_cooloff_max_ms),
        )
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown_ms: 10_000,
        }
    }
}

impl CircuitSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Captcha token pool and solver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    pub token_ttl_ms: u64,
    pub max_uses: u32,
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub solve_timeout_ms: u64,
    pub solver_backoff_min_ms: u64,
    pub solver_backoff_max_ms: u64,
    /// How often an idle refill loop re-checks the pool for expired tokens.
    pub refill_check_interval_ms: u64,
    /// Regex matched against response bodies to detect a rejected token.
    pub invalid_pattern: String,
    pub site_key: Option<String>,
    pub page_url: Option<String>,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            token_ttl_ms: 5 * 60 * 1_000,
            max_uses: 3,
            low_watermark: 2,
            high_watermark: 5,
            solve_timeout_ms: 120_000,
            solver_backoff_min_ms: 5_000,
            solver_backoff_max_ms: 10_000,
            refill_check_interval_ms: 1_000,
            invalid_pattern: DEFAULT_CAPTCHA_INVALID_PATTERN.to_string(),
            site_key: None,
            page_url: None,
        }
    }
}

/// Matches "invalid captcha", "captcha expired", "incorrect captcha" and similar.
pub const DEFAULT_CAPTCHA_INVALID_PATTERN: &str =
    r"(?is)(captcha.{0,40}(invalid|incorrect|expired|failed|wrong))|((invalid|incorrect|expired|failed|wrong).{0,40}captcha)";

impl CaptchaSettings {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }

    pub fn solve_timeout(&self) -> Duration {
        Duration::from_millis(self.solve_timeout_ms)
    }

    pub fn solver_backoff_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.solver_backoff_min_ms),
            Duration::from_millis(self.solver_backoff_max_ms),
        )
    }

    pub fn refill_check_interval(&self) -> Duration {
        Duration::from_millis(self.refill_check_interval_ms)
    }
}

/// Connection handling for the reqwest transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Idle connections kept per host.
    pub max_idle_per_host: usize,
    /// Concurrent in-flight requests across every session built by one
    /// transport factory.
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub max_redirects: usize,
    /// Immediate retries when a connection cannot be established.
    pub connect_retries: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_idle_per_host: 20,
            max_connections: 100,
            idle_timeout_ms: 90_000,
            max_redirects: 3,
            connect_retries: 2,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Negative cache for non-retryable responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailureCacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
    pub not_found_ttl_ms: u64,
    pub client_error_ttl_ms: u64,
}

impl Default for FailureCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 500,
            not_found_ttl_ms: 300_000,
            client_error_ttl_ms: 60_000,
        }
    }
}

/// One configured egress identity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub label: Option<String>,
    /// Proxy URL, e.g. `http://pr.example.net:7777`. `None` means a direct connection.
    pub proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub geo: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ResilienceConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ResilienceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn range(name: &str, min: u64, max: u64) -> Result<(), ConfigError> {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "{name}: minimum {min}ms exceeds maximum {max}ms"
                )));
            }
            Ok(())
        }

        range("pacing.jitter", self.pacing.jitter_min_ms, self.pacing.jitter_max_ms)?;
        range(
            "pacing.long_pause",
            self.pacing.long_pause_min_ms,
            self.pacing.long_pause_max_ms,
        )?;
        range(
            "retry.block_cooloff",
            self.retry.block_cooloff_min_ms,
            self.retry.block_cooloff_max_ms,
        )?;
        range(
            "captcha.solver_backoff",
            self.captcha.solver_backoff_min_ms,
            self.captcha.solver_backoff_max_ms,
        )?;

        if self.rotation.session_rotation_threshold == 0 {
            return Err(ConfigError::Invalid(
                "rotation.session_rotation_threshold must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit.failure_threshold must be greater than 0".into(),
            ));
        }
        if self.captcha.max_uses == 0 {
            return Err(ConfigError::Invalid(
                "captcha.max_uses must be greater than 0".into(),
            ));
        }
        if self.captcha.high_watermark == 0 || self.captcha.high_watermark < self.captcha.low_watermark {
            return Err(ConfigError::Invalid(format!(
                "captcha.high_watermark ({}) must be positive and not below low_watermark ({})",
                self.captcha.high_watermark, self.captcha.low_watermark
            )));
        }
        if self.captcha.refill_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "captcha.refill_check_interval_ms must be greater than 0".into(),
            ));
        }
        if let Err(err) = regex::Regex::new(&self.captcha.invalid_pattern) {
            return Err(ConfigError::Invalid(format!(
                "captcha.invalid_pattern is not a valid regex: {err}"
            )));
        }
        if self.transport.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_connections must be greater than 0".into(),
            ));
        }
        if self.failure_cache.enabled && self.failure_cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "failure_cache.max_entries must be greater than 0 when enabled".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ResilienceConfig::from_toml_str("").unwrap();
        assert_eq!(config.pacing.min_interval(), Duration::from_millis(500));
        assert_eq!(config.rotation.session_rotation_threshold, 50);
        assert_eq!(config.rotation.identity_rotation_threshold, 15);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.captcha.token_ttl(), Duration::from_secs(300));
        assert_eq!(config.captcha.max_uses, 3);
        assert_eq!((config.captcha.low_watermark, config.captcha.high_watermark), (2, 5));
        assert!(config.identities.is_empty());
    }

    #[test]
    fn parses_sections_and_identities() {
        let toml = r#"
[pacing]
min_interval_ms = 250
long_pause_every = 0

[circuit]
failure_threshold = 3
cooldown_ms = 2000

[[identities]]
label = "kr-1"
proxy = "http://pr.example.net:7777"
username = "customer-kr"
password = "secret"
geo = "KR"

[[identities]]
label = "direct"
"#;
        let config = ResilienceConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.pacing.min_interval(), Duration::from_millis(250));
        assert_eq!(config.pacing.long_pause_every, 0);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.circuit.cooldown(), Duration::from_secs(2));
        assert_eq!(config.identities.len(), 2);
        assert_eq!(config.identities[0].geo.as_deref(), Some("KR"));
        assert!(config.identities[1].proxy.is_none());
    }

    #[test]
    fn rejects_inverted_ranges() {
        let toml = r#"
[retry]
block_cooloff_min_ms = 5000
block_cooloff_max_ms = 1000
"#;
        let err = ResilienceConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("block_cooloff")));
    }

    #[test]
    fn rejects_watermarks_out_of_order() {
        let toml = r#"
[captcha]
low_watermark = 4
high_watermark = 2
"#;
        assert!(matches!(
            ResilienceConfig::from_toml_str(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut config = ResilienceConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_invalid_pattern_matches_typical_messages() {
        let re = regex::Regex::new(DEFAULT_CAPTCHA_INVALID_PATTERN).unwrap();
        assert!(re.is_match("Error: invalid captcha, please retry"));
        assert!(re.is_match("{\"error\":\"CAPTCHA expired\"}"));
        assert!(!re.is_match("<table>duty: 15%</table>"));
    }
}
