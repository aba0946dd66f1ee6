//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - TOML loading with per-field defaults
//! - Validation at startup
//! - Granular, per-subsystem sections injected by value

pub mod settings;

pub use settings::{
    CaptchaSettings, CircuitSettings, ConfigError, FailureCacheSettings, IdentitySettings,
    PacingSettings, ResilienceConfig, RetrySettings, RotationSettings, TransportSettings,
};
