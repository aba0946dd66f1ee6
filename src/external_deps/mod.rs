//! Integrations that rely on third-party services.
//!
//! Currently the captcha solving providers that feed the token supply.

pub mod captcha;
