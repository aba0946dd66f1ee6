//! Transport abstraction used by sessions.
//!
//! A [`Transport`] is bound to one identity for its whole life: the identity's
//! proxy and fingerprint headers are baked in when the [`TransportFactory`]
//! builds it. Rotating an identity therefore always means building a new
//! transport.

mod reqwest_client;

pub use reqwest_client::{ReqwestTransport, ReqwestTransportFactory};

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::cookie::Jar;
use thiserror::Error;
use url::Url;

use crate::modules::identity::Identity;

/// Request body variants supported by the executor.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    Bytes(Bytes),
}

impl RequestBody {
    fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match self {
            RequestBody::Form(fields) => {
                let mut pairs: Vec<_> = fields.iter().collect();
                pairs.sort_unstable();
                ("form", pairs).hash(&mut hasher);
            }
            RequestBody::Json(value) => ("json", value.to_string()).hash(&mut hasher),
            RequestBody::Bytes(bytes) => ("bytes", bytes.as_ref()).hash(&mut hasher),
        }
        hasher.finish()
    }
}

/// Where a captcha token is placed in the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaPlacement {
    Query,
    Form,
}

#[derive(Debug, Clone)]
pub struct CaptchaField {
    pub name: String,
    pub placement: CaptchaPlacement,
}

/// Description of one logical request, independent of session and identity.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub captcha: Option<CaptchaField>,
}

impl RequestSpec {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            captcha: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_form<I, K, V>(url: Url, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self::new(Method::POST, url).with_body(RequestBody::Form(fields))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Mark the request as captcha gated; the token goes into `name`.
    pub fn with_captcha_field(mut self, name: impl Into<String>, placement: CaptchaPlacement) -> Self {
        self.captcha = Some(CaptchaField {
            name: name.into(),
            placement,
        });
        self
    }

    /// Copy of this request carrying `token` in its captcha field. Requests
    /// without a captcha field get it as a `captcha` query parameter.
    pub fn with_captcha_token(&self, token: &str) -> Self {
        let mut request = self.clone();
        let field = self.captcha.clone().unwrap_or(CaptchaField {
            name: "captcha".into(),
            placement: CaptchaPlacement::Query,
        });

        match field.placement {
            CaptchaPlacement::Query => {
                request.query.retain(|(k, _)| k != &field.name);
                request.query.push((field.name, token.to_string()));
            }
            CaptchaPlacement::Form => {
                let mut fields = match request.body.take() {
                    Some(RequestBody::Form(fields)) => fields,
                    _ => Vec::new(),
                };
                fields.retain(|(k, _)| k != &field.name);
                fields.push((field.name, token.to_string()));
                request.body = Some(RequestBody::Form(fields));
            }
        }
        request
    }

    /// Stable key for method, URL, query and body. Query and form pairs are
    /// order-insensitive; the body enters as a digest.
    pub fn cache_key(&self) -> String {
        let mut pairs: Vec<(&str, &str)> = self
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        pairs.sort_unstable();
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let mut key = if query.is_empty() {
            format!("{} {}", self.method, self.url)
        } else {
            format!("{} {}?{query}", self.method, self.url)
        };
        if let Some(body) = &self.body {
            key.push_str(&format!(" body:{:016x}", body.digest()));
        }
        key
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Read-only response handed back to collaborators.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub latency: Duration,
}

impl RawResponse {
    pub fn new(status: u16, url: Url) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            url,
            latency: Duration::ZERO,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Lossy UTF-8 view of the body.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("proxy failure: {0}")]
    Proxy(String),
    #[error("failed to build transport: {0}")]
    Build(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Build(_))
    }
}

/// Sends requests on behalf of one identity.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestSpec) -> Result<RawResponse, TransportError>;
}

/// Builds transports for identities. `cookies` is shared across identity-only
/// rotations of one session and replaced on a full rotation.
pub trait TransportFactory: Send + Sync {
    fn create(&self, identity: &Identity, cookies: Arc<Jar>) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://calc.example.org/tks").unwrap()
    }

    #[test]
    fn cache_key_ignores_query_order() {
        let a = RequestSpec::get(url()).with_query("b", "2").with_query("a", "1");
        let b = RequestSpec::get(url()).with_query("a", "1").with_query("b", "2");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "GET https://calc.example.org/tks?a=1&b=2");
    }

    #[test]
    fn cache_key_separates_bodies() {
        let cheap = RequestSpec::post_form(url(), [("price", "10000"), ("year", "2021")]);
        let dear = RequestSpec::post_form(url(), [("price", "25000"), ("year", "2021")]);
        let reordered = RequestSpec::post_form(url(), [("year", "2021"), ("price", "10000")]);
        assert_ne!(cheap.cache_key(), dear.cache_key());
        assert_eq!(cheap.cache_key(), reordered.cache_key());
        assert_ne!(cheap.cache_key(), RequestSpec::new(Method::POST, url()).cache_key());

        let json = |price: u32| {
            RequestSpec::new(Method::POST, url())
                .with_body(RequestBody::Json(serde_json::json!({ "price": price })))
        };
        assert_ne!(json(10_000).cache_key(), json(25_000).cache_key());
    }

    #[test]
    fn token_goes_into_query_field() {
        let spec = RequestSpec::get(url())
            .with_query("cost", "10000")
            .with_captcha_field("captcha", CaptchaPlacement::Query);
        let first = spec.with_captcha_token("tok-1");
        let second = first.with_captcha_token("tok-2");
        let captcha: Vec<_> = second.query.iter().filter(|(k, _)| k == "captcha").collect();
        assert_eq!(captcha.len(), 1);
        assert_eq!(captcha[0].1, "tok-2");
        assert!(spec.query.iter().all(|(k, _)| k != "captcha"));
    }

    #[test]
    fn token_goes_into_form_field() {
        let spec = RequestSpec::post_form(url(), [("mode", "ajax")])
            .with_captcha_field("g-recaptcha-response", CaptchaPlacement::Form);
        let request = spec.with_captcha_token("tok");
        match request.body {
            Some(RequestBody::Form(fields)) => {
                assert!(fields.contains(&("mode".into(), "ajax".into())));
                assert!(fields.contains(&("g-recaptcha-response".into(), "tok".into())));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn build_errors_are_not_transient() {
        assert!(!TransportError::Build("tls".into()).is_transient());
        assert!(TransportError::Timeout("30s".into()).is_transient());
    }
}
