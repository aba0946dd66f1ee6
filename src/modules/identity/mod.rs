//! Egress identity pool.
//!
//! An identity pairs a proxy endpoint with a browser fingerprint. The pool is
//! a fixed, ordered set built once at startup and cycled index by index, so
//! the rotation sequence is deterministic and auditable.

mod fingerprint;

pub use fingerprint::{BrowserFingerprint, USER_AGENT_CATALOGUE};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use url::Url;

use crate::config::IdentitySettings;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity pool is empty")]
    EmptyPool,
    #[error("invalid proxy url '{0}'")]
    InvalidProxy(String),
    #[error("invalid header value '{0}'")]
    InvalidHeader(String),
}

/// Proxy endpoint with optional credentials. Credentials never appear in
/// `Debug` output or logs.
#[derive(Clone)]
pub struct ProxyEndpoint {
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let url = Url::parse(raw).map_err(|_| IdentityError::InvalidProxy(raw.to_string()))?;
        Ok(Self {
            url,
            username: None,
            password: None,
        })
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port` for logs.
    pub fn authority(&self) -> String {
        match (self.url.host_str(), self.url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => self.url.as_str().to_string(),
        }
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("endpoint", &self.authority())
            .field("authenticated", &self.username.is_some())
            .finish()
    }
}

/// One browsing client as presented to the target site. Immutable.
#[derive(Debug, Clone)]
pub struct Identity {
    index: usize,
    label: String,
    proxy: Option<ProxyEndpoint>,
    geo: Option<String>,
    fingerprint: BrowserFingerprint,
}

impl Identity {
    pub fn new(
        label: impl Into<String>,
        proxy: Option<ProxyEndpoint>,
        geo: Option<String>,
        fingerprint: BrowserFingerprint,
    ) -> Self {
        Self {
            index: 0,
            label: label.into(),
            proxy,
            geo,
            fingerprint,
        }
    }

    pub fn direct(label: impl Into<String>, fingerprint: BrowserFingerprint) -> Self {
        Self::new(label, None, None, fingerprint)
    }

    fn from_settings(index: usize, settings: &IdentitySettings) -> Result<Self, IdentityError> {
        let proxy = match settings.proxy.as_deref() {
            Some(raw) => {
                let mut endpoint = ProxyEndpoint::parse(raw)?;
                if let Some(ref username) = settings.username {
                    endpoint = endpoint
                        .with_credentials(username, settings.password.clone().unwrap_or_default());
                }
                Some(endpoint)
            }
            None => None,
        };

        let fingerprint = match settings.user_agent.as_deref() {
            Some(ua) => BrowserFingerprint::for_user_agent(ua)?,
            None => BrowserFingerprint::from_catalogue(index)?,
        };

        let label = settings.label.clone().unwrap_or_else(|| match &proxy {
            Some(endpoint) => format!("proxy-{index}@{}", endpoint.authority()),
            None => format!("direct-{index}"),
        });

        Ok(Self::new(label, proxy, settings.geo.clone(), fingerprint))
    }

    /// Position in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.proxy.as_ref()
    }

    pub fn geo(&self) -> Option<&str> {
        self.geo.as_deref()
    }

    pub fn fingerprint(&self) -> &BrowserFingerprint {
        &self.fingerprint
    }

    /// Label plus geo tag, e.g. `kr-1 (KR)`.
    pub fn tag(&self) -> String {
        match &self.geo {
            Some(geo) => format!("{} ({geo})", self.label),
            None => self.label.clone(),
        }
    }
}

/// Fixed ordered identity set with a shared rotation cursor.
#[derive(Debug)]
pub struct IdentityPool {
    identities: Vec<Arc<Identity>>,
    cursor: AtomicUsize,
}

impl IdentityPool {
    /// Build a pool. An empty set is a startup error, never a request-time one.
    pub fn new(identities: Vec<Identity>) -> Result<Self, IdentityError> {
        if identities.is_empty() {
            return Err(IdentityError::EmptyPool);
        }
        let identities = identities
            .into_iter()
            .enumerate()
            .map(|(index, mut identity)| {
                identity.index = index;
                Arc::new(identity)
            })
            .collect();
        Ok(Self {
            identities,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Build from configuration. With no configured identities and
    /// `allow_direct`, one proxy-less identity per catalogue user-agent is used.
    pub fn from_settings(settings: &[IdentitySettings], allow_direct: bool) -> Result<Self, IdentityError> {
        let identities = if settings.is_empty() && allow_direct {
            (0..USER_AGENT_CATALOGUE.len())
                .map(|index| {
                    BrowserFingerprint::from_catalogue(index)
                        .map(|fp| Identity::direct(format!("direct-{index}"), fp))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            settings
                .iter()
                .enumerate()
                .map(|(index, entry)| Identity::from_settings(index, entry))
                .collect::<Result<Vec<_>, _>>()?
        };

        let pool = Self::new(identities)?;
        log::info!("identity pool initialised with {} identities", pool.len());
        Ok(pool)
    }

    /// Next identity in order, wrapping at the end.
    pub fn next(&self) -> Arc<Identity> {
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % self.identities.len();
        self.identities[position].clone()
    }

    /// Next identity in order whose position differs from `current`. With a
    /// single-identity pool the only identity is returned.
    pub fn next_excluding(&self, current: usize) -> Arc<Identity> {
        let mut candidate = self.next();
        for _ in 1..self.identities.len() {
            if candidate.index() != current {
                break;
            }
            candidate = self.next();
        }
        candidate
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Identity>> {
        self.identities.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> IdentityPool {
        let identities = (0..n)
            .map(|i| Identity::direct(format!("id-{i}"), BrowserFingerprint::from_catalogue(i).unwrap()))
            .collect();
        IdentityPool::new(identities).unwrap()
    }

    #[test]
    fn cycles_in_order_and_wraps() {
        let pool = pool_of(3);
        let labels: Vec<String> = (0..7).map(|_| pool.next().label().to_string()).collect();
        assert_eq!(labels, ["id-0", "id-1", "id-2", "id-0", "id-1", "id-2", "id-0"]);
    }

    #[test]
    fn empty_pool_is_a_configuration_error() {
        assert!(matches!(IdentityPool::new(Vec::new()), Err(IdentityError::EmptyPool)));
        assert!(matches!(
            IdentityPool::from_settings(&[], false),
            Err(IdentityError::EmptyPool)
        ));
    }

    #[test]
    fn direct_fallback_uses_catalogue() {
        let pool = IdentityPool::from_settings(&[], true).unwrap();
        assert_eq!(pool.len(), USER_AGENT_CATALOGUE.len());
        assert!(pool.next().proxy().is_none());
    }

    #[test]
    fn next_excluding_skips_current() {
        let pool = pool_of(2);
        let first = pool.next();
        // Cursor now points at index 1, then wraps to 0.
        for _ in 0..5 {
            let current = pool.next_excluding(first.index());
            assert_ne!(current.index(), first.index());
            pool.next();
        }
    }

    #[test]
    fn single_identity_pool_returns_itself() {
        let pool = pool_of(1);
        assert_eq!(pool.next_excluding(0).index(), 0);
    }

    #[test]
    fn settings_with_credentials_hide_password() {
        let settings = vec![IdentitySettings {
            label: Some("kr-1".into()),
            proxy: Some("http://pr.example.net:7777".into()),
            username: Some("customer-kr".into()),
            password: Some("hunter2".into()),
            geo: Some("KR".into()),
            user_agent: None,
        }];
        let pool = IdentityPool::from_settings(&settings, false).unwrap();
        let identity = pool.next();
        assert_eq!(identity.tag(), "kr-1 (KR)");
        let proxy = identity.proxy().unwrap();
        assert_eq!(proxy.authority(), "pr.example.net:7777");
        assert_eq!(proxy.password.as_deref(), Some("hunter2"));
        assert!(!format!("{identity:?}").contains("hunter2"));
    }

    #[test]
    fn rejects_malformed_proxy() {
        let settings = vec![IdentitySettings {
            proxy: Some("not a url".into()),
            ..Default::default()
        }];
        assert!(matches!(
            IdentityPool::from_settings(&settings, false),
            Err(IdentityError::InvalidProxy(_))
        ));
    }
}
