//! Reqwest-backed implementation of the `Transport` trait.
//!
//! One `reqwest::Client` per identity: the proxy, the fingerprint headers and
//! the session cookie jar are fixed at build time. A semaphore shared by every
//! transport from the same factory caps concurrent connections.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::{Client, Proxy, redirect::Policy};
use tokio::sync::Semaphore;

use super::{RawResponse, RequestBody, RequestSpec, Transport, TransportError, TransportFactory};
use crate::config::TransportSettings;
use crate::modules::identity::Identity;

/// Builds [`ReqwestTransport`]s from shared transport settings.
#[derive(Debug, Clone)]
pub struct ReqwestTransportFactory {
    settings: TransportSettings,
    permits: Arc<Semaphore>,
}

impl ReqwestTransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_connections.max(1)));
        Self { settings, permits }
    }
}

impl Default for ReqwestTransportFactory {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn create(&self, identity: &Identity, cookies: Arc<Jar>) -> Result<Arc<dyn Transport>, TransportError> {
        let mut builder = Client::builder()
            .cookie_provider(cookies)
            .default_headers(identity.fingerprint().headers.clone())
            .connect_timeout(self.settings.connect_timeout())
            .timeout(self.settings.request_timeout())
            .pool_max_idle_per_host(self.settings.max_idle_per_host)
            .pool_idle_timeout(self.settings.idle_timeout())
            .redirect(Policy::limited(self.settings.max_redirects));

        if let Some(endpoint) = identity.proxy() {
            let mut proxy =
                Proxy::all(endpoint.url.as_str()).map_err(|err| TransportError::Build(err.to_string()))?;
            if let Some(username) = endpoint.username.as_deref() {
                proxy = proxy.basic_auth(username, endpoint.password.as_deref().unwrap_or_default());
            }
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Build(err.to_string()))?;

        log::debug!("built transport for identity {}", identity.tag());

        Ok(Arc::new(ReqwestTransport {
            client,
            permits: self.permits.clone(),
            connect_retries: self.settings.connect_retries,
            proxied: identity.proxy().is_some(),
        }))
    }
}

/// Transport for a single identity.
pub struct ReqwestTransport {
    client: Client,
    permits: Arc<Semaphore>,
    connect_retries: u32,
    proxied: bool,
}

impl ReqwestTransport {
    fn build_request(&self, request: &RequestSpec) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        match &request.body {
            Some(RequestBody::Form(fields)) => builder.form(fields),
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes.clone()),
            None => builder,
        }
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() && self.proxied {
            // Through a proxy, a failed connect means the proxy hop failed.
            TransportError::Proxy(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::Build(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestSpec) -> Result<RawResponse, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| TransportError::Other(err.to_string()))?;

        let started = Instant::now();
        let mut connect_attempt = 0;
        let response = loop {
            match self.build_request(request).send().await {
                Ok(response) => break response,
                Err(err) if err.is_connect() && connect_attempt < self.connect_retries => {
                    connect_attempt += 1;
                    log::debug!(
                        "connect to {} failed, retrying ({connect_attempt}/{})",
                        request.host(),
                        self.connect_retries
                    );
                }
                Err(err) => return Err(self.classify(err)),
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|err| self.classify(err))?;

        Ok(RawResponse {
            status,
            headers,
            body,
            url,
            latency: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::identity::BrowserFingerprint;

    #[tokio::test]
    async fn connection_cap_is_shared_by_every_transport() {
        let factory = ReqwestTransportFactory::new(TransportSettings {
            max_connections: 2,
            ..TransportSettings::default()
        });
        let identity = Identity::direct("direct-0", BrowserFingerprint::from_catalogue(0).unwrap());

        let first = factory.create(&identity, Arc::new(Jar::default())).unwrap();
        let second = factory.create(&identity, Arc::new(Jar::default())).unwrap();

        // One semaphore: the factory's plus one handle per transport.
        assert_eq!(Arc::strong_count(&factory.permits), 3);
        assert_eq!(factory.permits.available_permits(), 2);
        drop((first, second));
        assert_eq!(Arc::strong_count(&factory.permits), 1);
    }
}
