//! Per-client session lifecycle.
//!
//! Each logical client owns exactly one live session: an identity, a cookie
//! jar and a transport built for that identity. Sessions are rebuilt on
//! request-count thresholds and on block signals. All bookkeeping happens
//! inside one mutex that is never held across a network call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::cookie::Jar;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::RotationSettings;
use crate::modules::identity::{Identity, IdentityPool};
use crate::modules::transport::{RawResponse, RequestSpec, Transport, TransportError, TransportFactory};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to build session transport: {0}")]
    Transport(#[from] TransportError),
}

/// What a rotation replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationKind {
    /// New identity, new cookie jar, new connections.
    Session,
    /// New identity and connections; cookies survive.
    Identity,
}

struct Session {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    cookies: Arc<Jar>,
    request_count: u32,
    identity_request_count: u32,
    generation: u64,
    created_at: Instant,
}

/// Cheap handle to the current session of a client. Holding a handle does
/// not pin the session: a rotation may replace it while a request is in
/// flight, and the next `get_session` returns the replacement.
#[derive(Clone)]
pub struct SessionHandle {
    client_id: String,
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    generation: u64,
}

impl SessionHandle {
    pub async fn send(&self, request: &RequestSpec) -> Result<RawResponse, TransportError> {
        self.transport.send(request).await
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Per-client counter that increases whenever the cookie jar is replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identifies the cookie lineage this handle belongs to.
    pub fn fingerprint(&self) -> String {
        format!("{}#{}", self.client_id, self.generation)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("client_id", &self.client_id)
            .field("identity", &self.identity.tag())
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Default)]
struct ClientEntry {
    session: Option<Session>,
    rotations: u64,
    requests: u64,
    next_generation: u64,
}

/// Session table plus the identity pool it draws from.
pub struct SessionManager {
    pool: Arc<IdentityPool>,
    factory: Arc<dyn TransportFactory>,
    settings: RotationSettings,
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl SessionManager {
    pub fn new(pool: Arc<IdentityPool>, factory: Arc<dyn TransportFactory>, settings: RotationSettings) -> Self {
        Self {
            pool,
            factory,
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClientEntry>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current session for `client_id`, created on first use.
    pub fn get_session(&self, client_id: &str) -> Result<SessionHandle, SessionError> {
        let mut clients = self.lock();
        let entry = clients.entry(client_id.to_string()).or_default();
        if let Some(session) = entry.session.as_ref() {
            return Ok(handle(client_id, session));
        }

        let identity = self.pool.next();
        let session = self.build(entry, identity, Arc::new(Jar::default()))?;
        log::info!(
            "created session for client {client_id} with identity {}",
            session.identity.tag()
        );
        let current = handle(client_id, &session);
        entry.session = Some(session);
        Ok(current)
    }

    /// Count a completed request and apply threshold rotations. Returns the
    /// rotation performed, if any.
    pub fn note_request(&self, client_id: &str) -> Option<RotationKind> {
        let mut clients = self.lock();
        let entry = clients.get_mut(client_id)?;
        entry.requests += 1;

        let session = entry.session.as_mut()?;
        session.request_count += 1;
        session.identity_request_count += 1;

        let kind = if session.request_count >= self.settings.session_rotation_threshold {
            RotationKind::Session
        } else if self.settings.identity_rotation_threshold > 0
            && session.identity_request_count >= self.settings.identity_rotation_threshold
        {
            RotationKind::Identity
        } else {
            return None;
        };

        match self.rotate_entry(client_id, entry, kind) {
            Ok(()) => Some(kind),
            Err(err) => {
                log::warn!("threshold rotation for client {client_id} failed: {err}");
                None
            }
        }
    }

    /// Discard the session and rebuild with a different identity and a fresh
    /// cookie jar.
    pub fn rotate(&self, client_id: &str) -> Result<SessionHandle, SessionError> {
        self.force(client_id, RotationKind::Session)
    }

    /// Rebind a different identity, keeping the cookie jar.
    pub fn rotate_identity(&self, client_id: &str) -> Result<SessionHandle, SessionError> {
        self.force(client_id, RotationKind::Identity)
    }

    fn force(&self, client_id: &str, kind: RotationKind) -> Result<SessionHandle, SessionError> {
        let mut clients = self.lock();
        let entry = clients.entry(client_id.to_string()).or_default();
        if entry.session.is_some() {
            self.rotate_entry(client_id, entry, kind)?;
        } else {
            let identity = self.pool.next();
            let session = self.build(entry, identity, Arc::new(Jar::default()))?;
            entry.session = Some(session);
        }
        entry
            .session
            .as_ref()
            .map(|session| handle(client_id, session))
            .ok_or_else(|| SessionError::Transport(TransportError::Other("session missing after rotation".into())))
    }

    fn rotate_entry(&self, client_id: &str, entry: &mut ClientEntry, kind: RotationKind) -> Result<(), SessionError> {
        let Some(current) = entry.session.as_ref() else {
            return Ok(());
        };
        let previous = current.identity.clone();
        let identity = self.pool.next_excluding(previous.index());
        let cookies = match kind {
            RotationKind::Session => Arc::new(Jar::default()),
            RotationKind::Identity => current.cookies.clone(),
        };
        let age = current.created_at.elapsed();
        let mut replacement = self.build(entry, identity, cookies)?;

        if kind == RotationKind::Identity {
            if let Some(current) = entry.session.as_ref() {
                replacement.request_count = current.request_count;
                replacement.generation = current.generation;
            }
        }

        log::info!(
            "rotated {kind:?} for client {client_id}: {} -> {} after {:?}",
            previous.tag(),
            replacement.identity.tag(),
            age
        );
        entry.session = Some(replacement);
        entry.rotations += 1;
        Ok(())
    }

    fn build(&self, entry: &mut ClientEntry, identity: Arc<Identity>, cookies: Arc<Jar>) -> Result<Session, SessionError> {
        let transport = self.factory.create(&identity, cookies.clone())?;
        let generation = entry.next_generation;
        entry.next_generation += 1;
        Ok(Session {
            identity,
            transport,
            cookies,
            request_count: 0,
            identity_request_count: 0,
            generation,
            created_at: Instant::now(),
        })
    }

    /// Requests counted on the current session (resets on full rotation).
    pub fn session_request_count(&self, client_id: &str) -> u32 {
        self.lock()
            .get(client_id)
            .and_then(|entry| entry.session.as_ref())
            .map(|session| session.request_count)
            .unwrap_or(0)
    }

    /// Requests counted for the client over its lifetime.
    pub fn request_count(&self, client_id: &str) -> u64 {
        self.lock().get(client_id).map(|entry| entry.requests).unwrap_or(0)
    }

    pub fn rotation_count(&self, client_id: &str) -> u64 {
        self.lock().get(client_id).map(|entry| entry.rotations).unwrap_or(0)
    }

    pub fn current_identity(&self, client_id: &str) -> Option<Arc<Identity>> {
        self.lock()
            .get(client_id)
            .and_then(|entry| entry.session.as_ref())
            .map(|session| session.identity.clone())
    }

    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.pool
    }
}

fn handle(client_id: &str, session: &Session) -> SessionHandle {
    SessionHandle {
        client_id: client_id.to_string(),
        identity: session.identity.clone(),
        transport: session.transport.clone(),
        generation: session.generation,
    }
}
