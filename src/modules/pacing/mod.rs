//! Per-client request pacing.
//!
//! Every caller of a logical client reserves its send slot under that
//! client's async mutex, then sleeps outside of it. Tokio's mutex hands out
//! the lock in FIFO order, so slot order equals arrival order, and clients
//! never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Instant, sleep_until};

use crate::config::PacingSettings;
use crate::modules::jitter::Jitter;

#[derive(Debug, Default)]
struct RateState {
    last_request: Option<Instant>,
    since_pause: u32,
}

/// Snapshot of one client's pacing state.
#[derive(Debug, Clone, Copy)]
pub struct PacingSnapshot {
    pub last_request: Option<Instant>,
    pub since_pause: u32,
}

pub struct RateGovernor {
    settings: PacingSettings,
    jitter: Arc<Jitter>,
    clients: Mutex<HashMap<String, Arc<AsyncMutex<RateState>>>>,
}

impl RateGovernor {
    pub fn new(settings: PacingSettings, jitter: Arc<Jitter>) -> Self {
        Self {
            settings,
            jitter,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn state_for(&self, client_id: &str) -> Arc<AsyncMutex<RateState>> {
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clients
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(RateState::default())))
            .clone()
    }

    /// Wait until `client_id` may send its next request. Dropping the
    /// returned future cancels the wait; the reserved slot still counts
    /// toward spacing of later callers.
    pub async fn await_turn(&self, client_id: &str) {
        let send_at = self.reserve(client_id).await;
        sleep_until(send_at).await;
    }

    async fn reserve(&self, client_id: &str) -> Instant {
        let state = self.state_for(client_id);
        let mut state = state.lock().await;

        let now = Instant::now();
        let earliest = match state.last_request {
            Some(last) => now.max(last + self.settings.min_interval()),
            None => now,
        };

        let (jitter_min, jitter_max) = self.settings.jitter_range();
        let mut send_at = earliest + self.jitter.between(jitter_min, jitter_max);

        state.since_pause += 1;
        if self.settings.long_pause_every > 0 && state.since_pause >= self.settings.long_pause_every {
            let (pause_min, pause_max) = self.settings.long_pause_range();
            let pause = self.jitter.between(pause_min, pause_max);
            log::debug!("client {client_id}: long pause of {pause:?}");
            send_at += pause;
            state.since_pause = 0;
        }

        state.last_request = Some(send_at);

        let wait = send_at.saturating_duration_since(now);
        if wait > Duration::ZERO {
            log::trace!("client {client_id}: waiting {wait:?} for next slot");
        }
        send_at
    }

    pub async fn snapshot(&self, client_id: &str) -> PacingSnapshot {
        let state = self.state_for(client_id);
        let state = state.lock().await;
        PacingSnapshot {
            last_request: state.last_request,
            since_pause: state.since_pause,
        }
    }
}
