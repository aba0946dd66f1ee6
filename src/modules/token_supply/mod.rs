//! Captcha token supply.
//!
//! Keeps a bounded pool of pre-solved captcha tokens. A supervised background
//! task refills the pool through a [`CaptchaSolver`] whenever it drops below
//! the low watermark, filling back up to the high watermark. Callers acquire
//! a token for one submission and release it with the site's verdict.
//!
//! Every pool mutation happens under one mutex that is never held across a
//! solve or a sleep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, sleep, timeout};

use crate::config::CaptchaSettings;
use crate::external_deps::captcha::{CaptchaError, CaptchaSolver, CaptchaTask};
use crate::modules::events::{EventDispatcher, TokenActivity};
use crate::modules::jitter::Jitter;

/// A pre-solved captcha credential as handed to a caller.
#[derive(Debug, Clone)]
pub struct CaptchaToken {
    id: u64,
    pub value: String,
    pub created_at: Instant,
    /// Uses including the one this copy was acquired for.
    pub use_count: u32,
    pub max_uses: u32,
    pub bound_session: Option<String>,
}

impl CaptchaToken {
    pub fn is_valid(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() < ttl && self.use_count < self.max_uses
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// A token held by one caller until [`settle`](TokenLease::settle) reports
/// the site's verdict. A lease dropped unsettled, for example by a cancelled
/// request, hands the token back as if accepted.
pub struct TokenLease<'a> {
    supply: &'a TokenSupply,
    token: Option<CaptchaToken>,
}

impl TokenLease<'_> {
    pub fn value(&self) -> &str {
        self.token.as_ref().map(|token| token.value.as_str()).unwrap_or_default()
    }

    pub fn settle(mut self, outcome: TokenOutcome) {
        if let Some(token) = self.token.take() {
            self.supply.release(&token, outcome);
        }
    }
}

impl Drop for TokenLease<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            log::debug!("captcha token abandoned after {} uses, returning it", token.use_count);
            self.supply.release(&token, TokenOutcome::Accepted);
        }
    }
}

/// Site verdict for a submitted token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenStats {
    pub available: usize,
    pub in_use: usize,
    pub pending: usize,
    pub solved_total: u64,
    pub failed_total: u64,
    pub discarded_total: u64,
    pub refill_running: bool,
}

#[derive(Debug)]
struct PooledToken {
    token: CaptchaToken,
    in_use: bool,
}

#[derive(Debug, Default)]
struct TokenPool {
    // Oldest first.
    tokens: Vec<PooledToken>,
    pending: usize,
    filling: bool,
    solved_total: u64,
    failed_total: u64,
    discarded_total: u64,
}

impl TokenPool {
    fn size(&self) -> usize {
        self.tokens.len() + self.pending
    }

    /// Drop expired tokens, held or not, and exhausted tokens nobody holds.
    fn purge(&mut self, ttl: Duration) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|entry| {
            entry.token.created_at.elapsed() < ttl && (entry.in_use || entry.token.use_count < entry.token.max_uses)
        });
        let purged = before - self.tokens.len();
        self.discarded_total += purged as u64;
        purged
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.tokens.len();
        self.tokens.retain(|entry| entry.token.id != id);
        let removed = before != self.tokens.len();
        if removed {
            self.discarded_total += 1;
        }
        removed
    }
}

struct Shared {
    settings: CaptchaSettings,
    solver: Arc<dyn CaptchaSolver>,
    task: CaptchaTask,
    jitter: Arc<Jitter>,
    events: Arc<EventDispatcher>,
    pool: Mutex<TokenPool>,
    wake: Notify,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TokenPool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mint(&self, value: String, session: Option<&str>) -> CaptchaToken {
        CaptchaToken {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            value,
            created_at: Instant::now(),
            use_count: 0,
            max_uses: self.settings.max_uses,
            bound_session: session.map(str::to_string),
        }
    }

    /// Decide under the lock whether the loop should solve another token,
    /// reserving a pending slot if so.
    fn reserve_solve(&self) -> bool {
        let mut pool = self.lock();
        let purged = pool.purge(self.settings.token_ttl());
        if purged > 0 {
            log::debug!("purged {purged} expired or exhausted captcha tokens");
        }

        let size = pool.size();
        if size < self.settings.low_watermark {
            pool.filling = true;
        }
        if size >= self.settings.high_watermark {
            pool.filling = false;
        }
        if pool.filling {
            pool.pending += 1;
            true
        } else {
            false
        }
    }

    fn insert_solved(&self, value: String) {
        let token = self.mint(value, None);
        let mut pool = self.lock();
        pool.pending = pool.pending.saturating_sub(1);
        pool.solved_total += 1;
        pool.tokens.push(PooledToken { token, in_use: false });
        let available = pool.tokens.len();
        drop(pool);
        self.events
            .token(TokenActivity::Solved, format!("pool size {available}"));
    }

    fn abandon_pending(&self, err: &CaptchaError) {
        let mut pool = self.lock();
        pool.pending = pool.pending.saturating_sub(1);
        pool.failed_total += 1;
        drop(pool);
        self.events.token(TokenActivity::SolveFailed, err.to_string());
    }

    async fn solve_once(&self) -> Result<String, CaptchaError> {
        match timeout(self.settings.solve_timeout(), self.solver.solve(&self.task)).await {
            Ok(Ok(solution)) => Ok(solution.token),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CaptchaError::Timeout(self.settings.solve_timeout())),
        }
    }
}

async fn refill_loop(shared: Arc<Shared>) {
    log::info!(
        "captcha refill loop started (watermarks {}/{})",
        shared.settings.low_watermark,
        shared.settings.high_watermark
    );
    loop {
        if !shared.reserve_solve() {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = sleep(shared.settings.refill_check_interval()) => {}
            }
            continue;
        }

        match shared.solve_once().await {
            Ok(value) => shared.insert_solved(value),
            Err(err) => {
                log::warn!("captcha solver {} failed: {err}", shared.solver.name());
                shared.abandon_pending(&err);
                let (min, max) = shared.settings.solver_backoff_range();
                sleep(shared.jitter.between(min, max)).await;
            }
        }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keeps the refill loop alive: an unexpected exit or panic is logged and
/// the loop is restarted after the solver back-off.
async fn supervise(shared: Arc<Shared>) {
    loop {
        let mut worker = tokio::spawn(refill_loop(shared.clone()));
        let _guard = AbortOnDrop(worker.abort_handle());

        match (&mut worker).await {
            Ok(()) => log::error!("captcha refill loop exited unexpectedly, restarting"),
            Err(err) if err.is_panic() => log::error!("captcha refill loop panicked, restarting"),
            Err(_) => return,
        }

        // Unresolved solves died with the worker.
        shared.lock().pending = 0;
        let (min, _) = shared.settings.solver_backoff_range();
        sleep(min).await;
    }
}

/// Process-wide token pool plus its supervised refill task.
pub struct TokenSupply {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TokenSupply {
    pub fn new(
        settings: CaptchaSettings,
        solver: Arc<dyn CaptchaSolver>,
        task: CaptchaTask,
        jitter: Arc<Jitter>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                solver,
                task,
                jitter,
                events,
                pool: Mutex::new(TokenPool::default()),
                wake: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
            supervisor: Mutex::new(None),
        }
    }

    fn supervisor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the refill loop unless it is already running. Needs a tokio
    /// runtime; without one the call only logs.
    pub fn ensure_started(&self) {
        let mut supervisor = self.supervisor();
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                *supervisor = Some(runtime.spawn(supervise(self.shared.clone())));
            }
            Err(_) => log::warn!("no tokio runtime, captcha refill loop not started"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Oldest valid token not currently held by another caller.
    pub fn acquire(&self) -> Option<CaptchaToken> {
        self.acquire_inner(None)
    }

    /// Like [`acquire`](Self::acquire), restricted to tokens unbound or
    /// bound to `session`. The returned token is bound to `session`.
    pub fn acquire_for(&self, session: &str) -> Option<CaptchaToken> {
        self.acquire_inner(Some(session))
    }

    fn acquire_inner(&self, session: Option<&str>) -> Option<CaptchaToken> {
        self.ensure_started();
        let ttl = self.shared.settings.token_ttl();

        let token = {
            let mut pool = self.shared.lock();
            pool.purge(ttl);
            pool.tokens
                .iter_mut()
                .filter(|entry| !entry.in_use)
                .find(|entry| match (session, entry.token.bound_session.as_deref()) {
                    (Some(wanted), Some(bound)) => wanted == bound,
                    _ => true,
                })
                .map(|entry| {
                    entry.in_use = true;
                    entry.token.use_count += 1;
                    if entry.token.bound_session.is_none() {
                        entry.token.bound_session = session.map(str::to_string);
                    }
                    entry.token.clone()
                })
        };

        // A purge or a take may have dropped the pool below the watermark.
        self.shared.wake.notify_one();
        token
    }

    /// Hold `token` so that it is released even if the holder is dropped.
    pub fn lease(&self, token: CaptchaToken) -> TokenLease<'_> {
        TokenLease {
            supply: self,
            token: Some(token),
        }
    }

    /// Report the site's verdict for an acquired token.
    pub fn release(&self, token: &CaptchaToken, outcome: TokenOutcome) {
        let ttl = self.shared.settings.token_ttl();
        let mut pool = self.shared.lock();
        match outcome {
            TokenOutcome::Rejected => {
                if pool.remove(token.id) {
                    log::info!("discarded rejected captcha token after {} uses", token.use_count);
                }
                drop(pool);
                self.shared
                    .events
                    .token(TokenActivity::Rejected, format!("after {} uses", token.use_count));
            }
            TokenOutcome::Accepted => {
                let spent = pool
                    .tokens
                    .iter_mut()
                    .find(|entry| entry.token.id == token.id)
                    .map(|entry| {
                        entry.in_use = false;
                        !entry.token.is_valid(ttl)
                    })
                    .unwrap_or(false);
                if spent {
                    pool.remove(token.id);
                }
                drop(pool);
            }
        }
        self.shared.wake.notify_one();
    }

    /// Solve synchronously for a caller that found the pool empty. The token
    /// joins the pool when there is room, otherwise it is single-caller only.
    pub async fn solve_inline(&self, session: Option<&str>) -> Result<CaptchaToken, CaptchaError> {
        self.ensure_started();
        log::info!("no pooled captcha token, solving inline");
        let value = match self.shared.solve_once().await {
            Ok(value) => value,
            Err(err) => {
                self.shared.lock().failed_total += 1;
                self.shared.events.token(TokenActivity::SolveFailed, err.to_string());
                return Err(err);
            }
        };

        let mut token = self.shared.mint(value, session);
        token.use_count = 1;

        let mut pool = self.shared.lock();
        pool.solved_total += 1;
        if pool.size() < self.shared.settings.high_watermark {
            pool.tokens.push(PooledToken {
                token: token.clone(),
                in_use: true,
            });
        }
        drop(pool);
        self.shared.events.token(TokenActivity::Solved, "inline");
        Ok(token)
    }

    /// Purge tokens bound to any session other than `session`.
    pub fn rebind_session(&self, session: &str) -> usize {
        let mut pool = self.shared.lock();
        let before = pool.tokens.len();
        pool.tokens.retain(|entry| match entry.token.bound_session.as_deref() {
            Some(bound) => bound == session,
            None => true,
        });
        let purged = before - pool.tokens.len();
        pool.discarded_total += purged as u64;
        drop(pool);

        if purged > 0 {
            log::info!("session changed, purged {purged} captcha tokens bound to the old one");
            self.shared
                .events
                .token(TokenActivity::Purged, format!("{purged} tokens on session change"));
            self.shared.wake.notify_one();
        }
        purged
    }

    /// Drop every token, held or not. Held tokens simply disappear on release.
    pub fn invalidate_all(&self) -> usize {
        let mut pool = self.shared.lock();
        let purged = pool.tokens.len();
        pool.tokens.clear();
        pool.discarded_total += purged as u64;
        drop(pool);

        log::info!("invalidated {purged} captcha tokens");
        self.shared
            .events
            .token(TokenActivity::Purged, format!("{purged} tokens invalidated"));
        self.shared.wake.notify_one();
        purged
    }

    pub fn stats(&self) -> TokenStats {
        let refill_running = self.is_running();
        let pool = self.shared.lock();
        let in_use = pool.tokens.iter().filter(|entry| entry.in_use).count();
        TokenStats {
            available: pool.tokens.len() - in_use,
            in_use,
            pending: pool.pending,
            solved_total: pool.solved_total,
            failed_total: pool.failed_total,
            discarded_total: pool.discarded_total,
            refill_running,
        }
    }

    /// Tokens held in the pool, counting pending solves.
    pub fn pool_size(&self) -> usize {
        self.shared.lock().size()
    }

    /// Stop the refill loop. A later `acquire` starts it again.
    pub fn shutdown(&self) {
        if let Some(handle) = self.supervisor().take() {
            handle.abort();
            self.shared.lock().pending = 0;
            log::info!("captcha refill loop stopped");
        }
    }
}

impl Drop for TokenSupply {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor().take() {
            handle.abort();
        }
    }
}
