//! Session and token time budgets
//!
//! Every session gets a deadline when it is added. A session whose owner has
//! stepped away can be detached (if detachment was allowed), after which only
//! its detachment grace counts. Transition tokens have no deadline unless a
//! general or per-token timeout is set; carried tokens may additionally get a
//! disownment grace that starts when their session is destroyed.
//!
//! Nothing expires on its own: `sweep_expired` destroys whatever is past due
//! and retries store deletes that failed before. `spawn_sweeper` calls it on
//! an interval.

use crate::registry::{RegistryError, Tables, TokenTables};
use crate::tokens::{SessionToken, TransitionToken};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

fn deadline_after(now: Instant, allotted: Duration) -> Option<Instant> {
    now.checked_add(allotted)
}

fn remaining(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(now))
}

#[derive(Debug, Clone)]
pub(crate) struct SessionTiming {
    allotted: Duration,
    /// `None` when the allotted time does not fit in an `Instant`
    deadline: Option<Instant>,
    detachment_allowed: bool,
    detach_grace: Duration,
    detached_until: Option<Instant>,
    pub(crate) shared: bool,
}

impl SessionTiming {
    pub(crate) fn new(allotted: Duration, now: Instant, shared: bool) -> Self {
        Self {
            allotted,
            deadline: deadline_after(now, allotted),
            detachment_allowed: false,
            detach_grace: Duration::ZERO,
            detached_until: None,
            shared,
        }
    }

    fn reset(&mut self, allotted: Duration, now: Instant) {
        self.allotted = allotted;
        self.deadline = deadline_after(now, allotted);
    }

    fn is_detached(&self) -> bool {
        self.detached_until.is_some()
    }

    fn time_left(&self, now: Instant) -> Duration {
        let deadline = if self.is_detached() { self.detached_until } else { self.deadline };
        remaining(deadline, now).unwrap_or(Duration::MAX)
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        match (self.detached_until, self.deadline) {
            (Some(until), _) => until <= now,
            (None, Some(deadline)) => deadline <= now,
            (None, None) => false,
        }
    }

    pub(crate) fn record(&self, now: Instant) -> SessionTimingRecord {
        SessionTimingRecord {
            allotted_ms: self.allotted.as_millis() as u64,
            time_left_ms: remaining(self.deadline, now).map(|d| d.as_millis() as u64),
            detachment_allowed: self.detachment_allowed,
            detach_grace_ms: self.detach_grace.as_millis() as u64,
            detached_left_ms: remaining(self.detached_until, now).map(|d| d.as_millis() as u64),
        }
    }

    pub(crate) fn from_record(record: &SessionTimingRecord, now: Instant) -> Self {
        let left = |ms: Option<u64>| ms.and_then(|ms| deadline_after(now, Duration::from_millis(ms)));
        Self {
            allotted: Duration::from_millis(record.allotted_ms),
            deadline: left(record.time_left_ms),
            detachment_allowed: record.detachment_allowed,
            detach_grace: Duration::from_millis(record.detach_grace_ms),
            detached_until: left(record.detached_left_ms),
            shared: true,
        }
    }
}

/// Session timing as published to the store for shared sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SessionTimingRecord {
    allotted_ms: u64,
    time_left_ms: Option<u64>,
    detachment_allowed: bool,
    detach_grace_ms: u64,
    detached_left_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct TokenTiming {
    allotted: Option<Duration>,
    deadline: Option<Instant>,
    pub(crate) detachment_allowed: bool,
    disownment_grace: Option<Duration>,
    disowned_until: Option<Instant>,
}

impl TokenTiming {
    pub(crate) fn new(allotted: Option<Duration>, now: Instant) -> Self {
        Self {
            allotted,
            deadline: allotted.and_then(|d| deadline_after(now, d)),
            detachment_allowed: false,
            disownment_grace: None,
            disowned_until: None,
        }
    }

    fn set_timeout(&mut self, allotted: Duration, now: Instant) {
        self.allotted = Some(allotted);
        self.deadline = deadline_after(now, allotted);
    }

    /// Start the current budget over, as when the token gets a new value
    pub(crate) fn restart(&mut self, now: Instant) {
        self.deadline = self.allotted.and_then(|d| deadline_after(now, d));
    }

    fn time_left(&self, now: Instant) -> Option<Duration> {
        match (remaining(self.deadline, now), remaining(self.disowned_until, now)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now) || self.disowned_until.is_some_and(|d| d <= now)
    }

    /// Start the disownment grace, if this token has one
    pub(crate) fn disown(&mut self, now: Instant) {
        if self.detachment_allowed {
            if let Some(grace) = self.disownment_grace {
                self.disowned_until = deadline_after(now, grace);
            }
        }
    }

    pub(crate) fn reclaim(&mut self) {
        self.disowned_until = None;
    }
}

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub tokens: usize,
    /// Store deletes left over from earlier failures that went through
    pub retried_deletes: usize,
}

/// Handle to a running sweeper task. Dropping it stops the task.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl TokenTables {
    /// Time allotted to sessions added from now on
    pub async fn set_general_session_timeout(&self, timeout: Duration) {
        self.tables.write().await.general_session_timeout = timeout;
    }

    /// Time allotted to tokens added from now on (`None` disables expiry)
    pub async fn set_general_token_timeout(&self, timeout: Option<Duration>) {
        self.tables.write().await.general_token_timeout = timeout;
    }

    /// Give a session a fresh budget. Returns false for unknown sessions.
    pub async fn set_session_timeout(
        &self,
        session_token: &SessionToken,
        timeout: Duration,
    ) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;
        let Some(timing) = tables.session_timing_mut(session_token) else {
            return Ok(false);
        };
        timing.reset(timeout, Instant::now());
        self.publish_session_timing(&tables, session_token).await?;
        Ok(true)
    }

    pub async fn session_timeout(&self, session_token: &SessionToken) -> Option<Duration> {
        let tables = self.tables.read().await;
        tables.session_timing(session_token).map(|t| t.allotted)
    }

    pub async fn session_time_left(&self, session_token: &SessionToken) -> Option<Duration> {
        let tables = self.tables.read().await;
        tables.session_timing(session_token).map(|t| t.time_left(Instant::now()))
    }

    /// Allow a session to be detached, keeping it alive for `grace` once it is
    pub async fn allow_session_detach(
        &self,
        session_token: &SessionToken,
        grace: Duration,
    ) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;
        let Some(timing) = tables.session_timing_mut(session_token) else {
            return Ok(false);
        };
        timing.detachment_allowed = true;
        timing.detach_grace = grace;
        self.publish_session_timing(&tables, session_token).await?;
        Ok(true)
    }

    /// Detach a session whose owner stepped away. Only the detachment grace
    /// counts from here on. Returns false if the session is unknown, already
    /// detached, or was never allowed to detach.
    pub async fn detach_session(&self, session_token: &SessionToken) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;
        let now = Instant::now();
        let Some(timing) = tables.session_timing_mut(session_token) else {
            return Ok(false);
        };
        if !timing.detachment_allowed || timing.is_detached() {
            return Ok(false);
        }
        timing.detached_until = deadline_after(now, timing.detach_grace).or(timing.deadline);
        tables.mark_detached(session_token, true);
        self.publish_session_timing(&tables, session_token).await?;

        debug!(session = %session_token, "Session detached");
        Ok(true)
    }

    /// Reattach a detached session; its regular deadline applies again
    pub async fn attach_session(&self, session_token: &SessionToken) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;
        let Some(timing) = tables.session_timing_mut(session_token) else {
            return Ok(false);
        };
        if !timing.is_detached() {
            return Ok(false);
        }
        timing.detached_until = None;
        tables.mark_detached(session_token, false);
        self.publish_session_timing(&tables, session_token).await?;

        debug!(session = %session_token, "Session attached");
        Ok(true)
    }

    pub async fn list_detached_sessions(&self) -> Vec<SessionToken> {
        self.tables.read().await.detached_sessions()
    }

    /// Give a token a fresh budget. Returns false for unknown tokens.
    pub async fn set_token_timeout(&self, token: &TransitionToken, timeout: Duration) -> bool {
        let mut tables = self.tables.write().await;
        match tables.token_timing_mut(token) {
            Some(timing) => {
                timing.set_timeout(timeout, Instant::now());
                true
            }
            None => false,
        }
    }

    /// Allotted time of a token; `None` if unknown or unlimited
    pub async fn token_timeout(&self, token: &TransitionToken) -> Option<Duration> {
        let tables = self.tables.read().await;
        tables.token_timing(token).and_then(|t| t.allotted)
    }

    /// Time until the token expires; `None` if unknown or unlimited
    pub async fn token_time_left(&self, token: &TransitionToken) -> Option<Duration> {
        let tables = self.tables.read().await;
        tables.token_timing(token).and_then(|t| t.time_left(Instant::now()))
    }

    /// How long a carried token survives once its session is gone. Only
    /// tokens that may be detached (carried tokens) accept a grace.
    pub async fn set_disownment_token_timeout(&self, token: &TransitionToken, grace: Duration) -> bool {
        let mut tables = self.tables.write().await;
        match tables.token_timing_mut(token) {
            Some(timing) if timing.detachment_allowed => {
                timing.disownment_grace = Some(grace);
                true
            }
            _ => false,
        }
    }

    /// Destroy every session and token whose time is up, then retry pending
    /// store deletes
    pub async fn sweep_expired(&self) -> Result<SweepReport, RegistryError> {
        let mut tables = self.tables.write().await;
        let now = Instant::now();
        let (sessions, tokens) = tables.expired(now);
        let retry = tables.pending_deletes();

        let mut report = SweepReport::default();
        let mut first_err = None;

        for session_token in &sessions {
            match self.destroy_session_in(&mut tables, session_token).await {
                Ok(true) => report.sessions += 1,
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        for token in &tokens {
            match self.destroy_token_in(&mut tables, token).await {
                Ok(true) => report.tokens += 1,
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        for token in &retry {
            match self.delete_stored_value(&mut tables, token).await {
                Ok(()) => report.retried_deletes += 1,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        if report.sessions > 0 || report.tokens > 0 || report.retried_deletes > 0 {
            info!(
                sessions = report.sessions,
                tokens = report.tokens,
                retried_deletes = report.retried_deletes,
                "Expired entries swept"
            );
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Run `sweep_expired` every `sweep_interval` until the handle is shut down
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let tables = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tables.sweep_expired().await {
                            warn!(error = %e, "Expiry sweep failed");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("Sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Write the timing record of a shared session back to the store
    pub(crate) async fn publish_session_timing(
        &self,
        tables: &Tables,
        session_token: &SessionToken,
    ) -> Result<(), RegistryError> {
        let Some(timing) = tables.session_timing(session_token) else {
            return Ok(());
        };
        if !timing.shared {
            return Ok(());
        }
        let record = serde_json::to_string(&timing.record(Instant::now()))?;
        self.store_call("set_key_value", self.store.set_key_value(session_token.as_str(), &record))
            .await
    }
}
