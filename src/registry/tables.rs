//! Index tables guarded by the registry lock
//!
//! All cross references live here so the invariants are enforced in one
//! place:
//! - session <-> owner is one-to-one and both directions change together
//! - a transition token belongs to at most one session
//! - within a session a token is either bounded or carried, never both
//! - an orphaned token has no session and no owner
//! - a token awaiting its store delete has no other local entry and reads as
//!   inactive

use crate::registry::timing::{SessionTiming, TokenTiming};
use crate::tokens::{OwnershipKey, SessionToken, TransitionToken};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Which set of its session a token lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Fixed to the session, destroyed with it
    Bounded,
    /// Transferable, orphaned when the session ends
    Carried,
}

/// Bookkeeping for a transferable token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferableInfo {
    /// Current owner; `None` while the token is orphaned
    pub owner: Option<OwnershipKey>,
    pub sellable: bool,
    pub price: f64,
}

impl TransferableInfo {
    fn new(owner: OwnershipKey) -> Self {
        Self {
            owner: Some(owner),
            sellable: false,
            price: 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct SessionTokenSets {
    bounded: HashSet<TransitionToken>,
    carried: HashSet<TransitionToken>,
}

impl SessionTokenSets {
    fn remove(&mut self, token: &TransitionToken) {
        self.bounded.remove(token);
        self.carried.remove(token);
    }
}

/// What `remove_session` took out of the tables
#[derive(Debug)]
pub(crate) struct RemovedSession {
    pub(crate) owner: OwnershipKey,
    /// Bounded tokens, already forgotten locally; their store records remain
    pub(crate) bounded: Vec<TransitionToken>,
    /// Carried tokens, now orphaned
    pub(crate) orphaned: Vec<TransitionToken>,
    pub(crate) shared: bool,
}

fn sorted<T: Ord + Clone>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut v: Vec<T> = items.into_iter().collect();
    v.sort();
    v
}

#[derive(Debug)]
pub(crate) struct Tables {
    pub(crate) general_session_timeout: Duration,
    pub(crate) general_token_timeout: Option<Duration>,

    session_to_owner: HashMap<SessionToken, OwnershipKey>,
    owner_to_session: HashMap<OwnershipKey, SessionToken>,
    session_hashes: HashMap<SessionToken, String>,
    session_tokens: HashMap<SessionToken, SessionTokenSets>,
    session_timing: HashMap<SessionToken, SessionTiming>,
    detached: HashSet<SessionToken>,

    token_to_session: HashMap<TransitionToken, SessionToken>,
    token_to_owner: HashMap<TransitionToken, OwnershipKey>,
    token_values: HashMap<TransitionToken, String>,
    token_timing: HashMap<TransitionToken, TokenTiming>,
    transferable: HashMap<TransitionToken, TransferableInfo>,
    orphaned: HashSet<TransitionToken>,
    pending_deletes: HashSet<TransitionToken>,
}

impl Tables {
    pub(crate) fn new(session_timeout: Duration, token_timeout: Option<Duration>) -> Self {
        Self {
            general_session_timeout: session_timeout,
            general_token_timeout: token_timeout,
            session_to_owner: HashMap::new(),
            owner_to_session: HashMap::new(),
            session_hashes: HashMap::new(),
            session_tokens: HashMap::new(),
            session_timing: HashMap::new(),
            detached: HashSet::new(),
            token_to_session: HashMap::new(),
            token_to_owner: HashMap::new(),
            token_values: HashMap::new(),
            token_timing: HashMap::new(),
            transferable: HashMap::new(),
            orphaned: HashSet::new(),
            pending_deletes: HashSet::new(),
        }
    }

    // ---- sessions ----

    pub(crate) fn has_session(&self, session_token: &SessionToken) -> bool {
        self.session_to_owner.contains_key(session_token)
    }

    pub(crate) fn owner_of(&self, session_token: &SessionToken) -> Option<&OwnershipKey> {
        self.session_to_owner.get(session_token)
    }

    pub(crate) fn session_of(&self, owner: &OwnershipKey) -> Option<&SessionToken> {
        self.owner_to_session.get(owner)
    }

    pub(crate) fn session_hash(&self, session_token: &SessionToken) -> Option<&str> {
        self.session_hashes.get(session_token).map(String::as_str)
    }

    pub(crate) fn session_count(&self) -> usize {
        self.session_to_owner.len()
    }

    /// Register a session. Callers remove any session already bound to the
    /// token or the owner first.
    pub(crate) fn insert_session(
        &mut self,
        session_token: &SessionToken,
        owner: &OwnershipKey,
        hash: String,
        timing: SessionTiming,
    ) {
        debug_assert!(!self.has_session(session_token));
        debug_assert!(self.session_of(owner).is_none());

        self.session_to_owner.insert(session_token.clone(), owner.clone());
        self.owner_to_session.insert(owner.clone(), session_token.clone());
        self.session_hashes.insert(session_token.clone(), hash);
        self.session_tokens.insert(session_token.clone(), SessionTokenSets::default());
        self.session_timing.insert(session_token.clone(), timing);
    }

    /// Remove every index entry keyed by the session. Bounded tokens are
    /// forgotten, carried tokens become orphans.
    pub(crate) fn remove_session(&mut self, session_token: &SessionToken, now: Instant) -> Option<RemovedSession> {
        let owner = self.session_to_owner.remove(session_token)?;
        if self.owner_to_session.get(&owner) == Some(session_token) {
            self.owner_to_session.remove(&owner);
        }
        self.session_hashes.remove(session_token);
        self.detached.remove(session_token);
        let shared = self
            .session_timing
            .remove(session_token)
            .is_some_and(|t| t.shared);

        let sets = self.session_tokens.remove(session_token).unwrap_or_default();
        let bounded = sorted(sets.bounded);
        let orphaned = sorted(sets.carried);

        for token in &bounded {
            self.forget_token(token);
        }
        for token in &orphaned {
            self.orphan_token(token, now);
        }

        Some(RemovedSession {
            owner,
            bounded,
            orphaned,
            shared,
        })
    }

    pub(crate) fn bounded_tokens(&self, session_token: &SessionToken) -> Vec<TransitionToken> {
        self.session_tokens
            .get(session_token)
            .map(|sets| sorted(sets.bounded.iter().cloned()))
            .unwrap_or_default()
    }

    pub(crate) fn carried_tokens(&self, session_token: &SessionToken) -> Vec<TransitionToken> {
        self.session_tokens
            .get(session_token)
            .map(|sets| sorted(sets.carried.iter().cloned()))
            .unwrap_or_default()
    }

    pub(crate) fn is_carried_by(&self, session_token: &SessionToken, token: &TransitionToken) -> bool {
        self.session_tokens
            .get(session_token)
            .is_some_and(|sets| sets.carried.contains(token))
    }

    pub(crate) fn session_timing(&self, session_token: &SessionToken) -> Option<&SessionTiming> {
        self.session_timing.get(session_token)
    }

    pub(crate) fn session_timing_mut(&mut self, session_token: &SessionToken) -> Option<&mut SessionTiming> {
        self.session_timing.get_mut(session_token)
    }

    pub(crate) fn set_session_timing(&mut self, session_token: &SessionToken, timing: SessionTiming) {
        if self.has_session(session_token) {
            self.session_timing.insert(session_token.clone(), timing);
        }
    }

    pub(crate) fn set_session_hash(&mut self, session_token: &SessionToken, hash: String) {
        if self.has_session(session_token) {
            self.session_hashes.insert(session_token.clone(), hash);
        }
    }

    pub(crate) fn mark_detached(&mut self, session_token: &SessionToken, detached: bool) {
        if detached {
            self.detached.insert(session_token.clone());
        } else {
            self.detached.remove(session_token);
        }
    }

    pub(crate) fn detached_sessions(&self) -> Vec<SessionToken> {
        sorted(self.detached.iter().cloned())
    }

    // ---- tokens ----

    /// Put a token into a session's set, moving it out of any previous
    /// session or the orphan set.
    pub(crate) fn attach_token(
        &mut self,
        token: &TransitionToken,
        session_token: &SessionToken,
        owner: &OwnershipKey,
        membership: Membership,
        now: Instant,
    ) {
        if let Some(previous) = self.token_to_session.insert(token.clone(), session_token.clone()) {
            if let Some(sets) = self.session_tokens.get_mut(&previous) {
                sets.remove(token);
            }
        }
        self.orphaned.remove(token);
        self.token_to_owner.insert(token.clone(), owner.clone());

        if let Some(sets) = self.session_tokens.get_mut(session_token) {
            match membership {
                Membership::Bounded => {
                    sets.carried.remove(token);
                    sets.bounded.insert(token.clone());
                }
                Membership::Carried => {
                    sets.bounded.remove(token);
                    sets.carried.insert(token.clone());
                }
            }
        }

        let general = self.general_token_timeout;
        let timing = self
            .token_timing
            .entry(token.clone())
            .or_insert_with(|| TokenTiming::new(general, now));
        timing.reclaim();

        match membership {
            Membership::Bounded => {
                timing.detachment_allowed = false;
                self.transferable.remove(token);
            }
            Membership::Carried => {
                timing.detachment_allowed = true;
                self.transferable
                    .entry(token.clone())
                    .or_insert_with(|| TransferableInfo::new(owner.clone()))
                    .owner = Some(owner.clone());
            }
        }
    }

    /// Cache a freshly written value and restart the token's clock. An
    /// existing timing entry keeps its budget, grace and detachment flag.
    pub(crate) fn cache_value(&mut self, token: &TransitionToken, value: String, now: Instant) {
        self.token_values.insert(token.clone(), value);
        self.pending_deletes.remove(token);
        match self.token_timing.get_mut(token) {
            Some(timing) => timing.restart(now),
            None => {
                self.token_timing
                    .insert(token.clone(), TokenTiming::new(self.general_token_timeout, now));
            }
        }
    }

    /// Cache a value read back from the store, keeping any existing clock
    pub(crate) fn fill_value(&mut self, token: &TransitionToken, value: String, now: Instant) {
        self.token_values.insert(token.clone(), value);
        let general = self.general_token_timeout;
        self.token_timing
            .entry(token.clone())
            .or_insert_with(|| TokenTiming::new(general, now));
    }

    pub(crate) fn cached_value(&self, token: &TransitionToken) -> Option<&String> {
        self.token_values.get(token)
    }

    pub(crate) fn evict_values(&mut self) -> usize {
        let n = self.token_values.len();
        self.token_values.clear();
        n
    }

    pub(crate) fn evict_value(&mut self, token: &TransitionToken) -> bool {
        self.token_values.remove(token).is_some()
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.token_values.len()
    }

    pub(crate) fn owner_of_token(&self, token: &TransitionToken) -> Option<&OwnershipKey> {
        self.token_to_owner.get(token)
    }

    pub(crate) fn session_of_token(&self, token: &TransitionToken) -> Option<&SessionToken> {
        self.token_to_session.get(token)
    }

    /// Whether the token is orphaned or belongs to a session other than the
    /// given ones
    pub(crate) fn is_held_elsewhere(&self, token: &TransitionToken, sessions: &[&SessionToken]) -> bool {
        if self.orphaned.contains(token) {
            return true;
        }
        self.token_to_session
            .get(token)
            .is_some_and(|holder| !sessions.contains(&holder))
    }

    /// Drop every local trace of a token. Returns whether anything was known.
    pub(crate) fn forget_token(&mut self, token: &TransitionToken) -> bool {
        let mut known = false;
        if let Some(session_token) = self.token_to_session.remove(token) {
            if let Some(sets) = self.session_tokens.get_mut(&session_token) {
                sets.remove(token);
            }
            known = true;
        }
        known |= self.token_to_owner.remove(token).is_some();
        known |= self.token_values.remove(token).is_some();
        known |= self.token_timing.remove(token).is_some();
        known |= self.transferable.remove(token).is_some();
        known |= self.orphaned.remove(token);
        known
    }

    fn orphan_token(&mut self, token: &TransitionToken, now: Instant) {
        self.token_to_session.remove(token);
        self.token_to_owner.remove(token);
        if let Some(info) = self.transferable.get_mut(token) {
            info.owner = None;
            info.sellable = false;
        }
        if let Some(timing) = self.token_timing.get_mut(token) {
            timing.disown(now);
        }
        self.orphaned.insert(token.clone());
    }

    /// Record that the token is gone locally but its store record is not
    pub(crate) fn mark_pending_delete(&mut self, token: &TransitionToken) {
        self.pending_deletes.insert(token.clone());
    }

    pub(crate) fn clear_pending_delete(&mut self, token: &TransitionToken) -> bool {
        self.pending_deletes.remove(token)
    }

    pub(crate) fn is_pending_delete(&self, token: &TransitionToken) -> bool {
        self.pending_deletes.contains(token)
    }

    pub(crate) fn pending_deletes(&self) -> Vec<TransitionToken> {
        sorted(self.pending_deletes.iter().cloned())
    }

    pub(crate) fn is_orphaned(&self, token: &TransitionToken) -> bool {
        self.orphaned.contains(token)
    }

    pub(crate) fn orphaned_tokens(&self) -> Vec<TransitionToken> {
        sorted(self.orphaned.iter().cloned())
    }

    pub(crate) fn token_timing(&self, token: &TransitionToken) -> Option<&TokenTiming> {
        self.token_timing.get(token)
    }

    pub(crate) fn token_timing_mut(&mut self, token: &TransitionToken) -> Option<&mut TokenTiming> {
        self.token_timing.get_mut(token)
    }

    pub(crate) fn transferable(&self, token: &TransitionToken) -> Option<&TransferableInfo> {
        self.transferable.get(token)
    }

    pub(crate) fn transferable_mut(&mut self, token: &TransitionToken) -> Option<&mut TransferableInfo> {
        self.transferable.get_mut(token)
    }

    pub(crate) fn sellable(&self) -> impl Iterator<Item = (&TransitionToken, &TransferableInfo)> {
        self.transferable.iter().filter(|(_, info)| info.sellable)
    }

    /// Sessions and tokens whose time is up
    pub(crate) fn expired(&self, now: Instant) -> (Vec<SessionToken>, Vec<TransitionToken>) {
        let sessions = sorted(
            self.session_timing
                .iter()
                .filter(|(_, t)| t.expired(now))
                .map(|(s, _)| s.clone()),
        );
        let tokens = sorted(
            self.token_timing
                .iter()
                .filter(|(_, t)| t.expired(now))
                .map(|(t, _)| t.clone()),
        );
        (sessions, tokens)
    }
}
