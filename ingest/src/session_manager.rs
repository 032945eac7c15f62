//! Roster of players currently on one server.
//!
//! This module tracks player sessions for the match tracker:
//! - Session lifecycle (open on connect or first sighting, close on leave)
//! - Attribution of sessions to the running match
//! - Absence counting across live snapshots
//!
//! At most one session is open per identity, so an identity can never be
//! counted twice within one match.

use chrono::NaiveDateTime;
use log::debug;
use serde::{Deserialize, Serialize};
use shared::{Identity, MatchId};
use std::collections::{HashMap, HashSet};

/// Where a session was first observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOrigin {
    Log,
    Snapshot,
}

/// One player's presence on the server within one match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSession {
    pub identity: Identity,
    pub name: String,
    pub uid: Option<u32>,
    pub team: Option<String>,
    /// `None` while the server is between matches
    pub match_id: Option<MatchId>,
    pub joined_at: NaiveDateTime,
    pub left_at: Option<NaiveDateTime>,
    pub last_active: NaiveDateTime,
    /// Consecutive reachable snapshots this player was missing from
    pub snapshot_misses: u32,
    pub origin: SessionOrigin,
}

impl PlayerSession {
    pub fn new(
        identity: Identity,
        name: impl Into<String>,
        match_id: Option<MatchId>,
        at: NaiveDateTime,
        origin: SessionOrigin,
    ) -> Self {
        Self {
            identity,
            name: name.into(),
            uid: None,
            team: None,
            match_id,
            joined_at: at,
            left_at: None,
            last_active: at,
            snapshot_misses: 0,
            origin,
        }
    }

    /// Records activity, never moving the activity clock backwards
    pub fn touch(&mut self, at: NaiveDateTime) {
        self.last_active = self.last_active.max(at);
        self.snapshot_misses = 0;
    }

    fn successor(&self, match_id: Option<MatchId>, at: NaiveDateTime) -> Self {
        Self {
            match_id,
            joined_at: at,
            left_at: None,
            last_active: at,
            snapshot_misses: 0,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionManager {
    /// Open sessions keyed by identity
    sessions: HashMap<Identity, PlayerSession>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Opens a session unless one is already open for the identity.
    ///
    /// Returns false when the identity already had an open session.
    pub fn open(&mut self, session: PlayerSession) -> bool {
        if self.sessions.contains_key(&session.identity) {
            return false;
        }
        debug!("Session opened for {} ({})", session.identity, session.name);
        self.sessions.insert(session.identity.clone(), session);
        true
    }

    /// Closes the identity's session, returning it with `left_at` filled in
    pub fn close(&mut self, identity: &Identity, at: NaiveDateTime) -> Option<PlayerSession> {
        let mut session = self.sessions.remove(identity)?;
        session.left_at = Some(at);
        debug!("Session closed for {}", identity);
        Some(session)
    }

    pub fn is_open(&self, identity: &Identity) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&PlayerSession> {
        self.sessions.get(identity)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut PlayerSession> {
        self.sessions.get_mut(identity)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PlayerSession> {
        self.sessions.values().find(|s| s.name == name)
    }

    /// Moves a session from a provisional identity to its stable one.
    ///
    /// If the stable identity already has a session, the provisional one is
    /// dropped instead. Returns false if `from` had no session.
    pub fn rekey(&mut self, from: &Identity, to: &Identity) -> bool {
        let Some(mut session) = self.sessions.remove(from) else {
            return false;
        };
        if self.sessions.contains_key(to) {
            return true;
        }
        session.identity = to.clone();
        self.sessions.insert(to.clone(), session);
        true
    }

    /// Gives sessions opened between matches the id of the match that just opened
    pub fn assign_match(&mut self, match_id: &MatchId) -> usize {
        let mut assigned = 0;
        for session in self.sessions.values_mut() {
            if session.match_id.is_none() {
                session.match_id = Some(match_id.clone());
                assigned += 1;
            }
        }
        assigned
    }

    /// Replaces every session attributed to another match with a fresh one
    /// attributed to `match_id`.
    ///
    /// Returns `(closed, opened)` pairs in identity order.
    pub fn roll_over(
        &mut self,
        match_id: Option<&MatchId>,
        at: NaiveDateTime,
    ) -> Vec<(PlayerSession, PlayerSession)> {
        let mut rolled = Vec::new();
        for session in self.sessions.values_mut() {
            if session.match_id.is_none() || session.match_id.as_ref() == match_id {
                continue;
            }
            let mut closed = session.clone();
            closed.left_at = Some(at);
            *session = session.successor(match_id.cloned(), at);
            rolled.push((closed, session.clone()));
        }
        rolled.sort_by(|a, b| a.0.identity.cmp(&b.0.identity));
        rolled
    }

    /// Closes every open session, returning them in identity order
    pub fn close_all(&mut self, at: NaiveDateTime) -> Vec<PlayerSession> {
        let mut closed: Vec<PlayerSession> = self
            .sessions
            .drain()
            .map(|(_, mut session)| {
                session.left_at = Some(at);
                session
            })
            .collect();
        closed.sort_by(|a, b| a.identity.cmp(&b.identity));
        closed
    }

    /// Updates absence counters from one reachable snapshot.
    ///
    /// Returns the identities that have now been missing from `limit`
    /// consecutive snapshots.
    pub fn record_snapshot(&mut self, present: &HashSet<&str>, limit: u32) -> Vec<Identity> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            if present.contains(session.name.as_str()) {
                session.snapshot_misses = 0;
                continue;
            }
            session.snapshot_misses += 1;
            if session.snapshot_misses >= limit {
                expired.push(session.identity.clone());
            }
        }
        expired.sort();
        expired
    }

    pub fn identities(&self) -> Vec<&Identity> {
        let mut ids: Vec<&Identity> = self.sessions.keys().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
