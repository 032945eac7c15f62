//! Reconciles the identities seen in logs with the bare names seen in live
//! snapshots.
//!
//! Logs carry a name, a per-connection user id and usually a SteamID.
//! Snapshots carry only the display name. The resolver remembers which names
//! map to which identities, when each alias was last active, and which
//! players disconnected recently, so a snapshot taken moments after a
//! disconnect does not resurrect the player.

use chrono::NaiveDateTime;
use log::warn;
use serde::{Deserialize, Serialize};
use shared::{Identity, PlayerRef};
use std::collections::HashMap;
use std::time::Duration;

use crate::utils::seconds_between;

/// Result of resolving one log-side player reference.
#[derive(Debug, Clone, PartialEq)]
pub struct LogResolution {
    pub identity: Identity,
    /// Provisional identity that this stable one supersedes.
    pub replaced: Option<Identity>,
}

/// Result of resolving one snapshot name.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotMatch {
    Known { identity: Identity, ambiguous: bool },
    /// Disconnected within the identity window; must not be reopened.
    RecentlyLeft { identity: Identity },
    /// Never seen; a provisional name identity.
    Unknown { identity: Identity },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Alias {
    identity: Identity,
    last_active: NaiveDateTime,
    retired_at: Option<NaiveDateTime>,
}

impl Alias {
    fn is_open(&self) -> bool {
        self.retired_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityResolver {
    by_name: HashMap<String, Vec<Alias>>,
    by_uid: HashMap<u32, Identity>,
    window_secs: i64,
    ambiguous_matches: u64,
}

impl IdentityResolver {
    pub fn new(window: Duration) -> Self {
        Self {
            by_name: HashMap::new(),
            by_uid: HashMap::new(),
            window_secs: window.as_secs() as i64,
            ambiguous_matches: 0,
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window_secs = window.as_secs() as i64;
    }

    /// Snapshot names that matched more than one open identity.
    pub fn ambiguous_matches(&self) -> u64 {
        self.ambiguous_matches
    }

    pub fn resolve_log(&mut self, player: &PlayerRef, at: NaiveDateTime) -> LogResolution {
        let stable = if player.is_bot {
            Some(Identity::Bot(player.name.clone()))
        } else {
            player.steam_id.clone().map(Identity::Steam)
        };

        let mut replaced = None;
        let identity = match stable {
            Some(identity) => {
                let bound = player.uid.and_then(|uid| self.by_uid.get(&uid));
                if let Some(old) = bound.filter(|old| old.is_provisional() && **old != identity) {
                    replaced = Some(old.clone());
                }
                let provisional = Identity::Name(player.name.clone());
                if self.drop_alias(&player.name, &provisional) {
                    replaced = Some(provisional);
                }
                identity
            }
            None => player
                .uid
                .and_then(|uid| self.by_uid.get(&uid).cloned())
                .unwrap_or_else(|| Identity::Name(player.name.clone())),
        };

        if let Some(old) = &replaced {
            for aliases in self.by_name.values_mut() {
                aliases.retain(|a| &a.identity != old);
            }
        }
        if let Some(uid) = player.uid {
            self.by_uid.insert(uid, identity.clone());
        }
        self.touch(&player.name, &identity, at);

        LogResolution { identity, replaced }
    }

    pub fn resolve_snapshot(&mut self, name: &str, at: NaiveDateTime) -> SnapshotMatch {
        let aliases = self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[]);

        let open: Vec<&Alias> = aliases.iter().filter(|a| a.is_open()).collect();
        if let Some(best) = open.iter().max_by_key(|a| a.last_active) {
            let identity = best.identity.clone();
            let ambiguous = open.len() > 1;
            if ambiguous {
                warn!(
                    "Snapshot name {:?} matches {} identities; using {}",
                    name,
                    open.len(),
                    identity
                );
                self.ambiguous_matches += 1;
            }
            return SnapshotMatch::Known {
                identity,
                ambiguous,
            };
        }

        let window = self.window_secs;
        let recent = aliases
            .iter()
            .filter_map(|a| a.retired_at.map(|t| (t, a)))
            .filter(|(t, _)| seconds_between(*t, at) <= window)
            .max_by_key(|(t, _)| *t);
        if let Some((_, alias)) = recent {
            return SnapshotMatch::RecentlyLeft {
                identity: alias.identity.clone(),
            };
        }

        let identity = Identity::Name(name.to_string());
        self.touch(name, &identity, at);
        SnapshotMatch::Unknown { identity }
    }

    /// Marks every alias of `identity` as disconnected at `at`.
    pub fn retire(&mut self, identity: &Identity, at: NaiveDateTime) {
        for aliases in self.by_name.values_mut() {
            for alias in aliases.iter_mut().filter(|a| &a.identity == identity) {
                alias.retired_at = Some(at);
            }
        }
        self.by_uid.retain(|_, bound| bound != identity);
        self.prune(at);
    }

    pub fn rename(&mut self, identity: &Identity, new_name: &str, at: NaiveDateTime) {
        for aliases in self.by_name.values_mut() {
            aliases.retain(|a| &a.identity != identity);
        }
        self.by_name.retain(|_, aliases| !aliases.is_empty());
        self.touch(new_name, identity, at);
    }

    /// Open identities currently using `name`.
    pub fn identities_for(&self, name: &str) -> Vec<&Identity> {
        self.by_name
            .get(name)
            .map(|aliases| {
                aliases
                    .iter()
                    .filter(|a| a.is_open())
                    .map(|a| &a.identity)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn touch(&mut self, name: &str, identity: &Identity, at: NaiveDateTime) {
        let aliases = self.by_name.entry(name.to_string()).or_default();
        match aliases.iter_mut().find(|a| &a.identity == identity) {
            Some(alias) => {
                alias.last_active = alias.last_active.max(at);
                alias.retired_at = None;
            }
            None => aliases.push(Alias {
                identity: identity.clone(),
                last_active: at,
                retired_at: None,
            }),
        }
    }

    fn drop_alias(&mut self, name: &str, identity: &Identity) -> bool {
        let Some(aliases) = self.by_name.get_mut(name) else {
            return false;
        };
        let before = aliases.len();
        aliases.retain(|a| !(a.is_open() && &a.identity == identity));
        before != aliases.len()
    }

    // Retired aliases outside the window can no longer suppress anything.
    fn prune(&mut self, at: NaiveDateTime) {
        let window = self.window_secs;
        for aliases in self.by_name.values_mut() {
            aliases.retain(|a| match a.retired_at {
                Some(t) => seconds_between(t, at) <= window,
                None => true,
            });
        }
        self.by_name.retain(|_, aliases| !aliases.is_empty());
    }
}
