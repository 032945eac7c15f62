use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{IdempotencyKey, Identity, ServerId};

/// A match is identified by its server and the in-game time it started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchId {
    pub server: ServerId,
    pub started_at: NaiveDateTime,
}

impl MatchId {
    pub fn new(server: ServerId, started_at: NaiveDateTime) -> Self {
        Self { server, started_at }
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.server,
            self.started_at.format("%Y-%m-%dT%H:%M:%S")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchState {
    Warmup,
    RoundActive,
    RoundEnd,
    Concluded,
}

/// Durable lifecycle record of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: MatchId,
    pub map: String,
    pub state: MatchState,
    pub round: u32,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
}

impl MatchRecord {
    pub fn open(server: ServerId, map: impl Into<String>, started_at: NaiveDateTime) -> Self {
        Self {
            id: MatchId::new(server, started_at),
            map: map.into(),
            state: MatchState::Warmup,
            round: 0,
            started_at,
            ended_at: None,
        }
    }

    pub fn is_concluded(&self) -> bool {
        self.state == MatchState::Concluded
    }
}

/// Whether a combat event happened inside an active round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Live,
    /// Warmup, between rounds, or before the first round of a match.
    Warmup,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Kill,
    Death,
    Headshot,
    Suicide,
    TeamKill,
    DamageDealt,
    DamageTaken,
    WeaponKill(String),
    WeaponHeadshot(String),
}

/// One incremental contribution to a player's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatDelta {
    pub key: IdempotencyKey,
    pub match_id: MatchId,
    pub identity: Identity,
    pub metric: Metric,
    pub amount: i64,
    pub phase: Phase,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaponUsage {
    pub kills: i64,
    pub headshots: i64,
}

/// Combat that happened outside an active round. Kept apart from the live
/// totals, with the same breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupStats {
    pub kills: i64,
    pub deaths: i64,
    pub headshots: i64,
    pub suicides: i64,
    pub team_kills: i64,
    pub damage_dealt: i64,
    pub damage_taken: i64,
    pub weapons: BTreeMap<String, WeaponUsage>,
}

impl WarmupStats {
    pub fn apply(&mut self, metric: &Metric, amount: i64) {
        match metric {
            Metric::Kill => self.kills += amount,
            Metric::Death => self.deaths += amount,
            Metric::Headshot => self.headshots += amount,
            Metric::Suicide => self.suicides += amount,
            Metric::TeamKill => self.team_kills += amount,
            Metric::DamageDealt => self.damage_dealt += amount,
            Metric::DamageTaken => self.damage_taken += amount,
            Metric::WeaponKill(weapon) => {
                self.weapons.entry(weapon.clone()).or_default().kills += amount
            }
            Metric::WeaponHeadshot(weapon) => {
                self.weapons.entry(weapon.clone()).or_default().headshots += amount
            }
        }
    }
}

/// Aggregate totals for one player, either per match or all-time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub kills: i64,
    pub deaths: i64,
    pub headshots: i64,
    pub suicides: i64,
    pub team_kills: i64,
    pub damage_dealt: i64,
    pub damage_taken: i64,
    pub weapons: BTreeMap<String, WeaponUsage>,
    pub warmup: WarmupStats,
}

impl PlayerStats {
    /// Adds one delta. Only ever increments by the signed amount; never recomputes.
    pub fn apply(&mut self, metric: &Metric, amount: i64, phase: Phase) {
        if phase == Phase::Warmup {
            self.warmup.apply(metric, amount);
            return;
        }

        match metric {
            Metric::Kill => self.kills += amount,
            Metric::Death => self.deaths += amount,
            Metric::Headshot => self.headshots += amount,
            Metric::Suicide => self.suicides += amount,
            Metric::TeamKill => self.team_kills += amount,
            Metric::DamageDealt => self.damage_dealt += amount,
            Metric::DamageTaken => self.damage_taken += amount,
            Metric::WeaponKill(weapon) => {
                self.weapons.entry(weapon.clone()).or_default().kills += amount
            }
            Metric::WeaponHeadshot(weapon) => {
                self.weapons.entry(weapon.clone()).or_default().headshots += amount
            }
        }
    }
}
