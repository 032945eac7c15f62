use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ServerId;

/// One entry of an A2S player list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPlayer {
    pub name: String,
    pub score: i32,
    /// Seconds the player has been connected.
    pub duration: f32,
}

/// Decoded A2S_INFO reply, trimmed to what the engine uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub app_id: i16,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOutcome {
    Reachable {
        info: Option<ServerInfo>,
        players: Vec<SnapshotPlayer>,
    },
    Unreachable {
        attempts: u32,
        reason: String,
    },
}

/// Result of one live query cycle against one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub server: ServerId,
    pub taken_at: DateTime<Utc>,
    pub outcome: QueryOutcome,
}

impl LiveSnapshot {
    pub fn reachable(
        server: ServerId,
        info: Option<ServerInfo>,
        players: Vec<SnapshotPlayer>,
    ) -> Self {
        Self {
            server,
            taken_at: Utc::now(),
            outcome: QueryOutcome::Reachable { info, players },
        }
    }

    pub fn unreachable(server: ServerId, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            server,
            taken_at: Utc::now(),
            outcome: QueryOutcome::Unreachable {
                attempts,
                reason: reason.into(),
            },
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, QueryOutcome::Reachable { .. })
    }

    /// Players in the snapshot; empty when the server was unreachable.
    pub fn players(&self) -> &[SnapshotPlayer] {
        match &self.outcome {
            QueryOutcome::Reachable { players, .. } => players,
            QueryOutcome::Unreachable { .. } => &[],
        }
    }

    pub fn map(&self) -> Option<&str> {
        match &self.outcome {
            QueryOutcome::Reachable {
                info: Some(info), ..
            } => Some(info.map.as_str()),
            _ => None,
        }
    }
}
