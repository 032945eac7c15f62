use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::ServerId;

/// A player as referenced by one log line: `"Name<uid><steamid><team>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub name: String,
    /// Per-connection user id assigned by the game server.
    pub uid: Option<u32>,
    /// Raw account column, `None` when empty or still pending.
    pub steam_id: Option<String>,
    pub team: Option<String>,
    pub is_bot: bool,
}

impl PlayerRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            steam_id: None,
            team: None,
            is_bot: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    PlayerConnect {
        player: PlayerRef,
        address: Option<String>,
    },
    PlayerDisconnect {
        player: PlayerRef,
        reason: Option<String>,
    },
    Kill {
        attacker: PlayerRef,
        victim: PlayerRef,
        weapon: String,
        headshot: bool,
    },
    Damage {
        attacker: PlayerRef,
        victim: PlayerRef,
        weapon: String,
        amount: u32,
        hitgroup: Option<String>,
    },
    Suicide {
        player: PlayerRef,
        weapon: String,
    },
    ChatMessage {
        player: PlayerRef,
        text: String,
        team_only: bool,
    },
    TeamChange {
        player: PlayerRef,
        team: String,
    },
    NameChange {
        player: PlayerRef,
        new_name: String,
    },
    RoundStart,
    RoundEnd {
        winner: Option<String>,
    },
    MapChange {
        map: String,
    },
    GameOver,
    Unrecognized {
        text: String,
    },
}

impl EventKind {
    /// Short stable label, used for counters and log output.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::PlayerConnect { .. } => "player_connect",
            EventKind::PlayerDisconnect { .. } => "player_disconnect",
            EventKind::Kill { .. } => "kill",
            EventKind::Damage { .. } => "damage",
            EventKind::Suicide { .. } => "suicide",
            EventKind::ChatMessage { .. } => "chat_message",
            EventKind::TeamChange { .. } => "team_change",
            EventKind::NameChange { .. } => "name_change",
            EventKind::RoundStart => "round_start",
            EventKind::RoundEnd { .. } => "round_end",
            EventKind::MapChange { .. } => "map_change",
            EventKind::GameOver => "game_over",
            EventKind::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Whether this event carries combat statistics.
    pub fn is_combat(&self) -> bool {
        matches!(
            self,
            EventKind::Kill { .. } | EventKind::Damage { .. } | EventKind::Suicide { .. }
        )
    }
}

/// One parsed occurrence from a server log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub server: ServerId,
    /// In-game timestamp from the line prefix; absent only on lines without one.
    pub timestamp: Option<NaiveDateTime>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(server: ServerId, timestamp: Option<NaiveDateTime>, kind: EventKind) -> Self {
        Self {
            server,
            timestamp,
            kind,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self.kind, EventKind::Unrecognized { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_distinct() {
        let kinds = vec![
            EventKind::PlayerConnect {
                player: PlayerRef::named("a"),
                address: None,
            },
            EventKind::PlayerDisconnect {
                player: PlayerRef::named("a"),
                reason: None,
            },
            EventKind::RoundStart,
            EventKind::RoundEnd { winner: None },
            EventKind::MapChange {
                map: "ministry".to_string(),
            },
            EventKind::GameOver,
            EventKind::Unrecognized {
                text: String::new(),
            },
        ];

        let mut labels: Vec<&str> = kinds.iter().map(|k| k.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), kinds.len());
    }

    #[test]
    fn test_combat_classification() {
        let kill = EventKind::Kill {
            attacker: PlayerRef::named("a"),
            victim: PlayerRef::named("b"),
            weapon: "ak74".to_string(),
            headshot: false,
        };
        assert!(kill.is_combat());
        assert!(!EventKind::RoundStart.is_combat());
    }

    #[test]
    fn test_unrecognized_event() {
        let event = Event::new(
            ServerId::new("s"),
            None,
            EventKind::Unrecognized {
                text: "garbage".to_string(),
            },
        );
        assert!(!event.is_recognized());
    }
}
