//! Domain types shared by the log ingestion pipeline and the A2S query client.
//!
//! Everything here is plain data: identities, parsed events, live snapshots and
//! the statistics records that flow from the match tracker into the store.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod event;
pub mod snapshot;
pub mod stats;

pub use event::{Event, EventKind, PlayerRef};
pub use snapshot::{LiveSnapshot, QueryOutcome, ServerInfo, SnapshotPlayer};
pub use stats::{
    MatchId, MatchRecord, MatchState, Metric, Phase, PlayerStats, StatDelta, WarmupStats,
    WeaponUsage,
};

/// Map name used when a match is opened before any map line was seen.
pub const UNKNOWN_MAP: &str = "unknown";

/// Stable name of one configured game server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One configured game server as handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTarget {
    pub name: String,
    pub log_path: String,
    pub enabled: bool,
    /// `host:port` of the server's query endpoint, if live snapshots are wanted.
    #[serde(default)]
    pub query_addr: Option<String>,
}

impl ServerTarget {
    pub fn new(name: impl Into<String>, log_path: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            log_path: log_path.into(),
            enabled,
            query_addr: None,
        }
    }

    pub fn with_query_addr(mut self, addr: impl Into<String>) -> Self {
        self.query_addr = Some(addr.into());
        self
    }

    pub fn id(&self) -> ServerId {
        ServerId::new(self.name.clone())
    }
}

/// Identity token of a physical file, independent of its path.
///
/// On Unix this is the device and inode pair. Elsewhere the tailer derives
/// both halves from the creation time and the first line of the file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    pub fn new(device: u64, inode: u64) -> Self {
        Self { device, inode }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.device, self.inode)
    }
}

/// Byte position of one physical line inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinePosition {
    pub file: FileIdentity,
    /// Bumped every time reading restarts at offset 0, so a truncated file
    /// never reuses positions that were already handed out.
    pub epoch: u32,
    /// Offset of the first byte of the line.
    pub start: u64,
    /// Offset just past the line terminator.
    pub end: u64,
}

/// Key that makes re-applying a stat update a no-op.
///
/// All deltas derived from one log line share `file`, `epoch` and `offset`;
/// `slot` numbers them within that line. Keys from one file are produced in
/// increasing order, which the store relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub file: FileIdentity,
    pub epoch: u32,
    pub offset: u64,
    pub slot: u8,
}

impl IdempotencyKey {
    pub fn new(position: &LinePosition, slot: u8) -> Self {
        Self {
            file: position.file,
            epoch: position.epoch,
            offset: position.start,
            slot,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}#{}",
            self.file, self.epoch, self.offset, self.slot
        )
    }
}

/// Canonical identity of a player.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    /// Stable account id exposed by the log (`STEAM_x:y:z` or `[U:1:n]`).
    Steam(String),
    /// Server-side bot, identified by its display name.
    Bot(String),
    /// Provisional identity known only by display name.
    Name(String),
}

impl Identity {
    pub fn is_provisional(&self) -> bool {
        matches!(self, Identity::Name(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Steam(id) => write!(f, "steam:{}", id),
            Identity::Bot(name) => write!(f, "bot:{}", name),
            Identity::Name(name) => write!(f, "name:{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(offset: u64) -> LinePosition {
        LinePosition {
            file: FileIdentity::new(2049, 77),
            epoch: 0,
            start: offset,
            end: offset + 10,
        }
    }

    #[test]
    fn test_server_target_from_json() {
        let json = r#"{"name":"ins-1","logPath":"/srv/ins/logs/L0101.log","enabled":true}"#;
        let target: ServerTarget = serde_json::from_str(json).unwrap();

        assert_eq!(target.name, "ins-1");
        assert_eq!(target.log_path, "/srv/ins/logs/L0101.log");
        assert!(target.enabled);
        assert_eq!(target.query_addr, None);
        assert_eq!(target.id(), ServerId::new("ins-1"));
    }

    #[test]
    fn test_server_target_with_query_addr() {
        let target = ServerTarget::new("ins-2", "a.log", false).with_query_addr("10.0.0.2:27015");
        let json = serde_json::to_string(&target).unwrap();
        assert!(json.contains("\"queryAddr\":\"10.0.0.2:27015\""));
    }

    #[test]
    fn test_idempotency_key_ordering() {
        let a = IdempotencyKey::new(&position(100), 0);
        let b = IdempotencyKey::new(&position(100), 1);
        let c = IdempotencyKey::new(&position(140), 0);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.offset, 100);

        let after_truncate = IdempotencyKey::new(
            &LinePosition {
                epoch: 1,
                ..position(0)
            },
            0,
        );
        assert!(c < after_truncate);
        assert_eq!(after_truncate.to_string(), "801:4d/1@0#0");
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(
            Identity::Steam("STEAM_1:0:42".to_string()).to_string(),
            "steam:STEAM_1:0:42"
        );
        assert_eq!(Identity::Bot("Rocky".to_string()).to_string(), "bot:Rocky");
        assert_eq!(Identity::Name("Alice".to_string()).to_string(), "name:Alice");
        assert!(Identity::Name("Alice".to_string()).is_provisional());
        assert!(!Identity::Bot("Rocky".to_string()).is_provisional());
    }

    #[test]
    fn test_file_identity_display() {
        assert_eq!(FileIdentity::new(255, 16).to_string(), "ff:10");
    }

    #[test]
    fn test_key_serialization_roundtrip() {
        let key = IdempotencyKey::new(&position(512), 3);
        let bytes = bincode::serialize(&key).unwrap();
        let decoded: IdempotencyKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, key);
    }
}
