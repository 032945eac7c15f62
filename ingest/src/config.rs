//! Engine configuration and the list of servers to ingest.

use query::QueryConfig;
use shared::ServerTarget;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::utils::file_stem_for;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid targets file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid target: {0}")]
    Invalid(String),
}

/// Tunables for the whole ingestion engine.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Root for cursors, tracker checkpoints and the stats file
    pub state_dir: PathBuf,
    /// How often tailers look for new bytes
    pub poll_interval: Duration,
    /// Ceiling for the tailer's backoff on missing or unreadable files
    pub max_backoff: Duration,
    /// Minimum spacing between checkpoints of one tailer
    pub flush_interval: Duration,
    /// Upper bound on bytes read by one poll
    pub max_read_bytes: usize,
    /// Live query cadence per server
    pub query_interval: Duration,
    pub query: QueryConfig,
    /// Capacity of each server's tracker queue
    pub server_queue: usize,
    /// Capacity of the aggregator queue
    pub aggregator_queue: usize,
    /// Log-time window in which a departed name is not reopened from snapshots
    pub identity_window: Duration,
    /// Consecutive snapshots a session may be missing from before it is closed
    pub absent_snapshot_limit: u32,
    /// Size of the aggregator's recently-applied key window
    pub dedup_window: usize,
    /// Retries for transient store failures
    pub store_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            poll_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            flush_interval: Duration::from_secs(2),
            max_read_bytes: 1024 * 1024,
            query_interval: Duration::from_secs(15),
            query: QueryConfig::default(),
            server_queue: 1024,
            aggregator_queue: 1024,
            identity_window: Duration::from_secs(120),
            absent_snapshot_limit: 3,
            dedup_window: 4096,
            store_retries: 3,
        }
    }
}

impl IngestConfig {
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn cursor_dir(&self) -> PathBuf {
        self.state_dir.join("cursors")
    }

    pub fn tracker_dir(&self) -> PathBuf {
        self.state_dir.join("trackers")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.state_dir.join("stats.json")
    }

    pub fn checkpoint_path(&self, server: &str) -> PathBuf {
        self.tracker_dir()
            .join(format!("{}.bin", file_stem_for(server)))
    }
}

/// Parses and validates a JSON array of targets.
pub fn parse_targets(json: &str) -> Result<Vec<ServerTarget>, ConfigError> {
    let targets: Vec<ServerTarget> = serde_json::from_str(json)?;

    let mut seen = HashSet::new();
    for target in &targets {
        if target.name.trim().is_empty() {
            return Err(ConfigError::Invalid("empty server name".to_string()));
        }
        if target.log_path.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "server {} has no log path",
                target.name
            )));
        }
        if !seen.insert(file_stem_for(&target.name)) {
            return Err(ConfigError::Invalid(format!(
                "duplicate server name {}",
                target.name
            )));
        }
    }

    Ok(targets)
}

pub fn load_targets(path: &Path) -> Result<Vec<ServerTarget>, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_targets(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        let json = r#"[
            {"name": "ins-1", "logPath": "/srv/ins1/console.log", "enabled": true, "queryAddr": "127.0.0.1:27015"},
            {"name": "ins-2", "logPath": "/srv/ins2/console.log", "enabled": false}
        ]"#;

        let targets = parse_targets(json).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].query_addr.as_deref(), Some("127.0.0.1:27015"));
        assert!(!targets[1].enabled);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"[
            {"name": "a", "logPath": "x.log", "enabled": true},
            {"name": "a", "logPath": "y.log", "enabled": true}
        ]"#;
        assert!(matches!(parse_targets(json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_names_colliding_on_disk_rejected() {
        let json = r#"[
            {"name": "eu/1", "logPath": "x.log", "enabled": true},
            {"name": "eu_1", "logPath": "y.log", "enabled": true}
        ]"#;
        assert!(matches!(parse_targets(json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_log_path_rejected() {
        let json = r#"[{"name": "a", "logPath": " ", "enabled": true}]"#;
        assert!(matches!(parse_targets(json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_state_paths() {
        let config = IngestConfig::default().with_state_dir("/var/lib/fragstat");
        assert_eq!(
            config.checkpoint_path("ins-1"),
            PathBuf::from("/var/lib/fragstat/trackers/ins-1.bin")
        );
        assert_eq!(
            config.stats_path(),
            PathBuf::from("/var/lib/fragstat/stats.json")
        );
    }
}
