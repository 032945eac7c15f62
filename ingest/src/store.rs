//! Durable statistics behind an idempotent upsert contract.
//!
//! Both stores keep, per source file and per target, the highest
//! idempotency key applied so far. Keys from one file only ever increase,
//! so anything at or below the mark has already been counted and is
//! reported as a duplicate instead of being applied twice.

use chrono::NaiveDateTime;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use shared::{
    IdempotencyKey, Identity, MatchId, MatchRecord, MatchState, PlayerStats, ServerId, StatDelta,
};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::utils::atomic_write;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("writes for {0} are suspended after a lost write")]
    Suspended(ServerId),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            StoreError::Json(_) | StoreError::Suspended(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The key was already applied; nothing changed.
    Duplicate,
}

/// Persistence interface used by the aggregator. Every call is idempotent.
pub trait StatsStore: Send {
    /// Counts `delta` towards the match totals and the all-time totals in
    /// one step. On error neither target has changed.
    fn upsert_delta(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError>;

    fn upsert_player_match_stats(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError>;

    fn upsert_all_time_stats(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError>;

    fn open_match(&mut self, record: &MatchRecord) -> Result<(), StoreError>;

    fn close_match(
        &mut self,
        id: &MatchId,
        ended_at: NaiveDateTime,
        rounds: u32,
    ) -> Result<(), StoreError>;

    /// Makes every change so far durable.
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// Everything a store holds. Keys are display strings so the JSON form
/// stays readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsData {
    pub matches: BTreeMap<String, MatchRecord>,
    /// Match id → identity → totals
    pub match_stats: BTreeMap<String, BTreeMap<String, PlayerStats>>,
    /// Identity → totals
    pub all_time: BTreeMap<String, PlayerStats>,
    #[serde(default)]
    match_marks: BTreeMap<String, IdempotencyKey>,
    #[serde(default)]
    all_time_marks: BTreeMap<String, IdempotencyKey>,
}

// Moves the file's high-water mark to `key`, or reports that it is not past it.
fn advance_mark(marks: &mut BTreeMap<String, IdempotencyKey>, key: &IdempotencyKey) -> bool {
    let file = key.file.to_string();
    match marks.get(&file) {
        Some(mark) if key <= mark => false,
        _ => {
            marks.insert(file, *key);
            true
        }
    }
}

impl StatsData {
    pub fn player_match_stats(&self, id: &MatchId, identity: &Identity) -> Option<&PlayerStats> {
        self.match_stats
            .get(&id.to_string())?
            .get(&identity.to_string())
    }

    pub fn all_time_stats(&self, identity: &Identity) -> Option<&PlayerStats> {
        self.all_time.get(&identity.to_string())
    }

    pub fn match_record(&self, id: &MatchId) -> Option<&MatchRecord> {
        self.matches.get(&id.to_string())
    }

    fn upsert_match_stats(&mut self, delta: &StatDelta) -> UpsertOutcome {
        if !advance_mark(&mut self.match_marks, &delta.key) {
            return UpsertOutcome::Duplicate;
        }
        self.match_stats
            .entry(delta.match_id.to_string())
            .or_default()
            .entry(delta.identity.to_string())
            .or_default()
            .apply(&delta.metric, delta.amount, delta.phase);
        UpsertOutcome::Applied
    }

    fn upsert_delta(&mut self, delta: &StatDelta) -> UpsertOutcome {
        let per_match = self.upsert_match_stats(delta);
        let all_time = self.upsert_all_time(delta);
        if per_match == UpsertOutcome::Applied || all_time == UpsertOutcome::Applied {
            UpsertOutcome::Applied
        } else {
            UpsertOutcome::Duplicate
        }
    }

    fn upsert_all_time(&mut self, delta: &StatDelta) -> UpsertOutcome {
        if !advance_mark(&mut self.all_time_marks, &delta.key) {
            return UpsertOutcome::Duplicate;
        }
        self.all_time
            .entry(delta.identity.to_string())
            .or_default()
            .apply(&delta.metric, delta.amount, delta.phase);
        UpsertOutcome::Applied
    }

    fn open_match(&mut self, record: &MatchRecord) {
        match self.matches.get_mut(&record.id.to_string()) {
            // a concluded match never reopens
            Some(existing) if existing.is_concluded() => {}
            Some(existing) => existing.map = record.map.clone(),
            None => {
                self.matches.insert(record.id.to_string(), record.clone());
            }
        }
    }

    fn close_match(&mut self, id: &MatchId, ended_at: NaiveDateTime, rounds: u32) {
        match self.matches.get_mut(&id.to_string()) {
            Some(record) => {
                record.state = MatchState::Concluded;
                record.ended_at = Some(ended_at);
                record.round = rounds;
            }
            None => warn!("Closing unknown match {}", id),
        }
    }
}

/// Store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: StatsData,
    commits: u64,
    /// Upserts that will fail with a transient error before succeeding again
    failures_pending: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &StatsData {
        &self.data
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Makes the next `count` upserts fail with [`StoreError::Transient`].
    pub fn fail_next(&mut self, count: u32) {
        self.failures_pending = count;
    }

    fn injected_failure(&mut self) -> Result<(), StoreError> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }
}

impl StatsStore for MemoryStore {
    fn upsert_delta(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError> {
        self.injected_failure()?;
        Ok(self.data.upsert_delta(delta))
    }

    fn upsert_player_match_stats(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError> {
        self.injected_failure()?;
        Ok(self.data.upsert_match_stats(delta))
    }

    fn upsert_all_time_stats(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError> {
        self.injected_failure()?;
        Ok(self.data.upsert_all_time(delta))
    }

    fn open_match(&mut self, record: &MatchRecord) -> Result<(), StoreError> {
        self.data.open_match(record);
        Ok(())
    }

    fn close_match(
        &mut self,
        id: &MatchId,
        ended_at: NaiveDateTime,
        rounds: u32,
    ) -> Result<(), StoreError> {
        self.data.close_match(id, ended_at, rounds);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.commits += 1;
        Ok(())
    }
}

/// Store persisted as one JSON document, rewritten atomically on commit.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: StatsData,
    dirty: bool,
}

impl JsonFileStore {
    /// Opens the document at `path`, starting empty if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = Self::load(&path)?.unwrap_or_default();
        debug!(
            "Opened stats store {} with {} matches",
            path.display(),
            data.matches.len()
        );
        Ok(Self {
            path,
            data,
            dirty: false,
        })
    }

    pub fn load(path: &Path) -> Result<Option<StatsData>, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &StatsData {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl StatsStore for JsonFileStore {
    fn upsert_delta(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.data.upsert_delta(delta);
        self.dirty |= outcome == UpsertOutcome::Applied;
        Ok(outcome)
    }

    fn upsert_player_match_stats(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.data.upsert_match_stats(delta);
        self.dirty |= outcome == UpsertOutcome::Applied;
        Ok(outcome)
    }

    fn upsert_all_time_stats(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.data.upsert_all_time(delta);
        self.dirty |= outcome == UpsertOutcome::Applied;
        Ok(outcome)
    }

    fn open_match(&mut self, record: &MatchRecord) -> Result<(), StoreError> {
        self.data.open_match(record);
        self.dirty = true;
        Ok(())
    }

    fn close_match(
        &mut self,
        id: &MatchId,
        ended_at: NaiveDateTime,
        rounds: u32,
    ) -> Result<(), StoreError> {
        self.data.close_match(id, ended_at, rounds);
        self.dirty = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let json = serde_json::to_vec(&self.data)?;
        atomic_write(&self.path, &json)?;
        self.dirty = false;
        debug!("Committed {} bytes to {}", json.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use shared::{FileIdentity, LinePosition, Metric, Phase, ServerId};
    use tempfile::TempDir;

    fn at(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(secs)
    }

    fn match_id() -> MatchId {
        MatchId::new(ServerId::new("s"), at(0))
    }

    fn delta(offset: u64, slot: u8, metric: Metric) -> StatDelta {
        let position = LinePosition {
            file: FileIdentity::new(1, 9),
            epoch: 0,
            start: offset,
            end: offset + 5,
        };
        StatDelta {
            key: IdempotencyKey::new(&position, slot),
            match_id: match_id(),
            identity: Identity::Steam("STEAM_1:0:1".to_string()),
            metric,
            amount: 1,
            phase: Phase::Live,
        }
    }

    #[test]
    fn test_upsert_twice_is_duplicate() {
        let mut store = MemoryStore::new();
        let kill = delta(10, 0, Metric::Kill);

        assert_eq!(store.upsert_player_match_stats(&kill).unwrap(), UpsertOutcome::Applied);
        assert_eq!(store.upsert_all_time_stats(&kill).unwrap(), UpsertOutcome::Applied);
        assert_eq!(store.upsert_player_match_stats(&kill).unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(store.upsert_all_time_stats(&kill).unwrap(), UpsertOutcome::Duplicate);

        let id = Identity::Steam("STEAM_1:0:1".to_string());
        assert_eq!(store.data().player_match_stats(&match_id(), &id).unwrap().kills, 1);
        assert_eq!(store.data().all_time_stats(&id).unwrap().kills, 1);
    }

    #[test]
    fn test_older_keys_from_same_file_are_duplicates() {
        let mut store = MemoryStore::new();
        store.upsert_all_time_stats(&delta(100, 1, Metric::Kill)).unwrap();

        assert_eq!(
            store.upsert_all_time_stats(&delta(100, 0, Metric::Kill)).unwrap(),
            UpsertOutcome::Duplicate
        );
        assert_eq!(
            store.upsert_all_time_stats(&delta(40, 0, Metric::Kill)).unwrap(),
            UpsertOutcome::Duplicate
        );
        assert_eq!(
            store.upsert_all_time_stats(&delta(101, 0, Metric::Kill)).unwrap(),
            UpsertOutcome::Applied
        );
    }

    #[test]
    fn test_match_lifecycle_is_idempotent() {
        let mut store = MemoryStore::new();
        let record = MatchRecord::open(ServerId::new("s"), "unknown", at(0));
        store.open_match(&record).unwrap();

        let mut renamed = record.clone();
        renamed.map = "ministry".to_string();
        store.open_match(&renamed).unwrap();

        store.close_match(&record.id, at(600), 7).unwrap();
        store.close_match(&record.id, at(600), 7).unwrap();
        store.open_match(&record).unwrap();

        let stored = store.data().match_record(&record.id).unwrap();
        assert_eq!(stored.map, "ministry");
        assert_eq!(stored.state, MatchState::Concluded);
        assert_eq!(stored.round, 7);
        assert_eq!(stored.ended_at, Some(at(600)));
    }

    #[test]
    fn test_injected_failures_are_transient() {
        let mut store = MemoryStore::new();
        store.fail_next(1);

        let err = store
            .upsert_player_match_stats(&delta(0, 0, Metric::Kill))
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.upsert_player_match_stats(&delta(0, 0, Metric::Kill)).is_ok());
    }

    #[test]
    fn test_failed_upsert_delta_changes_neither_target() {
        let mut store = MemoryStore::new();
        let id = Identity::Steam("STEAM_1:0:1".to_string());
        store.fail_next(1);

        assert!(store.upsert_delta(&delta(0, 0, Metric::Kill)).is_err());
        assert!(store.data().player_match_stats(&match_id(), &id).is_none());
        assert!(store.data().all_time_stats(&id).is_none());

        assert_eq!(store.upsert_delta(&delta(0, 0, Metric::Kill)).unwrap(), UpsertOutcome::Applied);
        assert_eq!(store.upsert_delta(&delta(0, 0, Metric::Kill)).unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(store.data().player_match_stats(&match_id(), &id).unwrap().kills, 1);
        assert_eq!(store.data().all_time_stats(&id).unwrap().kills, 1);
    }

    #[test]
    fn test_upsert_delta_catches_up_a_lagging_target() {
        let mut store = MemoryStore::new();
        let id = Identity::Steam("STEAM_1:0:1".to_string());
        store.upsert_player_match_stats(&delta(0, 0, Metric::Kill)).unwrap();

        assert_eq!(store.upsert_delta(&delta(0, 0, Metric::Kill)).unwrap(), UpsertOutcome::Applied);
        assert_eq!(store.data().player_match_stats(&match_id(), &id).unwrap().kills, 1);
        assert_eq!(store.data().all_time_stats(&id).unwrap().kills, 1);
    }

    #[test]
    fn test_json_store_commits_only_when_dirty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        let mut store = JsonFileStore::open(&path).unwrap();

        store.commit().unwrap();
        assert!(!path.exists());

        store.upsert_delta(&delta(0, 0, Metric::Kill)).unwrap();
        assert!(store.is_dirty());
        store.commit().unwrap();
        assert!(!store.is_dirty());
        // one compact line, not an indented document
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains('\n'));

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.data(), store.data());
    }

    #[test]
    fn test_json_store_remembers_marks_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        store.upsert_all_time_stats(&delta(50, 0, Metric::Death)).unwrap();
        store.commit().unwrap();

        let mut reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.upsert_all_time_stats(&delta(50, 0, Metric::Death)).unwrap(),
            UpsertOutcome::Duplicate
        );
        assert!(!reopened.is_dirty());
    }
}
