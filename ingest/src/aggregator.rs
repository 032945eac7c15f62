//! Applies tracker output to the stats store exactly once.

use chrono::NaiveDateTime;
use log::{debug, error, info, warn};
use shared::{IdempotencyKey, MatchId, MatchRecord, ServerId, StatDelta};
use std::collections::{HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot};

use crate::config::IngestConfig;
use crate::messages::AggregatorMessage;
use crate::store::{StatsStore, StoreError, UpsertOutcome};

/// Most messages drained behind a commit before the store is written
const COMMIT_COALESCE_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Keys remembered in front of the store
    pub window: usize,
    /// Extra attempts after a transient store failure
    pub retries: u32,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            window: 4096,
            retries: 3,
        }
    }
}

impl From<&IngestConfig> for AggregatorSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            window: config.dedup_window,
            retries: config.store_retries,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorCounters {
    pub applied: u64,
    pub duplicates: u64,
    /// Deltas answered from the recent-key window without touching the store
    pub window_hits: u64,
    pub retries: u64,
    pub failures: u64,
    /// Deltas refused because their server lost an earlier write
    pub held_back: u64,
    pub commits: u64,
}

pub struct StatsAggregator<S> {
    store: S,
    recent: VecDeque<IdempotencyKey>,
    recent_set: HashSet<IdempotencyKey>,
    window: usize,
    retries: u32,
    suspended: HashSet<ServerId>,
    counters: AggregatorCounters,
}

impl<S: StatsStore> StatsAggregator<S> {
    pub fn new(store: S, settings: AggregatorSettings) -> Self {
        Self {
            store,
            recent: VecDeque::with_capacity(settings.window),
            recent_set: HashSet::with_capacity(settings.window),
            window: settings.window,
            retries: settings.retries,
            suspended: HashSet::new(),
            counters: AggregatorCounters::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn counters(&self) -> &AggregatorCounters {
        &self.counters
    }

    /// Whether a write for `server` was lost in this process.
    ///
    /// Nothing more is applied for a suspended server. Its later lines would
    /// move the store's high-water mark past the lost one, and the replay
    /// after a restart would then be dropped as a duplicate.
    pub fn is_suspended(&self, server: &ServerId) -> bool {
        self.suspended.contains(server)
    }

    /// Applies one delta to both targets. Duplicates are success.
    pub fn apply(&mut self, delta: &StatDelta) -> Result<UpsertOutcome, StoreError> {
        let server = &delta.match_id.server;
        if self.suspended.contains(server) {
            self.counters.held_back += 1;
            return Err(StoreError::Suspended(server.clone()));
        }
        if self.recent_set.contains(&delta.key) {
            self.counters.window_hits += 1;
            self.counters.duplicates += 1;
            return Ok(UpsertOutcome::Duplicate);
        }

        let outcome = match self.with_retry(|store| store.upsert_delta(delta)) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.suspend(server);
                return Err(e);
            }
        };
        self.remember(delta.key);

        match outcome {
            UpsertOutcome::Applied => self.counters.applied += 1,
            UpsertOutcome::Duplicate => self.counters.duplicates += 1,
        }
        Ok(outcome)
    }

    /// Applies a batch in order, returning how many deltas changed anything.
    ///
    /// Stops at the first hard failure.
    pub fn apply_batch(&mut self, batch: &[StatDelta]) -> Result<usize, StoreError> {
        let mut applied = 0;
        for delta in batch {
            if self.apply(delta)? == UpsertOutcome::Applied {
                applied += 1;
            }
        }
        Ok(applied)
    }

    pub fn open_match(&mut self, record: &MatchRecord) -> Result<(), StoreError> {
        if self.suspended.contains(&record.id.server) {
            return Err(StoreError::Suspended(record.id.server.clone()));
        }
        let result = self.with_retry(|store| store.open_match(record));
        if result.is_err() {
            self.suspend(&record.id.server);
        }
        result
    }

    pub fn close_match(
        &mut self,
        id: &MatchId,
        ended_at: NaiveDateTime,
        rounds: u32,
    ) -> Result<(), StoreError> {
        if self.suspended.contains(&id.server) {
            return Err(StoreError::Suspended(id.server.clone()));
        }
        let result = self.with_retry(|store| store.close_match(id, ended_at, rounds));
        if result.is_err() {
            self.suspend(&id.server);
        }
        result
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.with_retry(|store| store.commit())?;
        self.counters.commits += 1;
        Ok(())
    }

    fn suspend(&mut self, server: &ServerId) {
        if self.suspended.insert(server.clone()) {
            warn!("Suspending writes for {} until restart", server);
        }
    }

    fn remember(&mut self, key: IdempotencyKey) {
        if self.window == 0 {
            return;
        }
        if self.recent.len() == self.window {
            if let Some(oldest) = self.recent.pop_front() {
                self.recent_set.remove(&oldest);
            }
        }
        self.recent.push_back(key);
        self.recent_set.insert(key);
    }

    fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut S) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            match op(&mut self.store) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    self.counters.retries += 1;
                    warn!("Store call failed ({}); retry {}/{}", e, attempt, self.retries);
                }
                Err(e) => {
                    self.counters.failures += 1;
                    return Err(e);
                }
            }
        }
    }
}

/// Drains the aggregator queue until every tracker is gone, then commits a
/// last time and hands the aggregator back.
///
/// Commits already queued behind the first one share a single store write.
/// A server with a lost write gets a failed ack on every later commit, so its
/// cursor stays behind the lost line and the line is replayed on restart.
pub async fn run_aggregator<S: StatsStore>(
    mut aggregator: StatsAggregator<S>,
    mut rx: mpsc::Receiver<AggregatorMessage>,
) -> StatsAggregator<S> {
    while let Some(message) = rx.recv().await {
        let Some(first) = handle_message(&mut aggregator, message) else {
            continue;
        };
        let mut pending = vec![first];
        for _ in 0..COMMIT_COALESCE_LIMIT {
            match rx.try_recv() {
                Ok(message) => pending.extend(handle_message(&mut aggregator, message)),
                Err(_) => break,
            }
        }

        let committed = match aggregator.commit() {
            Ok(()) => true,
            Err(e) => {
                error!("Commit failed: {}", e);
                false
            }
        };
        debug!("Committed for {} waiting trackers", pending.len());
        for (server, ack) in pending {
            let durable = committed && !aggregator.is_suspended(&server);
            debug!("Commit for {}: durable={}", server, durable);
            let _ = ack.send(durable);
        }
    }

    if let Err(e) = aggregator.commit() {
        error!("Final commit failed: {}", e);
    }
    info!("Aggregator stopped: {:?}", aggregator.counters());
    aggregator
}

// Applies one queued message. A commit request is handed back to the caller.
fn handle_message<S: StatsStore>(
    aggregator: &mut StatsAggregator<S>,
    message: AggregatorMessage,
) -> Option<(ServerId, oneshot::Sender<bool>)> {
    match message {
        AggregatorMessage::Batch(deltas) => match aggregator.apply_batch(&deltas) {
            Ok(_) => {}
            Err(StoreError::Suspended(server)) => {
                debug!("Held back {} deltas for {}", deltas.len(), server);
            }
            Err(e) => error!("Lost stats batch: {}", e),
        },
        AggregatorMessage::OpenMatch(record) => {
            if let Err(e) = aggregator.open_match(&record) {
                error!("Failed to record match {}: {}", record.id, e);
            }
        }
        AggregatorMessage::CloseMatch {
            id,
            ended_at,
            rounds,
        } => {
            if let Err(e) = aggregator.close_match(&id, ended_at, rounds) {
                error!("Failed to close match {}: {}", id, e);
            }
        }
        AggregatorMessage::Commit { server, ack } => return Some((server, ack)),
    }
    None
}
