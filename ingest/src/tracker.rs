//! Per-server match and round state machine.
//!
//! The tracker consumes one server's events strictly in file order, keeps the
//! current match and its player roster, and turns combat into statistic
//! deltas. It also merges live snapshots into the roster. Everything it knows
//! lives in [`TrackerState`], which is checkpointed with bincode so a restart
//! picks up mid-match.

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::{
    Event, EventKind, IdempotencyKey, Identity, LinePosition, LiveSnapshot, MatchId, MatchRecord,
    MatchState, Metric, Phase, PlayerRef, QueryOutcome, ServerId, StatDelta, UNKNOWN_MAP,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::identity::{IdentityResolver, SnapshotMatch};
use crate::messages::{AggregatorMessage, TrackerMessage};
use crate::parser::EventParser;
use crate::session_manager::{PlayerSession, SessionManager, SessionOrigin};
use crate::tailer::RawLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackerPhase {
    /// No match is open.
    Idle,
    Warmup,
    RoundActive,
    RoundEnd,
}

impl TrackerPhase {
    fn match_state(self) -> Option<MatchState> {
        match self {
            TrackerPhase::Idle => None,
            TrackerPhase::Warmup => Some(MatchState::Warmup),
            TrackerPhase::RoundActive => Some(MatchState::RoundActive),
            TrackerPhase::RoundEnd => Some(MatchState::RoundEnd),
        }
    }
}

/// Everything one applied event or snapshot produced, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerOutput {
    Transition {
        from: TrackerPhase,
        to: TrackerPhase,
    },
    MatchOpened(MatchRecord),
    MatchClosed(MatchRecord),
    /// Deltas derived from a single log line.
    Stats(Vec<StatDelta>),
    SessionOpened(PlayerSession),
    SessionClosed(PlayerSession),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerCounters {
    pub lines: u64,
    pub unrecognized: u64,
    pub illegal_transitions: u64,
    /// Combat seen outside an active round
    pub out_of_round: u64,
    /// Lines skipped because they were applied before a restart
    pub replayed: u64,
    pub snapshots: u64,
    pub unreachable_snapshots: u64,
    pub missed_round_ends: u64,
    pub implicit_matches: u64,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub identity_window: Duration,
    pub absent_snapshot_limit: u32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            identity_window: Duration::from_secs(120),
            absent_snapshot_limit: 3,
        }
    }
}

impl From<&IngestConfig> for TrackerSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            identity_window: config.identity_window,
            absent_snapshot_limit: config.absent_snapshot_limit,
        }
    }
}

/// Durable part of a tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerState {
    pub server: ServerId,
    pub phase: TrackerPhase,
    pub current: Option<MatchRecord>,
    /// Whether a round or any combat happened since `current` opened
    pub active_since_open: bool,
    pub sessions: SessionManager,
    pub resolver: IdentityResolver,
    /// Position of the last line applied; lines at or before it are replays
    pub last_applied: Option<LinePosition>,
    /// Latest in-game timestamp seen
    pub clock: Option<NaiveDateTime>,
    pub last_match_start: Option<NaiveDateTime>,
    pub counters: TrackerCounters,
}

impl TrackerState {
    pub fn new(server: ServerId, identity_window: Duration) -> Self {
        Self {
            server,
            phase: TrackerPhase::Idle,
            current: None,
            active_since_open: false,
            sessions: SessionManager::new(),
            resolver: IdentityResolver::new(identity_window),
            last_applied: None,
            clock: None,
            last_match_start: None,
            counters: TrackerCounters::default(),
        }
    }
}

/// Builds the numbered deltas of one log line.
struct DeltaBatch {
    position: LinePosition,
    match_id: MatchId,
    phase: Phase,
    deltas: Vec<StatDelta>,
}

impl DeltaBatch {
    fn new(position: LinePosition, match_id: MatchId, phase: Phase) -> Self {
        Self {
            position,
            match_id,
            phase,
            deltas: Vec::new(),
        }
    }

    fn push(&mut self, identity: &Identity, metric: Metric, amount: i64) {
        let slot = self.deltas.len() as u8;
        self.deltas.push(StatDelta {
            key: IdempotencyKey::new(&self.position, slot),
            match_id: self.match_id.clone(),
            identity: identity.clone(),
            metric,
            amount,
            phase: self.phase,
        });
    }
}

pub struct MatchTracker {
    state: TrackerState,
    absent_snapshot_limit: u32,
}

impl MatchTracker {
    pub fn new(server: ServerId, settings: TrackerSettings) -> Self {
        let state = TrackerState::new(server, settings.identity_window);
        Self {
            state,
            absent_snapshot_limit: settings.absent_snapshot_limit.max(1),
        }
    }

    /// Resumes from a checkpoint, applying the current settings.
    pub fn from_state(mut state: TrackerState, settings: TrackerSettings) -> Self {
        state.resolver.set_window(settings.identity_window);
        Self {
            state,
            absent_snapshot_limit: settings.absent_snapshot_limit.max(1),
        }
    }

    pub fn server(&self) -> &ServerId {
        &self.state.server
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn phase(&self) -> TrackerPhase {
        self.state.phase
    }

    pub fn current_match(&self) -> Option<&MatchRecord> {
        self.state.current.as_ref()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.state.resolver
    }

    pub fn counters(&self) -> &TrackerCounters {
        &self.state.counters
    }

    fn is_replay(&self, position: &LinePosition) -> bool {
        match &self.state.last_applied {
            Some(last) if last.file == position.file => {
                (position.epoch, position.start) <= (last.epoch, last.start)
            }
            _ => false,
        }
    }

    /// Parses and applies one raw line unless it was already applied.
    pub fn handle_line(&mut self, parser: &EventParser, line: &RawLine) -> Vec<TrackerOutput> {
        if self.is_replay(&line.position) {
            self.state.counters.replayed += 1;
            return Vec::new();
        }

        let event = parser.parse(&self.state.server, &line.text);
        let outputs = self.apply(&event, &line.position);
        self.state.last_applied = Some(line.position);
        outputs
    }

    /// Applies one parsed event that came from the line at `position`.
    pub fn apply(&mut self, event: &Event, position: &LinePosition) -> Vec<TrackerOutput> {
        let mut out = Vec::new();
        self.state.counters.lines += 1;
        let at = self.tick(event.timestamp);

        match &event.kind {
            EventKind::Unrecognized { .. } => self.state.counters.unrecognized += 1,
            EventKind::PlayerConnect { player, .. } => {
                self.observe(player, at, &mut out);
            }
            EventKind::PlayerDisconnect { player, .. } => {
                let identity = self.resolve(player, at);
                if let Some(session) = self.state.sessions.close(&identity, at) {
                    out.push(TrackerOutput::SessionClosed(session));
                }
                self.state.resolver.retire(&identity, at);
            }
            EventKind::ChatMessage { player, .. } => {
                self.observe(player, at, &mut out);
            }
            EventKind::TeamChange { player, team } => {
                let identity = self.observe(player, at, &mut out);
                if let Some(session) = self.state.sessions.get_mut(&identity) {
                    session.team = Some(team.clone());
                }
            }
            EventKind::NameChange { player, new_name } => {
                let identity = self.observe(player, at, &mut out);
                self.state.resolver.rename(&identity, new_name, at);
                if let Some(session) = self.state.sessions.get_mut(&identity) {
                    session.name = new_name.clone();
                }
            }
            EventKind::Kill {
                attacker,
                victim,
                weapon,
                headshot,
            } => {
                let mut batch = self.combat_batch(position, at, &mut out);
                let a = self.observe(attacker, at, &mut out);
                let v = self.observe(victim, at, &mut out);
                if a == v {
                    batch.push(&v, Metric::Death, 1);
                    batch.push(&v, Metric::Suicide, 1);
                } else {
                    let team_kill = matches!(
                        (&attacker.team, &victim.team),
                        (Some(x), Some(y)) if x == y
                    );
                    let kill = if team_kill {
                        Metric::TeamKill
                    } else {
                        Metric::Kill
                    };
                    batch.push(&a, kill, 1);
                    batch.push(&v, Metric::Death, 1);
                    if *headshot {
                        batch.push(&a, Metric::Headshot, 1);
                    }
                    batch.push(&a, Metric::WeaponKill(weapon.clone()), 1);
                    if *headshot {
                        batch.push(&a, Metric::WeaponHeadshot(weapon.clone()), 1);
                    }
                }
                out.push(TrackerOutput::Stats(batch.deltas));
            }
            EventKind::Damage {
                attacker,
                victim,
                amount,
                ..
            } => {
                let mut batch = self.combat_batch(position, at, &mut out);
                let a = self.observe(attacker, at, &mut out);
                let v = self.observe(victim, at, &mut out);
                if a != v {
                    batch.push(&a, Metric::DamageDealt, i64::from(*amount));
                }
                batch.push(&v, Metric::DamageTaken, i64::from(*amount));
                out.push(TrackerOutput::Stats(batch.deltas));
            }
            EventKind::Suicide { player, .. } => {
                let mut batch = self.combat_batch(position, at, &mut out);
                let identity = self.observe(player, at, &mut out);
                batch.push(&identity, Metric::Death, 1);
                batch.push(&identity, Metric::Suicide, 1);
                out.push(TrackerOutput::Stats(batch.deltas));
            }
            EventKind::RoundStart => self.round_start(at, &mut out),
            EventKind::RoundEnd { winner } => {
                if self.state.phase == TrackerPhase::RoundActive {
                    self.transition(TrackerPhase::RoundEnd, &mut out);
                    if let Some(team) = winner {
                        debug!("{}: round won by {}", self.state.server, team);
                    }
                } else {
                    self.state.counters.illegal_transitions += 1;
                    debug!(
                        "{}: round end ignored in {:?}",
                        self.state.server, self.state.phase
                    );
                }
            }
            EventKind::MapChange { map } => self.map_change(map, at, &mut out),
            EventKind::GameOver => {
                if self.state.phase == TrackerPhase::Idle {
                    self.state.counters.illegal_transitions += 1;
                    debug!("{}: game over with no open match", self.state.server);
                } else {
                    self.close_match(at, &mut out);
                    for (closed, opened) in self.state.sessions.roll_over(None, at) {
                        out.push(TrackerOutput::SessionClosed(closed));
                        out.push(TrackerOutput::SessionOpened(opened));
                    }
                    self.transition(TrackerPhase::Idle, &mut out);
                }
            }
        }

        out
    }

    /// Merges one live snapshot into the roster.
    pub fn merge_snapshot(&mut self, snapshot: &LiveSnapshot) -> Vec<TrackerOutput> {
        let mut out = Vec::new();
        self.state.counters.snapshots += 1;

        let players = match &snapshot.outcome {
            QueryOutcome::Reachable { players, .. } => players,
            QueryOutcome::Unreachable { attempts, reason } => {
                self.state.counters.unreachable_snapshots += 1;
                debug!(
                    "{}: unreachable after {} attempts ({})",
                    self.state.server, attempts, reason
                );
                return out;
            }
        };

        let at = self
            .state
            .clock
            .unwrap_or_else(|| snapshot.taken_at.naive_utc());

        if let (Some(map), Some(record)) = (snapshot.map(), self.state.current.as_mut()) {
            if record.map == UNKNOWN_MAP && !map.is_empty() {
                info!("{}: match {} is on {}", self.state.server, record.id, map);
                record.map = map.to_string();
                out.push(TrackerOutput::MatchOpened(record.clone()));
            }
        }

        let present: HashSet<&str> = players
            .iter()
            .map(|p| p.name.as_str())
            .filter(|name| !name.is_empty())
            .collect();

        let mut names: Vec<&str> = present.iter().copied().collect();
        names.sort_unstable();
        for name in names {
            if self.state.sessions.find_by_name(name).is_some() {
                continue;
            }
            let identity = match self.state.resolver.resolve_snapshot(name, at) {
                SnapshotMatch::Known { identity, .. } | SnapshotMatch::Unknown { identity } => {
                    identity
                }
                SnapshotMatch::RecentlyLeft { identity } => {
                    debug!("{}: {} left recently; not reopened", self.state.server, identity);
                    continue;
                }
            };
            let session = PlayerSession::new(
                identity,
                name,
                self.current_id(),
                at,
                SessionOrigin::Snapshot,
            );
            if self.state.sessions.open(session.clone()) {
                out.push(TrackerOutput::SessionOpened(session));
            }
        }

        for identity in self
            .state
            .sessions
            .record_snapshot(&present, self.absent_snapshot_limit)
        {
            if let Some(session) = self.state.sessions.close(&identity, at) {
                debug!(
                    "{}: {} missing from {} snapshots; closed",
                    self.state.server, identity, self.absent_snapshot_limit
                );
                out.push(TrackerOutput::SessionClosed(session));
            }
            self.state.resolver.retire(&identity, at);
        }

        out
    }

    /// Closes the open match and every session because ingestion is stopping.
    pub fn shutdown(&mut self) -> Vec<TrackerOutput> {
        let mut out = Vec::new();
        let at = self.now();

        self.close_match(at, &mut out);
        for session in self.state.sessions.close_all(at) {
            out.push(TrackerOutput::SessionClosed(session));
        }
        self.transition(TrackerPhase::Idle, &mut out);
        out
    }

    fn tick(&mut self, timestamp: Option<NaiveDateTime>) -> NaiveDateTime {
        if let Some(ts) = timestamp {
            self.state.clock = Some(ts);
        }
        self.now()
    }

    fn now(&self) -> NaiveDateTime {
        self.state
            .clock
            .unwrap_or_else(|| Utc::now().naive_utc())
    }

    fn current_id(&self) -> Option<MatchId> {
        self.state.current.as_ref().map(|m| m.id.clone())
    }

    fn transition(&mut self, to: TrackerPhase, out: &mut Vec<TrackerOutput>) {
        let from = self.state.phase;
        if from == to {
            return;
        }
        self.state.phase = to;
        if let (Some(record), Some(state)) = (self.state.current.as_mut(), to.match_state()) {
            record.state = state;
        }
        out.push(TrackerOutput::Transition { from, to });
    }

    fn open_match(&mut self, map: &str, at: NaiveDateTime, out: &mut Vec<TrackerOutput>) {
        // Two matches on one server must never share an id.
        let started_at = match self.state.last_match_start {
            Some(last) if at <= last => last + ChronoDuration::seconds(1),
            _ => at,
        };
        self.state.last_match_start = Some(started_at);

        let record = MatchRecord::open(self.state.server.clone(), map, started_at);
        info!("{}: match {} opened on {}", self.state.server, record.id, map);
        out.push(TrackerOutput::MatchOpened(record.clone()));

        self.state.sessions.assign_match(&record.id);
        for (closed, opened) in self.state.sessions.roll_over(Some(&record.id), at) {
            out.push(TrackerOutput::SessionClosed(closed));
            out.push(TrackerOutput::SessionOpened(opened));
        }

        self.state.current = Some(record);
        self.state.active_since_open = false;
        self.transition(TrackerPhase::Warmup, out);
    }

    fn close_match(&mut self, at: NaiveDateTime, out: &mut Vec<TrackerOutput>) {
        let Some(mut record) = self.state.current.take() else {
            return;
        };
        record.state = MatchState::Concluded;
        record.ended_at = Some(at);
        info!(
            "{}: match {} concluded after {} rounds",
            self.state.server, record.id, record.round
        );
        out.push(TrackerOutput::MatchClosed(record));
    }

    fn ensure_match(&mut self, at: NaiveDateTime, out: &mut Vec<TrackerOutput>) -> MatchId {
        if let Some(record) = &self.state.current {
            return record.id.clone();
        }
        self.state.counters.implicit_matches += 1;
        debug!("{}: opening implicit match", self.state.server);
        self.open_match(UNKNOWN_MAP, at, out);
        self.current_id()
            .unwrap_or_else(|| MatchId::new(self.state.server.clone(), at))
    }

    fn combat_batch(
        &mut self,
        position: &LinePosition,
        at: NaiveDateTime,
        out: &mut Vec<TrackerOutput>,
    ) -> DeltaBatch {
        let match_id = self.ensure_match(at, out);
        self.state.active_since_open = true;
        let phase = if self.state.phase == TrackerPhase::RoundActive {
            Phase::Live
        } else {
            self.state.counters.out_of_round += 1;
            Phase::Warmup
        };
        DeltaBatch::new(*position, match_id, phase)
    }

    fn round_start(&mut self, at: NaiveDateTime, out: &mut Vec<TrackerOutput>) {
        match self.state.phase {
            TrackerPhase::Idle => {
                self.state.counters.implicit_matches += 1;
                self.open_match(UNKNOWN_MAP, at, out);
            }
            TrackerPhase::RoundActive => {
                self.state.counters.missed_round_ends += 1;
                warn!(
                    "{}: round start without a round end; closing the previous round",
                    self.state.server
                );
                self.transition(TrackerPhase::RoundEnd, out);
            }
            TrackerPhase::Warmup | TrackerPhase::RoundEnd => {}
        }

        if let Some(record) = self.state.current.as_mut() {
            record.round += 1;
        }
        self.state.active_since_open = true;
        self.transition(TrackerPhase::RoundActive, out);
    }

    fn map_change(&mut self, map: &str, at: NaiveDateTime, out: &mut Vec<TrackerOutput>) {
        if let Some(record) = &self.state.current {
            if record.map == map && !self.state.active_since_open {
                debug!("{}: repeated map line for {} ignored", self.state.server, map);
                return;
            }
        }
        self.close_match(at, out);
        self.open_match(map, at, out);
    }

    /// Resolves a log player and moves any session held under the
    /// provisional identity it supersedes.
    fn resolve(&mut self, player: &PlayerRef, at: NaiveDateTime) -> Identity {
        let resolution = self.state.resolver.resolve_log(player, at);
        if let Some(old) = &resolution.replaced {
            if self.state.sessions.rekey(old, &resolution.identity) {
                debug!(
                    "{}: {} is now known as {}",
                    self.state.server, old, resolution.identity
                );
            }
        }
        resolution.identity
    }

    /// Resolves a player and opens or refreshes their session.
    fn observe(
        &mut self,
        player: &PlayerRef,
        at: NaiveDateTime,
        out: &mut Vec<TrackerOutput>,
    ) -> Identity {
        let identity = self.resolve(player, at);

        match self.state.sessions.get_mut(&identity) {
            Some(session) => {
                session.touch(at);
                session.name = player.name.clone();
                if player.uid.is_some() {
                    session.uid = player.uid;
                }
                if player.team.is_some() {
                    session.team = player.team.clone();
                }
                if session.origin == SessionOrigin::Snapshot {
                    session.origin = SessionOrigin::Log;
                }
            }
            None => {
                let mut session = PlayerSession::new(
                    identity.clone(),
                    player.name.clone(),
                    self.current_id(),
                    at,
                    SessionOrigin::Log,
                );
                session.uid = player.uid;
                session.team = player.team.clone();
                self.state.sessions.open(session.clone());
                out.push(TrackerOutput::SessionOpened(session));
            }
        }

        identity
    }
}

/// Sends the aggregator everything it needs from `outputs`.
///
/// Returns false once the aggregator is gone.
async fn forward(outputs: Vec<TrackerOutput>, aggregator: &mpsc::Sender<AggregatorMessage>) -> bool {
    for output in outputs {
        let message = match output {
            TrackerOutput::Stats(deltas) if !deltas.is_empty() => AggregatorMessage::Batch(deltas),
            TrackerOutput::MatchOpened(record) => AggregatorMessage::OpenMatch(record),
            TrackerOutput::MatchClosed(record) => AggregatorMessage::CloseMatch {
                ended_at: record.ended_at.unwrap_or(record.started_at),
                rounds: record.round,
                id: record.id,
            },
            _ => continue,
        };
        if aggregator.send(message).await.is_err() {
            return false;
        }
    }
    true
}

/// Commits the aggregator, then persists tracker state.
///
/// A crash between the two only replays lines the store already holds.
async fn checkpoint(
    tracker: &MatchTracker,
    checkpoints: &CheckpointStore,
    aggregator: &mpsc::Sender<AggregatorMessage>,
) -> bool {
    let server = tracker.server().clone();

    let (ack_tx, ack_rx) = oneshot::channel();
    if aggregator
        .send(AggregatorMessage::Commit {
            server: server.clone(),
            ack: ack_tx,
        })
        .await
        .is_err()
    {
        error!("{}: aggregator closed before commit", server);
        return false;
    }
    match ack_rx.await {
        Ok(true) => {}
        Ok(false) => return false,
        Err(_) => {
            error!("{}: aggregator dropped the commit", server);
            return false;
        }
    }

    let state = tracker.state().clone();
    let store = checkpoints.clone();
    match task::spawn_blocking(move || store.save(&state)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("{}: failed to persist tracker state: {}", server, e);
            false
        }
        Err(e) => {
            error!("{}: checkpoint task failed: {}", server, e);
            false
        }
    }
}

/// Applies one server's queue until every sender is gone, then closes the
/// open match and commits.
pub async fn run_tracker(
    mut tracker: MatchTracker,
    parser: Arc<EventParser>,
    checkpoints: CheckpointStore,
    mut rx: mpsc::Receiver<TrackerMessage>,
    aggregator: mpsc::Sender<AggregatorMessage>,
) {
    let server = tracker.server().clone();
    info!("Tracker for {} started in {:?}", server, tracker.phase());

    while let Some(message) = rx.recv().await {
        let outputs = match message {
            TrackerMessage::Line(line) => tracker.handle_line(&parser, &line),
            TrackerMessage::Snapshot(snapshot) => tracker.merge_snapshot(&snapshot),
            TrackerMessage::Checkpoint { ack } => {
                let durable = checkpoint(&tracker, &checkpoints, &aggregator).await;
                debug!("{}: {:?}", server, tracker.counters());
                let _ = ack.send(durable);
                continue;
            }
        };

        if !forward(outputs, &aggregator).await {
            error!("Aggregator is gone; stopping tracker for {}", server);
            return;
        }
    }

    let outputs = tracker.shutdown();
    if forward(outputs, &aggregator).await {
        checkpoint(&tracker, &checkpoints, &aggregator).await;
    }
    info!("Tracker for {} stopped: {:?}", server, tracker.counters());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use shared::{FileIdentity, ServerInfo, SnapshotPlayer};
    use tempfile::TempDir;

    const FILE: FileIdentity = FileIdentity {
        device: 1,
        inode: 1,
    };

    fn at(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap()
            + ChronoDuration::seconds(secs)
    }

    fn pos(offset: u64) -> LinePosition {
        LinePosition {
            file: FILE,
            epoch: 0,
            start: offset,
            end: offset + 1,
        }
    }

    fn tracker() -> MatchTracker {
        MatchTracker::new(ServerId::new("s"), TrackerSettings::default())
    }

    fn event(secs: i64, kind: EventKind) -> Event {
        Event::new(ServerId::new("s"), Some(at(secs)), kind)
    }

    fn player(name: &str, uid: u32, team: &str) -> PlayerRef {
        PlayerRef {
            name: name.to_string(),
            uid: Some(uid),
            steam_id: Some(format!("STEAM_1:0:{}", uid)),
            team: Some(team.to_string()),
            is_bot: false,
        }
    }

    fn kill(a: PlayerRef, v: PlayerRef, headshot: bool) -> EventKind {
        EventKind::Kill {
            attacker: a,
            victim: v,
            weapon: "ak74".to_string(),
            headshot,
        }
    }

    fn map(name: &str) -> EventKind {
        EventKind::MapChange {
            map: name.to_string(),
        }
    }

    fn stats(outputs: &[TrackerOutput]) -> Vec<StatDelta> {
        outputs
            .iter()
            .filter_map(|o| match o {
                TrackerOutput::Stats(d) => Some(d.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn snapshot(names: &[&str]) -> LiveSnapshot {
        let players = names
            .iter()
            .map(|n| SnapshotPlayer {
                name: n.to_string(),
                score: 0,
                duration: 10.0,
            })
            .collect();
        LiveSnapshot::reachable(ServerId::new("s"), None, players)
    }

    #[test]
    fn test_map_change_opens_match_in_warmup() {
        let mut t = tracker();
        let out = t.apply(&event(0, map("ministry")), &pos(0));

        assert_eq!(t.phase(), TrackerPhase::Warmup);
        let record = t.current_match().unwrap();
        assert_eq!(record.map, "ministry");
        assert_eq!(record.id, MatchId::new(ServerId::new("s"), at(0)));
        assert!(out.contains(&TrackerOutput::Transition {
            from: TrackerPhase::Idle,
            to: TrackerPhase::Warmup
        }));
    }

    #[test]
    fn test_rounds_count_and_live_kill() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));
        t.apply(&event(5, EventKind::RoundStart), &pos(10));

        let out = t.apply(
            &event(9, kill(player("A", 2, "Security"), player("B", 3, "Insurgents"), true)),
            &pos(20),
        );
        let deltas = stats(&out);
        let metrics: Vec<&Metric> = deltas.iter().map(|d| &d.metric).collect();
        assert_eq!(
            metrics,
            vec![
                &Metric::Kill,
                &Metric::Death,
                &Metric::Headshot,
                &Metric::WeaponKill("ak74".to_string()),
                &Metric::WeaponHeadshot("ak74".to_string()),
            ]
        );
        assert!(deltas.iter().all(|d| d.phase == Phase::Live));
        assert!(deltas.iter().all(|d| d.key.offset == 20));
        let slots: Vec<u8> = deltas.iter().map(|d| d.key.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
        assert_eq!(t.current_match().unwrap().round, 1);
        assert_eq!(t.sessions().len(), 2);
    }

    #[test]
    fn test_team_kill_and_self_kill() {
        let mut t = tracker();
        t.apply(&event(0, EventKind::RoundStart), &pos(0));

        let out = t.apply(
            &event(1, kill(player("A", 2, "Security"), player("C", 4, "Security"), false)),
            &pos(10),
        );
        assert_eq!(stats(&out)[0].metric, Metric::TeamKill);

        let out = t.apply(
            &event(2, kill(player("A", 2, "Security"), player("A", 2, "Security"), false)),
            &pos(20),
        );
        let metrics: Vec<Metric> = stats(&out).into_iter().map(|d| d.metric).collect();
        assert_eq!(metrics, vec![Metric::Death, Metric::Suicide]);
    }

    #[test]
    fn test_combat_in_idle_opens_implicit_warmup_match() {
        let mut t = tracker();
        let out = t.apply(
            &event(0, kill(player("A", 2, "Security"), player("B", 3, "Insurgents"), false)),
            &pos(0),
        );

        let record = t.current_match().unwrap();
        assert_eq!(record.map, UNKNOWN_MAP);
        assert_eq!(t.phase(), TrackerPhase::Warmup);
        assert!(stats(&out).iter().all(|d| d.phase == Phase::Warmup));
        assert_eq!(t.counters().implicit_matches, 1);
        assert_eq!(t.counters().out_of_round, 1);
    }

    #[test]
    fn test_round_end_outside_round_is_illegal() {
        let mut t = tracker();
        let out = t.apply(&event(0, EventKind::RoundEnd { winner: None }), &pos(0));

        assert!(out.is_empty());
        assert_eq!(t.phase(), TrackerPhase::Idle);
        assert_eq!(t.counters().illegal_transitions, 1);
    }

    #[test]
    fn test_round_start_during_round_closes_previous() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));
        t.apply(&event(1, EventKind::RoundStart), &pos(10));
        let out = t.apply(&event(2, EventKind::RoundStart), &pos(20));

        assert_eq!(
            out,
            vec![
                TrackerOutput::Transition {
                    from: TrackerPhase::RoundActive,
                    to: TrackerPhase::RoundEnd
                },
                TrackerOutput::Transition {
                    from: TrackerPhase::RoundEnd,
                    to: TrackerPhase::RoundActive
                },
            ]
        );
        assert_eq!(t.current_match().unwrap().round, 2);
        assert_eq!(t.counters().missed_round_ends, 1);
    }

    #[test]
    fn test_map_change_rolls_sessions_into_new_match() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));
        t.apply(
            &event(1, EventKind::PlayerConnect { player: player("A", 2, "Security"), address: None }),
            &pos(10),
        );
        t.apply(&event(2, EventKind::RoundStart), &pos(20));

        let out = t.apply(&event(600, map("buhriz")), &pos(30));

        let closed = out.iter().find_map(|o| match o {
            TrackerOutput::MatchClosed(r) => Some(r.clone()),
            _ => None,
        });
        let closed = closed.unwrap();
        assert!(closed.is_concluded());
        assert_eq!(closed.ended_at, Some(at(600)));
        assert_eq!(closed.round, 1);

        let new_id = MatchId::new(ServerId::new("s"), at(600));
        let session = t.sessions().get(&Identity::Steam("STEAM_1:0:2".to_string())).unwrap();
        assert_eq!(session.match_id, Some(new_id));
        assert_eq!(session.joined_at, at(600));
        assert!(out
            .iter()
            .any(|o| matches!(o, TrackerOutput::SessionClosed(s) if s.match_id == Some(closed.id.clone()))));
    }

    #[test]
    fn test_repeated_map_line_is_ignored() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));
        let out = t.apply(&event(1, map("ministry")), &pos(10));

        assert!(out.is_empty());
        assert_eq!(t.current_match().unwrap().started_at, at(0));
    }

    #[test]
    fn test_game_over_returns_to_idle() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));
        t.apply(
            &event(1, EventKind::PlayerConnect { player: player("A", 2, "Security"), address: None }),
            &pos(10),
        );
        t.apply(&event(900, EventKind::GameOver), &pos(20));

        assert_eq!(t.phase(), TrackerPhase::Idle);
        assert!(t.current_match().is_none());
        let session = t.sessions().get(&Identity::Steam("STEAM_1:0:2".to_string())).unwrap();
        assert_eq!(session.match_id, None);

        t.apply(&event(901, EventKind::GameOver), &pos(30));
        assert_eq!(t.counters().illegal_transitions, 1);
    }

    #[test]
    fn test_match_ids_never_collide() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));
        t.apply(&event(0, EventKind::RoundStart), &pos(10));
        t.apply(&event(0, map("buhriz")), &pos(20));

        assert_eq!(t.current_match().unwrap().started_at, at(1));
    }

    #[test]
    fn test_disconnect_closes_session() {
        let mut t = tracker();
        let a = player("A", 2, "Security");
        t.apply(
            &event(0, EventKind::PlayerConnect { player: a.clone(), address: None }),
            &pos(0),
        );
        let out = t.apply(
            &event(5, EventKind::PlayerDisconnect { player: a, reason: None }),
            &pos(10),
        );

        assert!(t.sessions().is_empty());
        assert!(matches!(&out[0], TrackerOutput::SessionClosed(s) if s.left_at == Some(at(5))));
    }

    #[test]
    fn test_name_change_renames_session() {
        let mut t = tracker();
        let a = player("A", 2, "Security");
        t.apply(
            &event(0, EventKind::NameChange { player: a, new_name: "Ace".to_string() }),
            &pos(0),
        );

        let session = t.sessions().get(&Identity::Steam("STEAM_1:0:2".to_string())).unwrap();
        assert_eq!(session.name, "Ace");
        assert_eq!(t.resolver().identities_for("Ace").len(), 1);
    }

    #[test]
    fn test_snapshot_opens_and_expires_sessions() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));

        let out = t.merge_snapshot(&snapshot(&["Ghost"]));
        assert!(matches!(&out[0], TrackerOutput::SessionOpened(s) if s.origin == SessionOrigin::Snapshot));
        let ghost = Identity::Name("Ghost".to_string());
        assert!(t.sessions().is_open(&ghost));

        t.merge_snapshot(&snapshot(&[]));
        t.merge_snapshot(&snapshot(&[]));
        assert!(t.sessions().is_open(&ghost));
        let out = t.merge_snapshot(&snapshot(&[]));
        assert!(!t.sessions().is_open(&ghost));
        assert!(matches!(&out[0], TrackerOutput::SessionClosed(_)));
    }

    #[test]
    fn test_snapshot_does_not_reopen_recent_leaver() {
        let mut t = tracker();
        let a = player("A", 2, "Security");
        t.apply(
            &event(0, EventKind::PlayerConnect { player: a.clone(), address: None }),
            &pos(0),
        );
        t.apply(
            &event(10, EventKind::PlayerDisconnect { player: a, reason: None }),
            &pos(10),
        );

        let out = t.merge_snapshot(&snapshot(&["A"]));
        assert!(out.is_empty());
        assert!(t.sessions().is_empty());
    }

    #[test]
    fn test_unreachable_snapshot_changes_nothing() {
        let mut t = tracker();
        let out = t.merge_snapshot(&LiveSnapshot::unreachable(ServerId::new("s"), 3, "timeout"));
        assert!(out.is_empty());
        assert_eq!(t.counters().unreachable_snapshots, 1);
    }

    #[test]
    fn test_snapshot_fills_unknown_map() {
        let mut t = tracker();
        t.apply(&event(0, EventKind::RoundStart), &pos(0));
        let info = ServerInfo {
            name: "srv".to_string(),
            map: "ministry".to_string(),
            folder: "insurgency".to_string(),
            game: "Insurgency".to_string(),
            app_id: 0,
            players: 0,
            max_players: 32,
            bots: 0,
            version: "1.0".to_string(),
        };
        let out = t.merge_snapshot(&LiveSnapshot::reachable(ServerId::new("s"), Some(info), vec![]));

        assert_eq!(t.current_match().unwrap().map, "ministry");
        assert!(matches!(&out[0], TrackerOutput::MatchOpened(r) if r.map == "ministry"));
    }

    #[test]
    fn test_replayed_lines_are_skipped() {
        let parser = EventParser::new().unwrap();
        let mut t = tracker();
        let line = |start: u64, epoch: u32| RawLine {
            server: ServerId::new("s"),
            position: LinePosition {
                file: FILE,
                epoch,
                start,
                end: start + 10,
            },
            text: r#"L 10/16/2026 - 20:00:00: World triggered "Round_Start""#.to_string(),
        };

        assert!(!t.handle_line(&parser, &line(0, 0)).is_empty());
        assert!(t.handle_line(&parser, &line(0, 0)).is_empty());
        assert_eq!(t.counters().replayed, 1);

        // a truncated file starts a new epoch and is not a replay
        t.handle_line(&parser, &line(0, 1));
        assert_eq!(t.counters().replayed, 1);
        assert_eq!(t.counters().missed_round_ends, 1);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let mut t = tracker();
        t.apply(&event(0, map("ministry")), &pos(0));
        t.apply(
            &event(1, EventKind::PlayerConnect { player: player("A", 2, "Security"), address: None }),
            &pos(10),
        );

        let out = t.shutdown();
        assert!(matches!(&out[0], TrackerOutput::MatchClosed(r) if r.ended_at == Some(at(1))));
        assert_eq!(t.phase(), TrackerPhase::Idle);
        assert!(t.sessions().is_empty());
    }

    #[test]
    fn test_random_sequences_keep_transitions_legal() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let a = player("A", 2, "Security");
        let b = player("B", 3, "Insurgents");

        for _ in 0..50 {
            let mut t = tracker();
            for step in 0..200u64 {
                let kind = match rng.gen_range(0..6) {
                    0 => EventKind::RoundStart,
                    1 => EventKind::RoundEnd { winner: None },
                    2 => map(if rng.gen_bool(0.5) { "ministry" } else { "buhriz" }),
                    3 => EventKind::GameOver,
                    4 => kill(a.clone(), b.clone(), rng.gen_bool(0.3)),
                    _ => EventKind::ChatMessage {
                        player: a.clone(),
                        text: "gg".to_string(),
                        team_only: false,
                    },
                };
                let is_round_start = kind == EventKind::RoundStart;
                let out = t.apply(&event(step as i64, kind), &pos(step * 100));

                let entries = out
                    .iter()
                    .filter(|o| {
                        matches!(o, TrackerOutput::Transition { to: TrackerPhase::RoundActive, .. })
                    })
                    .count();
                assert_eq!(entries, usize::from(is_round_start));
                assert!(!out.iter().any(|o| matches!(
                    o,
                    TrackerOutput::Transition {
                        from: TrackerPhase::Idle,
                        to: TrackerPhase::RoundEnd
                    }
                )));
                assert_eq!(t.phase() == TrackerPhase::Idle, t.current_match().is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_run_tracker_commits_before_ack_and_on_close() {
        let dir = TempDir::new().unwrap();
        let checkpoints = CheckpointStore::new(dir.path());
        let parser = Arc::new(EventParser::new().unwrap());
        let (tx, rx) = mpsc::channel(16);
        let (agg_tx, mut agg_rx) = mpsc::channel(16);

        let handle = tokio::spawn(run_tracker(tracker(), parser, checkpoints.clone(), rx, agg_tx));

        tx.send(TrackerMessage::Line(RawLine {
            server: ServerId::new("s"),
            position: pos(0),
            text: r#"L 10/16/2026 - 20:00:00: Loading map "ministry""#.to_string(),
        }))
        .await
        .unwrap();

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(TrackerMessage::Checkpoint { ack: ack_tx }).await.unwrap();

        assert!(matches!(agg_rx.recv().await, Some(AggregatorMessage::OpenMatch(_))));
        match agg_rx.recv().await {
            Some(AggregatorMessage::Commit { ack, .. }) => ack.send(true).unwrap(),
            other => panic!("expected commit, got {:?}", other),
        }
        assert!(ack_rx.await.unwrap());
        assert!(checkpoints.load(&ServerId::new("s")).unwrap().is_some());

        drop(tx);
        assert!(matches!(agg_rx.recv().await, Some(AggregatorMessage::CloseMatch { .. })));
        match agg_rx.recv().await {
            Some(AggregatorMessage::Commit { ack, .. }) => ack.send(true).unwrap(),
            other => panic!("expected commit, got {:?}", other),
        }
        handle.await.unwrap();

        let state = checkpoints.load(&ServerId::new("s")).unwrap().unwrap();
        assert_eq!(state.phase, TrackerPhase::Idle);
    }
}
