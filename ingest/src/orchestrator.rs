//! Registry of running servers and their tasks.
//!
//! Each enabled server gets a tailer task, an optional poller task and a
//! tracker task, all feeding the tracker through one bounded queue. Every
//! tracker feeds the single aggregator task. Stopping a server flips its
//! watch signal: the tailer checkpoints and exits, the poller aborts its
//! in-flight query, and the tracker drains its queue once both are gone.

use log::{info, warn};
use query::{Poller, QueryClient, QueryError};
use shared::{ServerId, ServerTarget};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::aggregator::{run_aggregator, AggregatorSettings, StatsAggregator};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::IngestConfig;
use crate::cursor::{CursorError, CursorStore};
use crate::messages::{AggregatorMessage, TrackerMessage};
use crate::parser::EventParser;
use crate::store::StatsStore;
use crate::tailer::{run_tailer, LogTailer, TailError, TailerSettings};
use crate::tracker::{run_tracker, MatchTracker, TrackerSettings};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid log grammar: {0}")]
    Grammar(#[from] regex::Error),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Tail(#[from] TailError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("server {0} is already running")]
    AlreadyRunning(ServerId),

    #[error("task failed: {0}")]
    Join(#[from] JoinError),
}

/// Tasks belonging to one running server
struct ServerHandle {
    target: ServerTarget,
    shutdown: watch::Sender<bool>,
    tailer: JoinHandle<()>,
    poller: Option<JoinHandle<()>>,
    tracker: JoinHandle<()>,
}

pub struct Orchestrator<S: StatsStore + 'static> {
    config: IngestConfig,
    parser: Arc<EventParser>,
    cursors: CursorStore,
    checkpoints: CheckpointStore,
    aggregator_tx: mpsc::Sender<AggregatorMessage>,
    aggregator: JoinHandle<StatsAggregator<S>>,
    servers: BTreeMap<ServerId, ServerHandle>,
}

impl<S: StatsStore + 'static> Orchestrator<S> {
    /// Spawns the aggregator over `store`. No server runs until started.
    pub fn new(config: IngestConfig, store: S) -> Result<Self, OrchestratorError> {
        let parser = Arc::new(EventParser::new()?);
        let (aggregator_tx, aggregator_rx) = mpsc::channel(config.aggregator_queue.max(1));
        let aggregator = StatsAggregator::new(store, AggregatorSettings::from(&config));
        let aggregator = tokio::spawn(run_aggregator(aggregator, aggregator_rx));

        Ok(Self {
            cursors: CursorStore::new(config.cursor_dir()),
            checkpoints: CheckpointStore::new(config.tracker_dir()),
            config,
            parser,
            aggregator_tx,
            aggregator,
            servers: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn is_running(&self, server: &ServerId) -> bool {
        self.servers.contains_key(server)
    }

    pub fn running(&self) -> Vec<&ServerId> {
        self.servers.keys().collect()
    }

    pub fn target(&self, server: &ServerId) -> Option<&ServerTarget> {
        self.servers.get(server).map(|h| &h.target)
    }

    /// Starts ingesting one server, resuming from its cursor and checkpoint.
    pub async fn start_server(&mut self, target: &ServerTarget) -> Result<(), OrchestratorError> {
        let id = target.id();
        if self.servers.contains_key(&id) {
            return Err(OrchestratorError::AlreadyRunning(id));
        }

        let saved = self.cursors.load(&id)?;
        let tailer = LogTailer::open(
            id.clone(),
            &target.log_path,
            saved,
            self.config.max_read_bytes,
        )?;

        let settings = TrackerSettings::from(&self.config);
        let tracker = match self.checkpoints.load(&id)? {
            Some(state) => {
                info!("Resuming tracker for {} in {:?}", id, state.phase);
                MatchTracker::from_state(state, settings)
            }
            None => MatchTracker::new(id.clone(), settings),
        };

        let (tx, rx) = mpsc::channel::<TrackerMessage>(self.config.server_queue.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let tracker = tokio::spawn(run_tracker(
            tracker,
            Arc::clone(&self.parser),
            self.checkpoints.clone(),
            rx,
            self.aggregator_tx.clone(),
        ));

        let poller = match &target.query_addr {
            Some(addr) => match QueryClient::resolve(addr, self.config.query.clone()).await {
                Ok(client) => {
                    let poller = Poller::new(id.clone(), client, self.config.query_interval);
                    Some(tokio::spawn(poller.run(tx.clone(), shutdown_rx.clone())))
                }
                Err(e) => {
                    warn!("No live snapshots for {}: {}", id, e);
                    None
                }
            },
            None => None,
        };

        let tailer = tokio::spawn(run_tailer(
            tailer,
            self.cursors.clone(),
            tx,
            TailerSettings {
                poll_interval: self.config.poll_interval,
                max_backoff: self.config.max_backoff,
                flush_interval: self.config.flush_interval,
            },
            shutdown_rx,
        ));

        info!("Started {} ({})", id, target.log_path);
        self.servers.insert(
            id,
            ServerHandle {
                target: target.clone(),
                shutdown,
                tailer,
                poller,
                tracker,
            },
        );
        Ok(())
    }

    /// Stops one server and waits until its tracker has committed.
    ///
    /// Returns false if the server was not running.
    pub async fn stop_server(&mut self, server: &ServerId) -> bool {
        let Some(handle) = self.servers.remove(server) else {
            return false;
        };

        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.tailer.await {
            warn!("Tailer for {} ended abnormally: {}", server, e);
        }
        if let Some(poller) = handle.poller {
            if let Err(e) = poller.await {
                warn!("Poller for {} ended abnormally: {}", server, e);
            }
        }
        if let Err(e) = handle.tracker.await {
            warn!("Tracker for {} ended abnormally: {}", server, e);
        }

        info!("Stopped {}", server);
        true
    }

    /// Brings the registry in line with `targets`: enabled targets run,
    /// everything else stops.
    pub async fn apply_targets(&mut self, targets: &[ServerTarget]) -> Result<(), OrchestratorError> {
        let wanted: BTreeMap<ServerId, &ServerTarget> = targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| (t.id(), t))
            .collect();

        let stale: Vec<ServerId> = self
            .servers
            .iter()
            .filter(|(id, handle)| wanted.get(*id).map_or(true, |t| **t != handle.target))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.stop_server(&id).await;
        }

        for (id, target) in wanted {
            if !self.servers.contains_key(&id) {
                self.start_server(target).await?;
            }
        }
        Ok(())
    }

    /// Stops every server, waits for the aggregator's final commit and hands
    /// it back.
    pub async fn shutdown(mut self) -> Result<StatsAggregator<S>, OrchestratorError> {
        let ids: Vec<ServerId> = self.servers.keys().cloned().collect();
        for id in ids {
            self.stop_server(&id).await;
        }

        drop(self.aggregator_tx);
        Ok(self.aggregator.await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> IngestConfig {
        IngestConfig {
            poll_interval: Duration::from_millis(10),
            flush_interval: Duration::from_millis(20),
            ..IngestConfig::default()
        }
        .with_state_dir(dir.path().join("state"))
    }

    #[tokio::test]
    async fn test_start_and_stop_registry() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        std::fs::write(&log, "").unwrap();

        let mut orchestrator = Orchestrator::new(config(&dir), MemoryStore::new()).unwrap();
        let target = ServerTarget::new("a", log.to_string_lossy(), true);

        orchestrator.start_server(&target).await.unwrap();
        assert!(orchestrator.is_running(&ServerId::new("a")));
        assert!(matches!(
            orchestrator.start_server(&target).await,
            Err(OrchestratorError::AlreadyRunning(_))
        ));

        assert!(orchestrator.stop_server(&ServerId::new("a")).await);
        assert!(!orchestrator.stop_server(&ServerId::new("a")).await);
        assert!(orchestrator.running().is_empty());

        tokio_test::assert_ok!(orchestrator.shutdown().await);
    }

    #[tokio::test]
    async fn test_apply_targets_skips_disabled() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = Orchestrator::new(config(&dir), MemoryStore::new()).unwrap();
        let on = ServerTarget::new("on", dir.path().join("on.log").to_string_lossy(), true);
        let off = ServerTarget::new("off", dir.path().join("off.log").to_string_lossy(), false);

        orchestrator
            .apply_targets(&[on.clone(), off.clone()])
            .await
            .unwrap();
        assert_eq!(orchestrator.running(), vec![&ServerId::new("on")]);

        let mut disabled = on.clone();
        disabled.enabled = false;
        orchestrator.apply_targets(&[disabled, off]).await.unwrap();
        assert!(orchestrator.running().is_empty());

        tokio_test::assert_ok!(orchestrator.shutdown().await);
    }
}
