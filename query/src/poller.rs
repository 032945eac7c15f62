//! Periodic snapshot scheduling for one server.
//!
//! A poller fires on a fixed interval regardless of log volume. A tick that
//! arrives while the previous cycle is still in flight is skipped rather than
//! queued, so slow or dead servers never pile up overlapping queries.

use log::{debug, info, warn};
use shared::{LiveSnapshot, ServerId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::network::QueryClient;

/// Marks a cycle as in flight until dropped, including on abort.
pub struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct Poller {
    server: ServerId,
    client: Arc<QueryClient>,
    interval: Duration,
    busy: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
}

impl Poller {
    pub fn new(server: ServerId, client: QueryClient, interval: Duration) -> Self {
        Self {
            server,
            client: Arc::new(client),
            interval,
            busy: Arc::new(AtomicBool::new(false)),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Number of ticks skipped because a cycle was still running.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Claims the in-flight slot, or returns `None` if a cycle is running.
    pub fn try_begin(&self) -> Option<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    ///
    /// Snapshots are converted into the receiver's message type so they can
    /// share one ordered queue with log events.
    pub async fn run<T>(self, tx: mpsc::Sender<T>, mut shutdown: watch::Receiver<bool>)
    where
        T: From<LiveSnapshot> + Send + 'static,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        info!(
            "Polling {} at {} every {:?}",
            self.server,
            self.client.addr(),
            self.interval
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let Some(guard) = self.try_begin() else {
                        let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("Query cycle for {} still running; skipped {} ticks", self.server, skipped);
                        continue;
                    };

                    let client = Arc::clone(&self.client);
                    let server = self.server.clone();
                    let tx = tx.clone();
                    in_flight = Some(tokio::spawn(async move {
                        let snapshot = client.snapshot(&server).await;
                        drop(guard);
                        if tx.send(T::from(snapshot)).await.is_err() {
                            warn!("Snapshot queue for {} closed", server);
                        }
                    }));
                }
            }
        }

        if let Some(handle) = in_flight.take() {
            handle.abort();
        }
        debug!("Poller for {} stopped", self.server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::QueryConfig;
    use std::net::SocketAddr;

    fn poller() -> Poller {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        Poller::new(
            ServerId::new("test"),
            QueryClient::new(addr, QueryConfig::default()),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_try_begin_is_exclusive() {
        let poller = poller();

        let guard = poller.try_begin();
        assert!(guard.is_some());
        assert!(poller.is_busy());
        assert!(poller.try_begin().is_none());

        drop(guard);
        assert!(!poller.is_busy());
        assert!(poller.try_begin().is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let poller = poller();
        let (tx, _rx) = mpsc::channel::<LiveSnapshot>(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(poller.run(tx, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "poller did not stop");
    }
}
