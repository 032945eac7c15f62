//! UDP query client implementing the A2S challenge/response exchange

use crate::error::QueryError;
use crate::packets::{classify, decode_response, Datagram, Request, Response};
use crate::reassembly::FragmentBuffer;
use log::{debug, warn};
use rand::Rng;
use shared::{LiveSnapshot, ServerId, ServerInfo, SnapshotPlayer};
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Upper bound on challenge round-trips within one attempt.
const MAX_CHALLENGE_ROUNDS: u32 = 2;

/// Receive buffer; Source caps datagrams at 1400 bytes but some games exceed it.
const RECV_BUFFER: usize = 4096;

/// Timing and retry policy for one server's queries
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long to wait for each response datagram set
    pub timeout: Duration,
    /// Attempts beyond the first before the server is marked unreachable
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_base * 2^n` plus jitter
    pub backoff_base: Duration,
    /// Incomplete split responses are discarded after this long
    pub fragment_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1500),
            max_retries: 2,
            backoff_base: Duration::from_millis(250),
            fragment_timeout: Duration::from_secs(3),
        }
    }
}

impl QueryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before the retry following attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let base = self
            .backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::from_secs(60));
        let jitter_ceiling = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ceiling > 0 {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

/// Queries one game server over A2S
pub struct QueryClient {
    addr: SocketAddr,
    config: QueryConfig,
}

impl QueryClient {
    pub fn new(addr: SocketAddr, config: QueryConfig) -> Self {
        Self { addr, config }
    }

    /// Resolves `host:port` and builds a client for it
    pub async fn resolve(addr: &str, config: QueryConfig) -> Result<Self, QueryError> {
        let resolved = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| QueryError::Resolve(addr.to_string()))?;
        Ok(Self::new(resolved, config))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Runs one full query cycle. Never fails: exhausted retries yield an
    /// unreachable snapshot.
    pub async fn snapshot(&self, server: &ServerId) -> LiveSnapshot {
        let players = match self
            .with_retries("player list", || self.query_players_once())
            .await
        {
            Ok(players) => players,
            Err((attempts, e)) => {
                warn!(
                    "Server {} at {} unreachable after {} attempts: {}",
                    server, self.addr, attempts, e
                );
                return LiveSnapshot::unreachable(server.clone(), attempts, e.to_string());
            }
        };

        let info = match self.with_retries("server info", || self.query_info_once()).await {
            Ok(info) => Some(info),
            Err((_, e)) => {
                debug!("Server {} returned players but no info: {}", server, e);
                None
            }
        };

        debug!(
            "Snapshot of {}: {} players on {}",
            server,
            players.len(),
            info.as_ref().map(|i| i.map.as_str()).unwrap_or("?")
        );
        LiveSnapshot::reachable(server.clone(), info, players)
    }

    /// Fetches the player list, retrying per the configured policy
    pub async fn query_players(&self) -> Result<Vec<SnapshotPlayer>, QueryError> {
        self.with_retries("player list", || self.query_players_once())
            .await
            .map_err(|(_, e)| e)
    }

    /// Fetches server info, retrying per the configured policy
    pub async fn query_info(&self) -> Result<ServerInfo, QueryError> {
        self.with_retries("server info", || self.query_info_once())
            .await
            .map_err(|(_, e)| e)
    }

    async fn query_players_once(&self) -> Result<Vec<SnapshotPlayer>, QueryError> {
        match self.exchange(Request::players()).await? {
            Response::Players(players) => Ok(players),
            other => Err(QueryError::malformed(format!(
                "expected player list, got {:?}",
                other
            ))),
        }
    }

    async fn query_info_once(&self) -> Result<ServerInfo, QueryError> {
        match self.exchange(Request::info()).await? {
            Response::Info(info) => Ok(info),
            other => Err(QueryError::malformed(format!(
                "expected server info, got {:?}",
                other
            ))),
        }
    }

    /// Runs `op` up to `max_attempts` times with exponential backoff between tries.
    /// On failure returns the number of attempts made and the last error.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, (u32, QueryError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let attempts = self.config.max_attempts();
        let mut last_error = QueryError::Timeout("first attempt");

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(
                        "{} query to {} failed (attempt {}/{}): {}",
                        what,
                        self.addr,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < attempts {
                sleep(self.config.backoff(attempt)).await;
            }
        }

        Err((attempts, last_error))
    }

    /// One attempt: send, answer at most `MAX_CHALLENGE_ROUNDS` challenges, decode.
    async fn exchange(&self, request: Request) -> Result<Response, QueryError> {
        let bind_addr = if self.addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.addr).await?;

        let mut fragments = FragmentBuffer::new(self.config.fragment_timeout);
        let mut request = request;
        let mut challenge_rounds = 0;

        loop {
            socket.send(&request.encode()).await?;

            let response = match timeout(
                self.config.timeout,
                Self::receive(&socket, &mut fragments),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) if request.has_challenge() => {
                    return Err(QueryError::Timeout("challenged response"))
                }
                Err(_) => return Err(QueryError::Timeout("challenge")),
            };

            match response {
                Response::Challenge(challenge) => {
                    challenge_rounds += 1;
                    if challenge_rounds > MAX_CHALLENGE_ROUNDS {
                        return Err(QueryError::malformed(format!(
                            "server kept issuing challenges to {}",
                            request.name()
                        )));
                    }
                    request = request.with_challenge(challenge);
                }
                other => return Ok(other),
            }
        }
    }

    /// Reads datagrams until one complete response is available.
    async fn receive(
        socket: &UdpSocket,
        fragments: &mut FragmentBuffer,
    ) -> Result<Response, QueryError> {
        let mut buffer = [0u8; RECV_BUFFER];

        loop {
            let len = socket.recv(&mut buffer).await?;
            match classify(&buffer[..len])? {
                Datagram::Single(packet) => return decode_response(packet),
                Datagram::Fragment(fragment) => {
                    if let Some(payload) = fragments.push(fragment, Instant::now())? {
                        return decode_response(&payload);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{SIMPLE_HEADER, SPLIT_HEADER};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> QueryConfig {
        QueryConfig {
            timeout: Duration::from_millis(200),
            max_retries: 1,
            backoff_base: Duration::from_millis(5),
            fragment_timeout: Duration::from_secs(1),
        }
    }

    fn player_payload(names: &[&str]) -> Vec<u8> {
        let mut data = SIMPLE_HEADER.to_vec();
        data.push(0x44);
        data.push(names.len() as u8);
        for (i, name) in names.iter().enumerate() {
            data.push(i as u8);
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            data.extend_from_slice(&(i as i32 * 3).to_le_bytes());
            data.extend_from_slice(&60.0f32.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let config = QueryConfig {
            backoff_base: Duration::from_millis(100),
            ..QueryConfig::default()
        };

        let first = config.backoff(0);
        let second = config.backoff(1);
        let third = config.backoff(2);

        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    }

    #[test]
    fn test_max_attempts() {
        let config = QueryConfig {
            max_retries: 3,
            ..QueryConfig::default()
        };
        assert_eq!(config.max_attempts(), 4);
    }

    #[tokio::test]
    async fn test_challenge_then_players() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &[0xFF, 0xFF, 0xFF, 0xFF, 0x55, 0xFF, 0xFF, 0xFF, 0xFF]);
            server
                .send_to(&[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 1, 2, 3, 4], peer)
                .await
                .unwrap();

            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &[0xFF, 0xFF, 0xFF, 0xFF, 0x55, 1, 2, 3, 4]);
            server
                .send_to(&player_payload(&["Alice", "Bob"]), peer)
                .await
                .unwrap();
        });

        let client = QueryClient::new(addr, fast_config());
        let players = tokio_test::assert_ok!(client.query_players().await);
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].name, "Alice");
        assert_eq!(players[1].score, 3);
    }

    #[tokio::test]
    async fn test_split_player_response() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            server
                .send_to(&[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 9, 9, 9, 9], peer)
                .await
                .unwrap();

            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            let payload = player_payload(&["Alice", "Bob", "Carol"]);
            let (first, second) = payload.split_at(payload.len() / 2);
            for (index, part) in [(1u8, second), (0u8, first)] {
                let mut datagram = SPLIT_HEADER.to_vec();
                datagram.extend_from_slice(&77i32.to_le_bytes());
                datagram.push(2);
                datagram.push(index);
                datagram.extend_from_slice(&1248u16.to_le_bytes());
                datagram.extend_from_slice(part);
                server.send_to(&datagram, peer).await.unwrap();
            }
        });

        let client = QueryClient::new(addr, fast_config());
        let players = client.query_players().await.unwrap();
        let names: Vec<&str> = players.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
    }

    #[tokio::test]
    async fn test_silent_server_is_unreachable_after_bounded_attempts() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let received = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while server.recv_from(&mut buf).await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let config = QueryConfig {
            timeout: Duration::from_millis(50),
            max_retries: 2,
            backoff_base: Duration::from_millis(5),
            fragment_timeout: Duration::from_millis(100),
        };
        let client = QueryClient::new(addr, config);
        let snapshot = client.snapshot(&ServerId::new("silent")).await;

        assert!(!snapshot.is_reachable());
        match snapshot.outcome {
            shared::QueryOutcome::Unreachable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected outcome {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }
}
