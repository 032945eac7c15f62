//! # Live Server Query Library
//!
//! This library implements the client side of the Source-engine A2S query
//! protocol. It asks a running game server who is connected right now and
//! which map it is playing, independently of whatever the server writes to
//! its log files.
//!
//! ## Protocol Overview
//!
//! Queries are single UDP datagrams. Replies are either one datagram with the
//! simple header (`FF FF FF FF`) or a set of fragments with the split header
//! (`FE FF FF FF`) that must be reassembled by request id before decoding.
//! Servers may answer a request with a challenge number instead of data; the
//! client then repeats the request with the challenge attached.
//!
//! ## Module Organization
//!
//! ### Packets Module (`packets`)
//! Request encoding and response decoding:
//! - Header classification (simple vs split)
//! - Challenge, info and player-list payloads
//! - A bounds-checked little-endian reader
//!
//! ### Reassembly Module (`reassembly`)
//! Buffers split fragments per request id, tolerates reordering and
//! duplicates, and discards sets that never complete.
//!
//! ### Network Module (`network`)
//! One query cycle against one server with per-attempt timeouts and
//! exponential backoff with jitter between retries. A cycle always yields a
//! snapshot; failures become an unreachable outcome.
//!
//! ### Poller Module (`poller`)
//! Schedules cycles on a fixed interval, skipping ticks while a previous
//! cycle is still in flight.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use query::network::{QueryClient, QueryConfig};
//! use shared::ServerId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = QueryClient::resolve("127.0.0.1:27015", QueryConfig::default()).await?;
//!     let snapshot = client.snapshot(&ServerId::new("pub-1")).await;
//!     println!("{} players online", snapshot.players().len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod network;
pub mod packets;
pub mod poller;
pub mod reassembly;

pub use error::QueryError;
pub use network::{QueryClient, QueryConfig};
pub use poller::Poller;
