//! # Log Ingestion Engine
//!
//! This library turns the plaintext logs of running game servers into durable
//! per-match and all-time player statistics. It reads each log incrementally,
//! maps lines to typed events, follows every server's match and round
//! lifecycle, and applies the resulting deltas to a store exactly once.
//!
//! ## Core Responsibilities
//!
//! ### Incremental Reading
//! Logs are polled for new bytes and split into complete lines. Rotation,
//! truncation and in-place rewrites are detected through the file's identity
//! and a checksum of the last consumed line, so a restart resumes exactly
//! where the previous run stopped.
//!
//! ### Match Tracking
//! Each server has its own state machine over map, round and game-over lines.
//! Combat is attributed to the open match and tagged as live or warmup. Live
//! snapshots from the query client fill in the roster for players the log has
//! not mentioned yet.
//!
//! ### Exactly-Once Statistics
//! Every delta carries a key derived from the position of the line it came
//! from. The aggregator and the store both refuse keys they have already
//! applied, and a cursor only moves forward once the statistics before it
//! are durable.
//!
//! ## Architecture Design
//!
//! ### One Queue Per Server
//! A tailer task and an optional poller task share one bounded queue into the
//! server's tracker task, which keeps log lines and snapshots in arrival
//! order. Trackers share one bounded queue into the aggregator task. There
//! is no shared mutable state between tasks.
//!
//! ### Checkpoint Handshake
//! The tailer asks the tracker to checkpoint. The tracker has the aggregator
//! commit, persists its own state, and only then acknowledges, after which
//! the tailer persists its cursor.
//!
//! ## Module Organization
//!
//! ### Tailer and Cursor (`tailer`, `cursor`)
//! - Growing-file reader with rotation and truncation handling
//! - Durable JSON cursor per server
//!
//! ### Parser Module (`parser`)
//! Ordered regex matchers for the HL/Source log grammar.
//!
//! ### Tracker Modules (`tracker`, `session_manager`, `identity`, `checkpoint`)
//! - Match and round state machine
//! - Player sessions and snapshot absence counting
//! - Name to identity reconciliation
//! - Bincode checkpoints of tracker state
//!
//! ### Aggregation Modules (`aggregator`, `store`)
//! - Recent-key window in front of an idempotent store
//! - In-memory and JSON file stores
//!
//! ### Orchestrator Module (`orchestrator`)
//! Starts and stops the tasks of each configured server.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ingest::config::IngestConfig;
//! use ingest::orchestrator::Orchestrator;
//! use ingest::store::JsonFileStore;
//! use shared::ServerTarget;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IngestConfig::default().with_state_dir("/var/lib/fragstat");
//!     let store = JsonFileStore::open(config.stats_path())?;
//!     let mut orchestrator = Orchestrator::new(config, store)?;
//!
//!     let target = ServerTarget::new("ins-1", "/srv/ins/logs/L0101.log", true)
//!         .with_query_addr("127.0.0.1:27015");
//!     orchestrator.apply_targets(&[target]).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod identity;
pub mod messages;
pub mod orchestrator;
pub mod parser;
pub mod session_manager;
pub mod store;
pub mod tailer;
pub mod tracker;
pub mod utils;
