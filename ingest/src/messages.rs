use shared::{LiveSnapshot, MatchId, MatchRecord, ServerId, StatDelta};
use tokio::sync::oneshot;

use crate::tailer::RawLine;

/// Messages queued to one server's tracker, in the order they must be applied
#[derive(Debug)]
pub enum TrackerMessage {
    Line(RawLine),
    Snapshot(LiveSnapshot),
    /// Persist tracker state and commit everything before this point. The
    /// ack carries whether both succeeded.
    Checkpoint {
        ack: oneshot::Sender<bool>,
    },
}

impl From<LiveSnapshot> for TrackerMessage {
    fn from(snapshot: LiveSnapshot) -> Self {
        TrackerMessage::Snapshot(snapshot)
    }
}

impl From<RawLine> for TrackerMessage {
    fn from(line: RawLine) -> Self {
        TrackerMessage::Line(line)
    }
}

/// Messages sent from trackers to the aggregator
#[derive(Debug)]
pub enum AggregatorMessage {
    Batch(Vec<StatDelta>),
    OpenMatch(MatchRecord),
    CloseMatch {
        id: MatchId,
        ended_at: chrono::NaiveDateTime,
        rounds: u32,
    },
    /// Make everything durable. The ack is false if the store failed or any
    /// earlier write for `server` was lost.
    Commit {
        server: ServerId,
        ack: oneshot::Sender<bool>,
    },
}
