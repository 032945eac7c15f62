//! Buffering of split responses until every fragment has arrived.

use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::QueryError;
use crate::packets::Fragment;

/// Fragments received so far for one request id.
#[derive(Debug)]
struct PendingSet {
    total: u8,
    parts: Vec<Option<Vec<u8>>>,
    received: u8,
    first_seen: Instant,
}

impl PendingSet {
    fn new(total: u8, now: Instant) -> Self {
        Self {
            total,
            parts: vec![None; total as usize],
            received: 0,
            first_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.first_seen) > timeout
    }

    fn assemble(self) -> Vec<u8> {
        let size = self.parts.iter().flatten().map(|p| p.len()).sum();
        let mut out = Vec::with_capacity(size);
        for part in self.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        out
    }
}

/// Reassembles split responses keyed by request id.
///
/// Sets that stay incomplete longer than the timeout are dropped the next
/// time a fragment arrives or `evict_expired` runs.
pub struct FragmentBuffer {
    pending: HashMap<i32, PendingSet>,
    timeout: Duration,
}

impl FragmentBuffer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Adds one fragment. Returns the reassembled payload once the set is complete.
    pub fn push(&mut self, fragment: Fragment, now: Instant) -> Result<Option<Vec<u8>>, QueryError> {
        self.evict_expired(now);

        let set = self
            .pending
            .entry(fragment.request_id)
            .or_insert_with(|| PendingSet::new(fragment.total, now));

        if set.total != fragment.total {
            let expected = set.total;
            self.pending.remove(&fragment.request_id);
            return Err(QueryError::malformed(format!(
                "request {} changed fragment total from {} to {}",
                fragment.request_id, expected, fragment.total
            )));
        }

        let slot = set
            .parts
            .get_mut(fragment.index as usize)
            .ok_or_else(|| {
                QueryError::malformed(format!(
                    "fragment index {} beyond total {}",
                    fragment.index, fragment.total
                ))
            })?;

        // Duplicated datagrams keep the first copy.
        if slot.is_none() {
            *slot = Some(fragment.payload);
            set.received += 1;
        }

        if !set.is_complete() {
            return Ok(None);
        }

        match self.pending.remove(&fragment.request_id) {
            Some(set) => Ok(Some(set.assemble())),
            None => Ok(None),
        }
    }

    /// Drops incomplete sets older than the timeout, returning how many were dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending.retain(|request_id, set| {
            let keep = !set.is_expired(now, timeout);
            if !keep {
                debug!(
                    "Discarding incomplete split response {} ({}/{} fragments)",
                    request_id, set.received, set.total
                );
            }
            keep
        });
        before - self.pending.len()
    }

    /// Number of request ids still waiting for fragments.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
