//! Binary snapshots of tracker state, one file per server.

use log::debug;
use shared::ServerId;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::tracker::TrackerState;
use crate::utils::{atomic_write, file_stem_for};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("checkpoint encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, server: &ServerId) -> PathBuf {
        self.dir
            .join(format!("{}.bin", file_stem_for(server.as_str())))
    }

    pub fn load(&self, server: &ServerId) -> Result<Option<TrackerState>, CheckpointError> {
        let bytes = match std::fs::read(self.path_for(server)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: TrackerState = bincode::deserialize(&bytes)?;
        debug!("Restored tracker state for {} ({} bytes)", server, bytes.len());
        Ok(Some(state))
    }

    pub fn save(&self, state: &TrackerState) -> Result<(), CheckpointError> {
        let bytes = bincode::serialize(state)?;
        atomic_write(&self.path_for(&state.server), &bytes)?;
        Ok(())
    }
}
