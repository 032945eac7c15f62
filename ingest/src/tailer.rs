//! Incremental reading of one growing log file.
//!
//! The synchronous [`LogTailer`] does the file work and is driven from a
//! blocking task by [`run_tailer`], which forwards lines to the server's
//! tracker and checkpoints the cursor once the tracker confirms that every
//! forwarded line is durable.

use log::{debug, error, info, warn};
use shared::{FileIdentity, LinePosition, ServerId};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task;
use tokio::time::{sleep, Instant};

use crate::cursor::{file_identity, trim_terminator, verify_last_line, CursorStore, LogCursor};
use crate::messages::TrackerMessage;
use crate::utils::next_backoff;

/// Polls a rotated file may keep an unfinished last line before it is
/// emitted as is.
const ROTATION_GRACE_POLLS: u32 = 3;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("log file {0} does not exist")]
    Missing(PathBuf),

    #[error("permission denied reading {0}")]
    Permission(PathBuf),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TailError {
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => TailError::Missing(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => TailError::Permission(path.to_path_buf()),
            _ => TailError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// One complete line with its position in the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub server: ServerId,
    pub position: LinePosition,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    /// No file at the watched path yet.
    Waiting,
    Reading,
}

pub struct LogTailer {
    server: ServerId,
    path: PathBuf,
    file: Option<File>,
    cursor: LogCursor,
    /// Bytes read past the cursor that do not yet end in a line break.
    partial: Vec<u8>,
    max_read: usize,
    rotations: u64,
    /// Polls spent waiting for a rotated file to finish its last line
    rotation_wait: u32,
}

impl LogTailer {
    /// Opens `path`, resuming from `saved` when it still describes this file.
    ///
    /// A missing file is not an error here; the tailer waits for it.
    pub fn open(
        server: ServerId,
        path: impl Into<PathBuf>,
        saved: Option<LogCursor>,
        max_read: usize,
    ) -> Result<Self, TailError> {
        let path = path.into();
        let cursor = saved.unwrap_or_else(|| LogCursor::new(server.clone(), FileIdentity::default()));

        let mut tailer = Self {
            server,
            path,
            file: None,
            cursor,
            partial: Vec::new(),
            max_read: max_read.max(1),
            rotations: 0,
            rotation_wait: 0,
        };

        match File::open(&tailer.path) {
            Ok(file) => tailer.attach(file)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    "Log {} for {} not present yet; waiting",
                    tailer.path.display(),
                    tailer.server
                );
            }
            Err(e) => return Err(TailError::from_io(&tailer.path, e)),
        }

        Ok(tailer)
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> &LogCursor {
        &self.cursor
    }

    pub fn state(&self) -> TailState {
        if self.file.is_some() {
            TailState::Reading
        } else {
            TailState::Waiting
        }
    }

    /// Rotations and truncations observed since open.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Returns the complete lines appended since the last call.
    pub fn poll(&mut self) -> Result<Vec<RawLine>, TailError> {
        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|e| TailError::from_io(&self.path, e))?;
            self.attach(file)?;
        }

        let (lines, read) = self.read_available()?;
        if read > 0 {
            self.rotation_wait = 0;
            return Ok(lines);
        }

        // The old handle is drained; see whether the path now names another file.
        let current = File::open(&self.path).and_then(|file| file_identity(&file));
        match current {
            Ok(identity) if identity == self.cursor.file_identity => Ok(lines),
            Ok(_) if !self.partial.is_empty() && self.rotation_wait < ROTATION_GRACE_POLLS => {
                self.rotation_wait += 1;
                debug!(
                    "Log {} rotated mid-line; waiting for the old file to finish it ({}/{})",
                    self.path.display(),
                    self.rotation_wait,
                    ROTATION_GRACE_POLLS
                );
                Ok(lines)
            }
            Ok(_) => {
                info!(
                    "Log {} for {} was rotated; following the new file",
                    self.path.display(),
                    self.server
                );
                let mut lines: Vec<RawLine> = self.finish_partial().into_iter().collect();
                self.detach();
                self.rotations += 1;
                self.rotation_wait = 0;
                let file = File::open(&self.path).map_err(|e| TailError::from_io(&self.path, e))?;
                self.attach(file)?;
                lines.extend(self.read_available()?.0);
                Ok(lines)
            }
            Err(e) => {
                self.detach();
                Err(TailError::from_io(&self.path, e))
            }
        }
    }

    fn attach(&mut self, mut file: File) -> Result<(), TailError> {
        let identity = file_identity(&file).map_err(|e| TailError::from_io(&self.path, e))?;
        let len = file
            .metadata()
            .map_err(|e| TailError::from_io(&self.path, e))?
            .len();

        let resume = if self.cursor.is_at_start() || self.cursor.file_identity != identity {
            false
        } else if len < self.cursor.byte_offset {
            warn!(
                "Log {} shrank below the saved offset {}; reading from the start",
                self.path.display(),
                self.cursor.byte_offset
            );
            false
        } else if !verify_last_line(&mut file, &self.cursor)
            .map_err(|e| TailError::from_io(&self.path, e))?
        {
            warn!(
                "Log {} was rewritten in place; reading from the start",
                self.path.display()
            );
            false
        } else {
            true
        };

        if resume {
            debug!(
                "Resuming {} at offset {}",
                self.path.display(),
                self.cursor.byte_offset
            );
        } else {
            self.cursor.reset(identity);
        }

        self.partial.clear();
        self.file = Some(file);
        Ok(())
    }

    fn detach(&mut self) {
        self.file = None;
        self.partial.clear();
    }

    /// Reads what was appended since the last call, returning the complete
    /// lines and the number of bytes read.
    fn read_available(&mut self) -> Result<(Vec<RawLine>, u64), TailError> {
        let Some(file) = self.file.as_mut() else {
            return Ok((Vec::new(), 0));
        };

        let len = file
            .metadata()
            .map_err(|e| TailError::from_io(&self.path, e))?
            .len();
        let mut read_offset = self.cursor.byte_offset + self.partial.len() as u64;

        // A copy-truncate can be followed by enough new writes to pass the old
        // offset before the next poll, so growth alone proves nothing.
        let restarted = if len < read_offset {
            true
        } else if len > read_offset {
            !verify_last_line(file, &self.cursor).map_err(|e| TailError::from_io(&self.path, e))?
        } else {
            false
        };

        if restarted {
            warn!(
                "Log {} truncated or rewritten below offset {} (now {} bytes); reading from the start",
                self.path.display(),
                read_offset,
                len
            );
            let identity = self.cursor.file_identity;
            self.cursor.reset(identity);
            self.partial.clear();
            self.rotations += 1;
            read_offset = 0;
        }

        if len == read_offset {
            return Ok((Vec::new(), 0));
        }

        let mut chunk = Vec::new();
        file.seek(SeekFrom::Start(read_offset))
            .and_then(|_| file.by_ref().take(self.max_read as u64).read_to_end(&mut chunk))
            .map_err(|e| TailError::from_io(&self.path, e))?;

        self.partial.extend_from_slice(&chunk);
        Ok((self.split_lines(), chunk.len() as u64))
    }

    /// Emits the unterminated tail of a file that will never be written again.
    fn finish_partial(&mut self) -> Option<RawLine> {
        if self.partial.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.partial);
        let body = trim_terminator(&raw);
        let start = self.cursor.byte_offset;
        let position = LinePosition {
            file: self.cursor.file_identity,
            epoch: self.cursor.epoch,
            start,
            end: start + raw.len() as u64,
        };
        self.cursor.advance(position.end, body);

        Some(RawLine {
            server: self.server.clone(),
            position,
            text: String::from_utf8_lossy(body).into_owned(),
        })
    }

    fn split_lines(&mut self) -> Vec<RawLine> {
        let mut lines = Vec::new();
        let mut consumed = 0;

        while let Some(pos) = self.partial[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos + 1;
            let raw = &self.partial[consumed..end];
            let body = trim_terminator(raw);

            let start = self.cursor.byte_offset;
            let position = LinePosition {
                file: self.cursor.file_identity,
                epoch: self.cursor.epoch,
                start,
                end: start + raw.len() as u64,
            };

            if !body.is_empty() {
                lines.push(RawLine {
                    server: self.server.clone(),
                    position,
                    text: String::from_utf8_lossy(body).into_owned(),
                });
            }
            self.cursor.advance(position.end, body);
            consumed = end;
        }

        self.partial.drain(..consumed);
        lines
    }
}

/// Timing for one tailer task.
#[derive(Debug, Clone)]
pub struct TailerSettings {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub flush_interval: Duration,
}

/// Drives `tailer` until shutdown, forwarding lines into the tracker queue.
pub async fn run_tailer(
    mut tailer: LogTailer,
    cursors: CursorStore,
    tx: mpsc::Sender<TrackerMessage>,
    settings: TailerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let server = tailer.server().clone();
    let mut delay = settings.poll_interval;
    let mut last_checkpoint = Instant::now();
    let mut unflushed = false;
    let mut reported_missing = false;

    info!("Tailing {} for {}", tailer.path().display(), server);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = sleep(delay) => {}
        }

        let (returned, result) = match task::spawn_blocking(move || {
            let result = tailer.poll();
            (tailer, result)
        })
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                error!("Tailer for {} aborted: {}", server, e);
                return;
            }
        };
        tailer = returned;

        match result {
            Ok(lines) => {
                delay = settings.poll_interval;
                reported_missing = false;
                if !lines.is_empty() {
                    unflushed = true;
                }
                for line in lines {
                    if tx.send(TrackerMessage::Line(line)).await.is_err() {
                        warn!("Tracker for {} is gone; stopping tailer", server);
                        return;
                    }
                }
            }
            Err(TailError::Missing(path)) => {
                if !reported_missing {
                    warn!("Waiting for {} to appear ({})", path.display(), server);
                    reported_missing = true;
                }
                delay = next_backoff(delay, settings.max_backoff);
            }
            Err(e) => {
                error!("Tailer for {}: {}", server, e);
                delay = next_backoff(delay, settings.max_backoff);
            }
        }

        if unflushed && last_checkpoint.elapsed() >= settings.flush_interval {
            if checkpoint(tailer.cursor().clone(), &cursors, &tx).await {
                unflushed = false;
            }
            last_checkpoint = Instant::now();
        }
    }

    if unflushed {
        checkpoint(tailer.cursor().clone(), &cursors, &tx).await;
    }
    info!(
        "Tailer for {} stopped at offset {}",
        server,
        tailer.cursor().byte_offset
    );
}

/// Waits until everything before `cursor` is durable, then persists it.
async fn checkpoint(
    cursor: LogCursor,
    cursors: &CursorStore,
    tx: &mpsc::Sender<TrackerMessage>,
) -> bool {
    let server = cursor.server_id.clone();
    let offset = cursor.byte_offset;

    let (ack_tx, ack_rx) = oneshot::channel();
    if tx
        .send(TrackerMessage::Checkpoint { ack: ack_tx })
        .await
        .is_err()
    {
        warn!("Tracker for {} closed before checkpoint", server);
        return false;
    }

    match ack_rx.await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                "Statistics for {} not durable; cursor held at its previous checkpoint",
                server
            );
            return false;
        }
        Err(_) => {
            warn!("Tracker for {} dropped the checkpoint", server);
            return false;
        }
    }

    let store = cursors.clone();
    match task::spawn_blocking(move || store.save(&cursor)).await {
        Ok(Ok(())) => {
            debug!("Checkpointed {} at offset {}", server, offset);
            true
        }
        Ok(Err(e)) => {
            error!("Failed to persist cursor for {}: {}", server, e);
            false
        }
        Err(e) => {
            error!("Cursor write for {} aborted: {}", server, e);
            false
        }
    }
}
