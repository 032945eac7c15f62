//! Durable read positions for tailed log files.
//!
//! A cursor records which physical file was being read, how far, and a
//! checksum of the last consumed line. The checksum lets a restarted tailer
//! tell a file that merely grew apart from one rewritten in place.

use serde::{Deserialize, Serialize};
use shared::{FileIdentity, ServerId};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::utils::{atomic_write, file_stem_for};

/// How far back `verify_last_line` looks for the previous line break.
const VERIFY_WINDOW: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt cursor file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCursor {
    pub server_id: ServerId,
    pub file_identity: FileIdentity,
    /// Number of times reading restarted at offset 0.
    #[serde(default)]
    pub epoch: u32,
    /// Offset just past the last consumed line terminator.
    pub byte_offset: u64,
    /// xxh3 of the last consumed line without its terminator; 0 at offset 0.
    pub last_line_checksum: u64,
}

impl LogCursor {
    pub fn new(server_id: ServerId, file_identity: FileIdentity) -> Self {
        Self {
            server_id,
            file_identity,
            epoch: 0,
            byte_offset: 0,
            last_line_checksum: 0,
        }
    }

    pub fn is_at_start(&self) -> bool {
        self.byte_offset == 0
    }

    /// Moves past one consumed line. Offsets never move backwards within a file.
    pub fn advance(&mut self, end: u64, line: &[u8]) {
        if end > self.byte_offset {
            self.byte_offset = end;
            self.last_line_checksum = line_checksum(line);
        }
    }

    /// Starts over at the beginning of `file`, opening a new epoch if any
    /// position was already handed out.
    pub fn reset(&mut self, file: FileIdentity) {
        let moved = self.file_identity != FileIdentity::default() && self.file_identity != file;
        if self.byte_offset > 0 || moved {
            self.epoch = self.epoch.wrapping_add(1);
        }
        self.file_identity = file;
        self.byte_offset = 0;
        self.last_line_checksum = 0;
    }
}

pub fn line_checksum(line: &[u8]) -> u64 {
    xxh3_64(line)
}

/// Strips the `\n` and optional `\r` ending one raw line.
pub fn trim_terminator(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Checks that the line ending at `cursor.byte_offset` still hashes to the
/// recorded checksum.
///
/// Lines longer than the verification window cannot be checked and are
/// accepted.
pub fn verify_last_line(file: &mut File, cursor: &LogCursor) -> io::Result<bool> {
    if cursor.is_at_start() {
        return Ok(true);
    }

    let window = cursor.byte_offset.min(VERIFY_WINDOW);
    let start = cursor.byte_offset - window;
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity(window as usize);
    file.by_ref().take(window).read_to_end(&mut buf)?;
    if buf.len() as u64 != window || buf.last() != Some(&b'\n') {
        return Ok(false);
    }

    let body = &buf[..buf.len() - 1];
    let line_start = match body.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None if start == 0 => 0,
        None => return Ok(true),
    };

    Ok(line_checksum(trim_terminator(&buf[line_start..])) == cursor.last_line_checksum)
}

/// Identity of an open file, independent of the path used to open it.
#[cfg(unix)]
pub fn file_identity(file: &File) -> io::Result<FileIdentity> {
    use std::os::unix::fs::MetadataExt;

    let meta = file.metadata()?;
    Ok(FileIdentity::new(meta.dev(), meta.ino()))
}

/// Identity of an open file from its creation time and first line.
#[cfg(not(unix))]
pub fn file_identity(file: &File) -> io::Result<FileIdentity> {
    use std::time::UNIX_EPOCH;

    let meta = file.metadata()?;
    let created = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut handle = file.try_clone()?;
    handle.seek(SeekFrom::Start(0))?;
    let mut head = Vec::new();
    handle.by_ref().take(VERIFY_WINDOW).read_to_end(&mut head)?;
    let first_line = match head.iter().position(|b| *b == b'\n') {
        Some(pos) => &head[..pos],
        None => &head[..],
    };

    Ok(FileIdentity::new(created, xxh3_64(first_line)))
}

/// Cursor files, one JSON document per server.
#[derive(Debug, Clone)]
pub struct CursorStore {
    dir: PathBuf,
}

impl CursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, server: &ServerId) -> PathBuf {
        self.dir
            .join(format!("{}.json", file_stem_for(server.as_str())))
    }

    pub fn load(&self, server: &ServerId) -> Result<Option<LogCursor>, CursorError> {
        let path = self.path_for(server);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    pub fn save(&self, cursor: &LogCursor) -> Result<(), CursorError> {
        let json = serde_json::to_vec_pretty(cursor)?;
        atomic_write(&self.path_for(&cursor.server_id), &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn cursor_after(content: &[u8], last_line: &[u8]) -> LogCursor {
        let mut cursor = LogCursor::new(ServerId::new("s"), FileIdentity::default());
        cursor.advance(content.len() as u64, last_line);
        cursor
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut cursor = LogCursor::new(ServerId::new("s"), FileIdentity::default());
        cursor.advance(10, b"first");
        cursor.advance(5, b"stale");

        assert_eq!(cursor.byte_offset, 10);
        assert_eq!(cursor.last_line_checksum, line_checksum(b"first"));
    }

    #[test]
    fn test_reset_opens_new_epoch_only_after_progress() {
        let file = FileIdentity::new(1, 2);
        let mut cursor = LogCursor::new(ServerId::new("s"), FileIdentity::default());

        cursor.reset(file);
        assert_eq!(cursor.epoch, 0);

        cursor.advance(10, b"line");
        cursor.reset(file);
        assert_eq!(cursor.epoch, 1);
        assert_eq!(cursor.byte_offset, 0);
        assert_eq!(cursor.last_line_checksum, 0);

        cursor.reset(FileIdentity::new(1, 3));
        assert_eq!(cursor.epoch, 2);
    }

    #[test]
    fn test_trim_terminator() {
        assert_eq!(trim_terminator(b"abc\r\n"), b"abc");
        assert_eq!(trim_terminator(b"abc\n"), b"abc");
        assert_eq!(trim_terminator(b"abc"), b"abc");
    }

    #[test]
    fn test_verify_last_line_matches_unchanged_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        let content = b"one\r\ntwo\nthree\n";
        std::fs::write(&path, content).unwrap();

        let mut file = File::open(&path).unwrap();
        let cursor = cursor_after(content, b"three");
        assert!(verify_last_line(&mut file, &cursor).unwrap());

        let first_only = cursor_after(b"one\r\n", b"one");
        assert!(verify_last_line(&mut file, &first_only).unwrap());
    }

    #[test]
    fn test_verify_last_line_detects_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"one\ntwo\n").unwrap();
        let cursor = cursor_after(b"one\ntwo\n", b"two");

        let mut file = File::create(&path).unwrap();
        file.write_all(b"xyz\nabc\nmore\n").unwrap();

        let mut file = File::open(&path).unwrap();
        assert!(!verify_last_line(&mut file, &cursor).unwrap());
    }

    #[test]
    fn test_cursor_store_round_trip_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = CursorStore::new(dir.path().join("cursors"));
        let server = ServerId::new("ins-1");

        assert_eq!(store.load(&server).unwrap(), None);

        let mut cursor = LogCursor::new(server.clone(), FileIdentity::new(1, 2));
        cursor.advance(42, b"line");
        store.save(&cursor).unwrap();

        assert_eq!(store.load(&server).unwrap(), Some(cursor));
        let json = std::fs::read_to_string(store.path_for(&server)).unwrap();
        assert!(json.contains("\"byteOffset\": 42"));
        assert!(json.contains("\"lastLineChecksum\""));
    }

    #[test]
    fn test_file_identity_differs_between_files() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&a, b"a\n").unwrap();
        std::fs::write(&b, b"b\n").unwrap();

        let id_a = file_identity(&File::open(&a).unwrap()).unwrap();
        let id_b = file_identity(&File::open(&b).unwrap()).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(id_a, file_identity(&File::open(&a).unwrap()).unwrap());
    }
}
