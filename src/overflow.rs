//! Purpose: Persist oversized tool output as immutable on-disk chunks and serve them by cursor.
//! Exports: `OverflowStore`, `OverflowSettings`, `OverflowRecord`, `OverflowChunk`, `ChunkCursor`,
//!          `ByteRange`, `CleanupReport`, `split_chunks`, `generate_file_id`, `validate_file_id`.
//! Role: Backing store for the pipeline's size budget and the `retrieve_overflow` tool.
//! Invariants: Records are staged in a temporary sibling and renamed into place; readers never
//! observe a partial record.
//! Invariants: Chunks never split a UTF-8 character; concatenating them in index order yields
//! the original text exactly.
//! Invariants: File ids never contain path separators or `..`.
//! Invariants: Writers hold a shared lock on the store, cleanup holds it exclusively.
//! Notes: All operations are blocking; async callers go through `spawn_blocking`.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use getrandom::fill as fill_random;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};

const RECORD_FILE: &str = "record.json";
const LOCK_FILE: &str = ".lock";
const STAGING_PREFIX: &str = ".tmp-";

#[derive(Clone, Debug)]
pub struct OverflowSettings {
    /// Output larger than this many bytes is moved to the store.
    pub threshold_bytes: usize,
    pub chunk_bytes: usize,
    pub retention: Duration,
    pub dir_name: String,
}

impl Default for OverflowSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: 100_000,
            chunk_bytes: 50_000,
            retention: Duration::from_secs(24 * 60 * 60),
            dir_name: ".sgmcp-overflow".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverflowRecord {
    pub file_id: String,
    pub total_chunks: usize,
    pub total_bytes: u64,
    pub chunks: Vec<ByteRange>,
    pub created_at_ms: u64,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCursor {
    pub file_id: String,
    pub chunk_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverflowChunk {
    pub file_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub total_bytes: u64,
    pub content: String,
}

impl OverflowChunk {
    pub fn has_more(&self) -> bool {
        self.chunk_index + 1 < self.total_chunks
    }

    pub fn next_cursor(&self) -> Option<ChunkCursor> {
        self.has_more().then(|| ChunkCursor {
            file_id: self.file_id.clone(),
            chunk_index: self.chunk_index + 1,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub kept: usize,
}

#[derive(Clone, Debug)]
pub struct OverflowStore {
    root: PathBuf,
    settings: OverflowSettings,
}

impl OverflowStore {
    pub fn new(working_dir: &Path, settings: OverflowSettings) -> Self {
        Self {
            root: working_dir.join(&settings.dir_name),
            settings,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &OverflowSettings {
        &self.settings
    }

    pub fn exceeds_threshold(&self, text: &str) -> bool {
        text.len() > self.settings.threshold_bytes
    }

    /// Split `content` into chunks on disk and return the first one.
    pub fn write(&self, content: &str, tool: Option<&str>) -> Result<OverflowChunk, Error> {
        fs::create_dir_all(&self.root).map_err(|err| {
            Error::from_io(err, "failed to create overflow directory").with_path(&self.root)
        })?;
        let _lock = StoreLock::shared(&self.root)?;

        let (created_at_ms, created_at) = now_stamp();
        let file_id = generate_file_id(created_at_ms)?;
        let pieces = split_chunks(content, self.settings.chunk_bytes);
        let mut chunks = Vec::with_capacity(pieces.len());
        let mut offset = 0u64;
        for piece in &pieces {
            let end = offset + piece.len() as u64;
            chunks.push(ByteRange { start: offset, end });
            offset = end;
        }
        let record = OverflowRecord {
            file_id: file_id.clone(),
            total_chunks: pieces.len(),
            total_bytes: content.len() as u64,
            chunks,
            created_at_ms,
            created_at,
            tool: tool.map(ToString::to_string),
        };

        let staging = self.root.join(format!("{STAGING_PREFIX}{file_id}"));
        let target = self.root.join(&file_id);
        let result = write_record_dir(&staging, &record, &pieces).and_then(|()| {
            fs::rename(&staging, &target).map_err(|err| {
                Error::from_io(err, "failed to publish overflow record").with_path(&target)
            })
        });
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        debug!(
            file_id = %file_id,
            chunks = record.total_chunks,
            bytes = record.total_bytes,
            "overflow record written"
        );

        Ok(OverflowChunk {
            file_id,
            chunk_index: 0,
            total_chunks: record.total_chunks,
            total_bytes: record.total_bytes,
            content: pieces.first().map(|s| (*s).to_string()).unwrap_or_default(),
        })
    }

    pub fn read_record(&self, file_id: &str) -> Result<OverflowRecord, Error> {
        validate_file_id(file_id)?;
        let path = self.root.join(file_id).join(RECORD_FILE);
        let bytes = fs::read(&path).map_err(|err| {
            Error::from_io(err, format!("unknown overflow file id `{file_id}`"))
                .with_path(&path)
                .with_hint("Call retrieve_overflow with listFiles=true to see available ids.")
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("overflow record is unreadable")
                .with_path(&path)
                .with_source(err)
        })
    }

    pub fn read_chunk(&self, file_id: &str, chunk_index: usize) -> Result<OverflowChunk, Error> {
        let record = self.read_record(file_id)?;
        if chunk_index >= record.total_chunks {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "chunk index {chunk_index} out of range; `{file_id}` has {} chunks",
                    record.total_chunks
                ))
                .with_hint("Chunk indexes start at 0."));
        }
        let path = self.root.join(file_id).join(chunk_file_name(chunk_index));
        let content = fs::read_to_string(&path)
            .map_err(|err| Error::from_io(err, "failed to read overflow chunk").with_path(&path))?;
        Ok(OverflowChunk {
            file_id: record.file_id,
            chunk_index,
            total_chunks: record.total_chunks,
            total_bytes: record.total_bytes,
            content,
        })
    }

    /// All published records, oldest first. A missing store lists as empty.
    pub fn list(&self) -> Result<Vec<OverflowRecord>, Error> {
        let mut records = Vec::new();
        for file_id in self.record_ids()? {
            match self.read_record(&file_id) {
                Ok(record) => records.push(record),
                Err(err) => warn!(file_id = %file_id, error = %err, "skipping overflow record"),
            }
        }
        records.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        Ok(records)
    }

    /// Remove records (and abandoned staging dirs) older than `older_than`.
    pub fn cleanup(&self, older_than: Duration) -> Result<CleanupReport, Error> {
        if !self.root.is_dir() {
            return Ok(CleanupReport::default());
        }
        let _lock = StoreLock::exclusive(&self.root)?;
        let cutoff_ms = unix_millis(SystemTime::now()).saturating_sub(duration_millis(older_than));
        let mut report = CleanupReport::default();

        let entries = fs::read_dir(&self.root).map_err(|err| {
            Error::from_io(err, "failed to read overflow directory").with_path(&self.root)
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::from_io(err, "failed to read overflow directory").with_path(&self.root)
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let created_ms = if name.starts_with(STAGING_PREFIX) {
                modified_millis(&path)
            } else if validate_file_id(&name).is_ok() {
                match self.read_record(&name) {
                    Ok(record) => Some(record.created_at_ms),
                    Err(_) => modified_millis(&path),
                }
            } else {
                continue;
            };
            if created_ms.is_some_and(|ms| ms <= cutoff_ms) {
                fs::remove_dir_all(&path).map_err(|err| {
                    Error::from_io(err, "failed to remove overflow record").with_path(&path)
                })?;
                if !name.starts_with(STAGING_PREFIX) {
                    report.removed.push(name);
                }
            } else if !name.starts_with(STAGING_PREFIX) {
                report.kept += 1;
            }
        }
        report.removed.sort();
        Ok(report)
    }

    fn record_ids(&self) -> Result<Vec<String>, Error> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(
                    Error::from_io(err, "failed to read overflow directory").with_path(&self.root)
                );
            }
        };
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_file_id(&name).is_ok() && entry.path().is_dir() {
                ids.push(name);
            }
        }
        Ok(ids)
    }
}

fn write_record_dir(dir: &Path, record: &OverflowRecord, pieces: &[&str]) -> Result<(), Error> {
    fs::create_dir(dir)
        .map_err(|err| Error::from_io(err, "failed to stage overflow record").with_path(dir))?;
    for (index, piece) in pieces.iter().enumerate() {
        let path = dir.join(chunk_file_name(index));
        fs::write(&path, piece.as_bytes())
            .map_err(|err| Error::from_io(err, "failed to write overflow chunk").with_path(&path))?;
    }
    let path = dir.join(RECORD_FILE);
    let bytes = serde_json::to_vec_pretty(record).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode overflow record")
            .with_source(err)
    })?;
    fs::write(&path, bytes)
        .map_err(|err| Error::from_io(err, "failed to write overflow record").with_path(&path))
}

fn chunk_file_name(index: usize) -> String {
    format!("chunk-{index}.txt")
}

/// Split at or below `chunk_bytes`, backing off to the previous char boundary.
/// A single character wider than `chunk_bytes` still forms its own chunk.
pub fn split_chunks(content: &str, chunk_bytes: usize) -> Vec<&str> {
    let chunk_bytes = chunk_bytes.max(1);
    if content.is_empty() {
        return vec![""];
    }
    let mut pieces = Vec::with_capacity(content.len() / chunk_bytes + 1);
    let mut rest = content;
    while !rest.is_empty() {
        let mut end = chunk_bytes.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest
                .char_indices()
                .nth(1)
                .map(|(idx, _)| idx)
                .unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(end);
        pieces.push(head);
        rest = tail;
    }
    pieces
}

pub fn generate_file_id(created_at_ms: u64) -> Result<String, Error> {
    let mut bytes = [0u8; 8];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate overflow file id: {err}"))
    })?;
    let mut id = format!("{created_at_ms}-");
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(id, "{byte:02x}");
    }
    Ok(id)
}

pub fn validate_file_id(file_id: &str) -> Result<(), Error> {
    let valid = !file_id.is_empty()
        && file_id.len() <= 128
        && !file_id.contains("..")
        && file_id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_');
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid overflow file id `{file_id}`"))
            .with_hint("Use a fileId returned by a previous overflowed result."))
    }
}

fn now_stamp() -> (u64, String) {
    use time::format_description::well_known::Rfc3339;
    let now = SystemTime::now();
    let formatted = time::OffsetDateTime::from(now)
        .format(&Rfc3339)
        .unwrap_or_default();
    (unix_millis(now), formatted)
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or(0)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn modified_millis(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(unix_millis)
}

struct StoreLock {
    file: File,
}

impl StoreLock {
    fn shared(root: &Path) -> Result<Self, Error> {
        let file = open_lock_file(root)?;
        FileExt::lock_shared(&file).map_err(|err| lock_error(err, root))?;
        Ok(Self { file })
    }

    fn exclusive(root: &Path) -> Result<Self, Error> {
        let file = open_lock_file(root)?;
        FileExt::lock_exclusive(&file).map_err(|err| lock_error(err, root))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(root: &Path) -> Result<File, Error> {
    let path = root.join(LOCK_FILE);
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|err| Error::from_io(err, "failed to open overflow lock").with_path(path))
}

fn lock_error(err: io::Error, root: &Path) -> Error {
    Error::from_io(err, "failed to lock overflow directory").with_path(root)
}
