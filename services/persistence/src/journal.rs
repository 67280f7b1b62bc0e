//! Append-only point journal
//!
//! The journal is a directory of numbered segments (`points-NNNNNN.journal`).
//! Each produced point becomes one frame at the end of the newest segment;
//! frames are never rewritten. A frame that fails to write is cut off again,
//! so a segment only ever ends on a frame boundary.
//!
//! # Frame layout (little endian)
//! ```text
//! [frame_len:   u32]   // bytes after this field
//! [sequence:    u64]
//! [timestamp:   i64]   // unix nanos of the point
//! [payload_len: u32][payload]   // bincode(PointValue)
//! [checksum:    u32]   // CRC32C over sequence, timestamp, payload
//! ```

use crc32c::{crc32c, crc32c_append};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use types::point::PointValue;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Payload encoding error: {0}")]
    Encoding(String),

    #[error("Corrupt frame: {0}")]
    Corrupt(String),

    #[error("Out of sequence: expected {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },
}

impl From<bincode::Error> for JournalError {
    fn from(err: bincode::Error) -> Self {
        JournalError::Encoding(err.to_string())
    }
}

/// Fixed part of a frame body: sequence, timestamp, payload length, checksum.
const FRAME_OVERHEAD: usize = 8 + 8 + 4 + 4;

/// A point payload is a few dozen bytes; anything near this is garbage.
const MAX_FRAME_LEN: usize = 64 * 1024;

// ── Entries ─────────────────────────────────────────────────────────

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Starts at 1 and increases by one per append.
    pub sequence: u64,
    pub timestamp: i64,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl JournalEntry {
    pub fn new(sequence: u64, timestamp: i64, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, timestamp, &payload);
        Self {
            sequence,
            timestamp,
            payload,
            checksum,
        }
    }

    pub fn for_point(sequence: u64, point: &PointValue) -> Result<Self, JournalError> {
        let payload = bincode::serialize(point)?;
        Ok(Self::new(sequence, point.timestamp_nanos(), payload))
    }

    pub fn decode_point(&self) -> Result<PointValue, JournalError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn compute_checksum(sequence: u64, timestamp: i64, payload: &[u8]) -> u32 {
        let crc = crc32c(&sequence.to_le_bytes());
        let crc = crc32c_append(crc, &timestamp.to_le_bytes());
        crc32c_append(crc, payload)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.timestamp, &self.payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let frame_len = FRAME_OVERHEAD + self.payload.len();
        let mut buf = Vec::with_capacity(4 + frame_len);
        buf.extend_from_slice(&(frame_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decode the frame at the start of `data`.
    ///
    /// Returns the entry and the number of bytes it occupied. The checksum is
    /// read but not verified here.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), JournalError> {
        let mut cursor = Cursor::new(data);
        let frame_len = cursor.u32()? as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_LEN).contains(&frame_len) {
            return Err(JournalError::Corrupt(format!(
                "frame length {frame_len} outside {FRAME_OVERHEAD}..={MAX_FRAME_LEN}"
            )));
        }

        let mut frame = Cursor::new(cursor.take(frame_len)?);
        let sequence = frame.u64()?;
        let timestamp = frame.u64()? as i64;
        let payload_len = frame.u32()? as usize;
        if payload_len != frame_len - FRAME_OVERHEAD {
            return Err(JournalError::Corrupt(format!(
                "payload length {payload_len} disagrees with frame length {frame_len}"
            )));
        }
        let payload = frame.take(payload_len)?.to_vec();
        let checksum = frame.u32()?;

        Ok((
            Self {
                sequence,
                timestamp,
                payload,
                checksum,
            },
            4 + frame_len,
        ))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], JournalError> {
        let end = self.pos + n;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            JournalError::Corrupt(format!(
                "need {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len().saturating_sub(self.pos)
            ))
        })?;
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32, JournalError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, JournalError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

// ── Writer ──────────────────────────────────────────────────────────

/// When appended frames are fsynced. Frames always reach the OS right after
/// each append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    EveryWrite,
    EveryN(usize),
    /// Only on `sync()` and rotation.
    Manual,
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    /// Segment size that triggers rotation before the next append.
    pub segment_size: u64,
    pub sync_policy: SyncPolicy,
}

impl JournalConfig {
    /// 16 MiB segments, fsync once a minute at one point per second.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: 16 * 1024 * 1024,
            sync_policy: SyncPolicy::EveryN(60),
        }
    }
}

pub struct JournalWriter {
    config: JournalConfig,
    out: BufWriter<File>,
    segment: u64,
    path: PathBuf,
    segment_len: u64,
    next_sequence: u64,
    unsynced: usize,
}

impl JournalWriter {
    /// Open the newest segment in `config.dir` for appending, creating the
    /// directory if needed. The sequence starts at 1 until told otherwise.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        fs::create_dir_all(&config.dir)?;
        let segment = list_segments(&config.dir)?
            .last()
            .map_or(0, |(index, _)| *index);
        let path = segment_path(&config.dir, segment);
        let file = open_append(&path)?;
        let segment_len = file.metadata()?.len();

        Ok(Self {
            config,
            out: BufWriter::new(file),
            segment,
            path,
            segment_len,
            next_sequence: 1,
            unsynced: 0,
        })
    }

    /// Resume numbering after a replay.
    pub fn set_next_sequence(&mut self, sequence: u64) {
        self.next_sequence = sequence;
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Index of the segment being appended to.
    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn current_file_path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        if entry.sequence != self.next_sequence {
            return Err(JournalError::OutOfSequence {
                expected: self.next_sequence,
                got: entry.sequence,
            });
        }
        if self.segment_len >= self.config.segment_size {
            self.rotate()?;
        }

        let bytes = entry.to_bytes();
        if let Err(err) = self.write_frame(&bytes) {
            self.discard_failed_write()?;
            return Err(err.into());
        }
        self.segment_len += bytes.len() as u64;
        self.next_sequence += 1;
        self.unsynced += 1;

        let due = match self.config.sync_policy {
            SyncPolicy::EveryWrite => true,
            SyncPolicy::EveryN(n) => self.unsynced >= n,
            SyncPolicy::Manual => false,
        };
        if due {
            self.sync()?;
        }
        Ok(())
    }

    /// Append `point` at the next sequence number.
    pub fn append_point(&mut self, point: &PointValue) -> Result<JournalEntry, JournalError> {
        let entry = JournalEntry::for_point(self.next_sequence, point)?;
        self.append(&entry)?;
        Ok(entry)
    }

    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.out.flush()
    }

    /// Throw away whatever part of a frame was buffered or written, leaving
    /// the segment exactly `segment_len` bytes long.
    fn discard_failed_write(&mut self) -> Result<(), JournalError> {
        let file = open_append(&self.path)?;
        file.set_len(self.segment_len)?;
        let stale = std::mem::replace(&mut self.out, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it.
        let _ = stale.into_parts();
        warn!(
            segment = %self.path.display(),
            len = self.segment_len,
            "Discarded partially written journal frame"
        );
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Seal the current segment and continue in a new one.
    pub fn rotate(&mut self) -> Result<(), JournalError> {
        self.sync()?;
        self.segment += 1;
        self.path = segment_path(&self.config.dir, self.segment);
        self.out = BufWriter::new(open_append(&self.path)?);
        self.segment_len = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub(crate) fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("points-{index:06}.journal"))
}

pub(crate) fn segment_index(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("points-")?
        .strip_suffix(".journal")?
        .parse()
        .ok()
}

/// Segments in `dir` ordered by index. A missing directory has none.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(index) = segment_index(&entry.file_name().to_string_lossy()) {
            segments.push((index, entry.path()));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}
