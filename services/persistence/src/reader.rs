//! Journal replay
//!
//! Walks every segment in index order and yields checksummed entries.
//! A frame with a bad checksum is reported and can be skipped; an
//! unparseable frame makes the rest of its segment unreadable, and reading
//! resumes with the next segment. Either way the damage is recorded with
//! its byte offset.

use crate::journal::{list_segments, JournalEntry, JournalError};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Checksum mismatch at byte offset {offset}: entry seq={sequence}")]
    ChecksumMismatch { offset: u64, sequence: u64 },

    #[error("Sequence not monotonic: prev={prev}, current={current}")]
    NotMonotonic { prev: u64, current: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    TruncatedEntry,
}

/// Where and how the journal was found damaged.
#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    /// Offset counted across all segments, in read order.
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

pub struct JournalReader {
    pending: VecDeque<PathBuf>,
    segment: Vec<u8>,
    pos: usize,
    /// Bytes of all segments fully consumed before the current one.
    consumed: u64,
    last_sequence: Option<u64>,
    corruptions: Vec<CorruptionRecord>,
}

impl JournalReader {
    /// A missing directory reads as an empty journal.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        let pending = list_segments(dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        Ok(Self {
            pending,
            segment: Vec::new(),
            pos: 0,
            consumed: 0,
            last_sequence: None,
            corruptions: Vec::new(),
        })
    }

    /// Reader over a single segment file.
    pub fn for_segment(path: impl Into<PathBuf>) -> Self {
        Self {
            pending: VecDeque::from([path.into()]),
            segment: Vec::new(),
            pos: 0,
            consumed: 0,
            last_sequence: None,
            corruptions: Vec::new(),
        }
    }

    /// Next entry with a valid checksum, `None` at the end of the journal.
    ///
    /// A checksum mismatch is returned as an error after the bad frame has
    /// been consumed, so calling again continues with the following frame.
    pub fn next_entry(&mut self) -> Result<Option<JournalEntry>, ReaderError> {
        loop {
            if self.pos >= self.segment.len() && !self.load_next_segment()? {
                return Ok(None);
            }

            let offset = self.current_offset();
            let (entry, used) = match JournalEntry::from_bytes(&self.segment[self.pos..]) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.record(offset, CorruptionKind::TruncatedEntry, format!(
                        "{} unreadable bytes: {err}",
                        self.segment.len() - self.pos
                    ));
                    self.pos = self.segment.len();
                    continue;
                }
            };
            self.pos += used;

            if !entry.verify_checksum() {
                self.record(offset, CorruptionKind::ChecksumMismatch, format!(
                    "seq={} stored crc {:#010x}",
                    entry.sequence, entry.checksum
                ));
                return Err(ReaderError::ChecksumMismatch {
                    offset,
                    sequence: entry.sequence,
                });
            }

            self.last_sequence = Some(entry.sequence);
            return Ok(Some(entry));
        }
    }

    /// Every entry, failing on the first checksum mismatch.
    pub fn read_all(&mut self) -> Result<Vec<JournalEntry>, ReaderError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Every readable entry, skipping damaged frames, plus what was skipped.
    pub fn recover_entries(&mut self) -> (Vec<JournalEntry>, Vec<CorruptionRecord>) {
        let mut entries = Vec::new();
        loop {
            match self.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(ReaderError::ChecksumMismatch { .. }) => {}
                Err(_) => break,
            }
        }
        (entries, self.corruptions.clone())
    }

    /// Every readable entry of one segment. Damaged frames are skipped
    /// quietly; failing to read the file is an error.
    pub fn read_segment(path: &Path) -> Result<Vec<JournalEntry>, ReaderError> {
        let mut reader = Self::for_segment(path);
        let mut entries = Vec::new();
        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => return Ok(entries),
                Err(ReaderError::ChecksumMismatch { .. }) => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub fn current_offset(&self) -> u64 {
        self.consumed + self.pos as u64
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruptions
    }

    /// Sequences must strictly increase. Gaps are fine; recovery drops frames.
    pub fn validate_monotonic(entries: &[JournalEntry]) -> Result<(), ReaderError> {
        match entries
            .windows(2)
            .find(|pair| pair[1].sequence <= pair[0].sequence)
        {
            Some(pair) => Err(ReaderError::NotMonotonic {
                prev: pair[0].sequence,
                current: pair[1].sequence,
            }),
            None => Ok(()),
        }
    }

    fn load_next_segment(&mut self) -> Result<bool, ReaderError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(false);
        };
        self.consumed += self.segment.len() as u64;
        self.segment = fs::read(path)?;
        self.pos = 0;
        Ok(true)
    }

    fn record(&mut self, byte_offset: u64, kind: CorruptionKind, detail: String) {
        self.corruptions.push(CorruptionRecord {
            byte_offset,
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{segment_path, JournalConfig, JournalWriter};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use types::point::PointValue;

    fn point(seq: u64) -> PointValue {
        PointValue::new(
            Utc.timestamp_opt(1_727_688_600 + seq as i64, 0).unwrap(),
            5.0 + seq as f64 / 100.0,
        )
    }

    fn write_points(config: JournalConfig, count: u64) {
        let mut writer = JournalWriter::open(config).unwrap();
        for seq in 1..=count {
            writer.append_point(&point(seq)).unwrap();
        }
        writer.sync().unwrap();
    }

    /// Flip a payload byte of the first frame; its length prefix stays intact.
    fn corrupt_first_payload(dir: &Path) {
        let path = segment_path(dir, 0);
        let mut data = fs::read(&path).unwrap();
        data[26] ^= 0xFF;
        fs::write(&path, &data).unwrap();
    }

    #[test]
    fn test_reads_points_back_in_order() {
        let tmp = TempDir::new().unwrap();
        write_points(JournalConfig::new(tmp.path()), 50);

        let mut reader = JournalReader::open(tmp.path()).unwrap();
        let entries = reader.read_all().unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[49].decode_point().unwrap(), point(50));
        assert_eq!(reader.last_sequence(), Some(50));
        assert!(JournalReader::validate_monotonic(&entries).is_ok());
    }

    #[test]
    fn test_reads_across_segments() {
        let tmp = TempDir::new().unwrap();
        let config = JournalConfig {
            segment_size: 150,
            ..JournalConfig::new(tmp.path())
        };
        write_points(config, 12);

        assert!(list_segments(tmp.path()).unwrap().len() > 1);
        let mut reader = JournalReader::open(tmp.path()).unwrap();
        let sequences: Vec<u64> = reader.read_all().unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_checksum_mismatch_is_reported_with_offset() {
        let tmp = TempDir::new().unwrap();
        write_points(JournalConfig::new(tmp.path()), 5);
        corrupt_first_payload(tmp.path());

        let mut reader = JournalReader::open(tmp.path()).unwrap();
        match reader.read_all() {
            Err(ReaderError::ChecksumMismatch { offset, sequence }) => {
                assert_eq!(offset, 0);
                assert_eq!(sequence, 1);
            }
            other => panic!("Expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_skips_bad_frame() {
        let tmp = TempDir::new().unwrap();
        write_points(JournalConfig::new(tmp.path()), 10);
        corrupt_first_payload(tmp.path());

        let mut reader = JournalReader::open(tmp.path()).unwrap();
        let (entries, corruptions) = reader.recover_entries();
        assert_eq!(entries.len(), 9);
        assert_eq!(entries[0].sequence, 2);
        assert_eq!(corruptions.len(), 1);
        assert_eq!(corruptions[0].kind, CorruptionKind::ChecksumMismatch);
    }

    #[test]
    fn test_truncated_tail_keeps_valid_prefix() {
        let tmp = TempDir::new().unwrap();
        write_points(JournalConfig::new(tmp.path()), 4);

        let path = segment_path(tmp.path(), 0);
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 3]).unwrap();

        let mut reader = JournalReader::open(tmp.path()).unwrap();
        let (entries, corruptions) = reader.recover_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(corruptions[0].kind, CorruptionKind::TruncatedEntry);
        assert_eq!(reader.corruption_log().len(), 1);
    }

    #[test]
    fn test_offset_advances_per_frame() {
        let tmp = TempDir::new().unwrap();
        write_points(JournalConfig::new(tmp.path()), 2);

        let mut reader = JournalReader::open(tmp.path()).unwrap();
        assert_eq!(reader.current_offset(), 0);
        let first = reader.next_entry().unwrap().unwrap();
        assert_eq!(reader.current_offset(), first.to_bytes().len() as u64);
    }

    #[test]
    fn test_read_segment_covers_one_file() {
        let tmp = TempDir::new().unwrap();
        let config = JournalConfig {
            segment_size: 150,
            ..JournalConfig::new(tmp.path())
        };
        write_points(config, 12);

        let segments = list_segments(tmp.path()).unwrap();
        let mut sequences = Vec::new();
        for (_, path) in &segments {
            let entries = JournalReader::read_segment(path).unwrap();
            assert!(!entries.is_empty());
            assert!(entries.len() < 12);
            sequences.extend(entries.iter().map(|e| e.sequence));
        }
        assert_eq!(sequences, (1..=12).collect::<Vec<_>>());

        assert!(JournalReader::read_segment(&segment_path(tmp.path(), 99)).is_err());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let tmp = TempDir::new().unwrap();
        let mut reader = JournalReader::open(&tmp.path().join("nothing")).unwrap();
        assert!(reader.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_non_monotonic_sequences_rejected() {
        let a = JournalEntry::new(2, 0, vec![]);
        let b = JournalEntry::new(2, 0, vec![]);
        assert!(matches!(
            JournalReader::validate_monotonic(&[a, b]),
            Err(ReaderError::NotMonotonic { prev: 2, current: 2 })
        ));
    }
}
