//! Persistence port for produced point values
//!
//! The producer only ever calls [`PriceStore::append`]; `latest` and `range`
//! serve historical reads. Appends are not transactional with broadcast, so
//! readers must tolerate a value that was broadcast but never stored.

use crate::journal::{list_segments, JournalConfig, JournalError, JournalWriter};
use crate::reader::{JournalReader, ReaderError};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use types::errors::StoreError;
use types::point::PointValue;

impl From<JournalError> for StoreError {
    fn from(err: JournalError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<ReaderError> for StoreError {
    fn from(err: ReaderError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Append-only store of timestamped point values.
pub trait PriceStore: Send + Sync {
    fn append(&self, point: &PointValue) -> Result<(), StoreError>;

    fn latest(&self) -> Result<Option<PointValue>, StoreError>;

    /// Values with `start <= timestamp <= end`, oldest first, after skipping
    /// `offset` and returning at most `limit`.
    fn range(&self, query: &RangeQuery) -> Result<Vec<PointValue>, StoreError>;
}

/// Historical query window. Missing bounds are open.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl RangeQuery {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start > end => Err(StoreError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            }),
            _ => Ok(()),
        }
    }

    fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| *ts >= s) && self.end.map_or(true, |e| *ts <= e)
    }

    /// Apply the query to an in-memory history.
    pub fn select(&self, points: &[PointValue]) -> Result<Vec<PointValue>, StoreError> {
        self.validate()?;
        let mut hits: Vec<PointValue> = points
            .iter()
            .filter(|p| self.contains(&p.timestamp))
            .copied()
            .collect();
        // Stable: equal timestamps keep append order.
        hits.sort_by_key(|p| p.timestamp);
        Ok(hits.into_iter().skip(self.offset).take(self.limit).collect())
    }
}

impl Default for RangeQuery {
    fn default() -> Self {
        Self::new(None, None)
    }
}

// ── In-memory store ─────────────────────────────────────────────────

/// Volatile store; history is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    points: Mutex<Vec<PointValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PriceStore for MemoryStore {
    fn append(&self, point: &PointValue) -> Result<(), StoreError> {
        self.points
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(*point);
        Ok(())
    }

    fn latest(&self) -> Result<Option<PointValue>, StoreError> {
        Ok(self.points.lock().map_err(|_| StoreError::Poisoned)?.last().copied())
    }

    fn range(&self, query: &RangeQuery) -> Result<Vec<PointValue>, StoreError> {
        query.select(&self.points.lock().map_err(|_| StoreError::Poisoned)?)
    }
}

// ── Journal-backed store ────────────────────────────────────────────

/// Time span covered by one segment on disk.
#[derive(Debug, Clone)]
struct SegmentSummary {
    index: u64,
    path: PathBuf,
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
    points: usize,
}

impl SegmentSummary {
    fn new(index: u64, path: PathBuf, ts: DateTime<Utc>) -> Self {
        Self {
            index,
            path,
            earliest: ts,
            latest: ts,
            points: 0,
        }
    }

    fn include(&mut self, ts: DateTime<Utc>) {
        self.earliest = self.earliest.min(ts);
        self.latest = self.latest.max(ts);
        self.points += 1;
    }

    fn overlaps(&self, query: &RangeQuery) -> bool {
        query.start.map_or(true, |s| self.latest >= s)
            && query.end.map_or(true, |e| self.earliest <= e)
    }
}

struct JournalState {
    writer: JournalWriter,
    /// One summary per non-empty segment, in segment order.
    index: Vec<SegmentSummary>,
    latest: Option<PointValue>,
}

impl JournalState {
    fn record(&mut self, point: &PointValue) {
        let segment = self.writer.segment();
        match self.index.last_mut() {
            Some(summary) if summary.index == segment => summary.include(point.timestamp),
            _ => {
                let path = self.writer.current_file_path().to_path_buf();
                let mut summary = SegmentSummary::new(segment, path, point.timestamp);
                summary.include(point.timestamp);
                self.index.push(summary);
            }
        }
        self.latest = Some(*point);
    }
}

/// Durable store: the journal on disk is the source of truth.
///
/// Memory holds a time span per segment and the newest point; range queries
/// read the overlapping segments back from disk.
pub struct JournalStore {
    state: Mutex<JournalState>,
}

impl JournalStore {
    /// Scan the journal in `config.dir` and open it for appending.
    ///
    /// Segments are read one at a time to build the index. Corrupted entries
    /// are skipped with a warning; if any were found, appends continue in a
    /// fresh file.
    pub fn open(config: JournalConfig) -> Result<Self, StoreError> {
        let mut index = Vec::new();
        let mut latest = None;
        let mut last_sequence = None;
        let mut corrupted = 0;

        for (segment, path) in list_segments(&config.dir).map_err(JournalError::from)? {
            let mut reader = JournalReader::for_segment(&path);
            let (entries, corruptions) = reader.recover_entries();
            for record in &corruptions {
                warn!(
                    segment,
                    byte_offset = record.byte_offset,
                    kind = ?record.kind,
                    detail = %record.detail,
                    "Skipping corrupted journal region"
                );
            }
            corrupted += corruptions.len();

            let mut summary: Option<SegmentSummary> = None;
            for entry in &entries {
                last_sequence = Some(entry.sequence);
                match entry.decode_point() {
                    Ok(point) => {
                        summary
                            .get_or_insert_with(|| {
                                SegmentSummary::new(segment, path.clone(), point.timestamp)
                            })
                            .include(point.timestamp);
                        latest = Some(point);
                    }
                    Err(err) => {
                        warn!(sequence = entry.sequence, error = %err, "Undecodable journal entry")
                    }
                }
            }
            index.extend(summary);
        }

        let mut writer = JournalWriter::open(config)?;
        let next = last_sequence.map_or(1, |seq| seq + 1);
        writer.set_next_sequence(next);
        if corrupted > 0 {
            writer.rotate()?;
        }

        info!(
            points = index.iter().map(|s: &SegmentSummary| s.points).sum::<usize>(),
            segments = index.len(),
            next_sequence = next,
            corrupted_regions = corrupted,
            "Journal store opened"
        );

        Ok(Self {
            state: Mutex::new(JournalState {
                writer,
                index,
                latest,
            }),
        })
    }

    /// Flush and fsync pending writes.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.lock()?.writer.sync()?;
        Ok(())
    }

    /// Segments with at least one readable point.
    pub fn indexed_segments(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.index.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, JournalState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl PriceStore for JournalStore {
    fn append(&self, point: &PointValue) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.writer.append_point(point)?;
        state.record(point);
        Ok(())
    }

    fn latest(&self) -> Result<Option<PointValue>, StoreError> {
        Ok(self.lock()?.latest)
    }

    fn range(&self, query: &RangeQuery) -> Result<Vec<PointValue>, StoreError> {
        query.validate()?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut segments: Vec<SegmentSummary> = self
            .lock()?
            .index
            .iter()
            .filter(|s| s.overlaps(query))
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.earliest);

        // Only the first `wanted` hits by (timestamp, sequence) can be returned.
        let wanted = query.offset.saturating_add(query.limit);
        let mut hits: Vec<(DateTime<Utc>, u64, PointValue)> = Vec::new();
        for segment in &segments {
            if hits.len() >= wanted {
                hits.sort_by_key(|(ts, seq, _)| (*ts, *seq));
                hits.truncate(wanted);
                if hits.last().is_some_and(|(ts, _, _)| segment.earliest > *ts) {
                    break;
                }
            }
            for entry in JournalReader::read_segment(&segment.path)? {
                let Ok(point) = entry.decode_point() else {
                    continue;
                };
                if query.contains(&point.timestamp) {
                    hits.push((point.timestamp, entry.sequence, point));
                }
            }
        }

        hits.sort_by_key(|(ts, seq, _)| (*ts, *seq));
        Ok(hits
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(_, _, point)| point)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 30, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn point(secs: i64) -> PointValue {
        PointValue::new(at(secs), 5.0 + secs as f64)
    }

    #[test]
    fn test_memory_store_latest() {
        let store = MemoryStore::new();
        assert_eq!(store.latest().unwrap(), None);
        store.append(&point(1)).unwrap();
        store.append(&point(2)).unwrap();
        assert_eq!(store.latest().unwrap(), Some(point(2)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let store = MemoryStore::new();
        for secs in 0..10 {
            store.append(&point(secs)).unwrap();
        }
        let hits = store
            .range(&RangeQuery::new(Some(at(2)), Some(at(5))))
            .unwrap();
        assert_eq!(hits, vec![point(2), point(3), point(4), point(5)]);
    }

    #[test]
    fn test_range_pagination() {
        let store = MemoryStore::new();
        for secs in 0..10 {
            store.append(&point(secs)).unwrap();
        }
        let hits = store
            .range(&RangeQuery::default().with_page(3, 4))
            .unwrap();
        assert_eq!(hits, vec![point(4), point(5), point(6)]);
    }

    #[test]
    fn test_range_rejects_inverted_window() {
        let store = MemoryStore::new();
        let result = store.range(&RangeQuery::new(Some(at(5)), Some(at(1))));
        assert!(matches!(result, Err(StoreError::InvalidRange { .. })));
    }

    #[test]
    fn test_journal_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
            for secs in 0..5 {
                store.append(&point(secs)).unwrap();
            }
            store.sync().unwrap();
        }

        let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
        assert_eq!(store.latest().unwrap(), Some(point(4)));
        store.append(&point(5)).unwrap();
        assert_eq!(store.range(&RangeQuery::default()).unwrap().len(), 6);
    }

    #[test]
    fn test_journal_store_recovers_after_corruption() {
        let tmp = TempDir::new().unwrap();
        {
            let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
            for secs in 0..3 {
                store.append(&point(secs)).unwrap();
            }
            store.sync().unwrap();
        }
        let path = crate::journal::segment_path(tmp.path(), 0);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 5]).unwrap();

        {
            let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
            assert_eq!(store.latest().unwrap(), Some(point(1)));
            store.append(&point(10)).unwrap();
            store.sync().unwrap();
        }

        let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
        let all = store.range(&RangeQuery::default()).unwrap();
        assert_eq!(all, vec![point(0), point(1), point(10)]);
    }

    fn small_segments(dir: &std::path::Path) -> JournalConfig {
        JournalConfig {
            segment_size: 400,
            ..JournalConfig::new(dir)
        }
    }

    #[test]
    fn test_journal_store_keeps_one_summary_per_segment() {
        let tmp = TempDir::new().unwrap();
        let store = JournalStore::open(small_segments(tmp.path())).unwrap();
        for secs in 0..300 {
            store.append(&point(secs)).unwrap();
        }

        let on_disk = crate::journal::list_segments(tmp.path()).unwrap().len();
        assert!(on_disk > 10);
        assert!(on_disk < 300);
        assert_eq!(store.indexed_segments().unwrap(), on_disk);
        assert_eq!(store.latest().unwrap(), Some(point(299)));

        drop(store);
        let store = JournalStore::open(small_segments(tmp.path())).unwrap();
        assert_eq!(store.indexed_segments().unwrap(), on_disk);
        assert_eq!(store.latest().unwrap(), Some(point(299)));
    }

    #[test]
    fn test_journal_store_range_reads_across_segments() {
        let tmp = TempDir::new().unwrap();
        let store = JournalStore::open(small_segments(tmp.path())).unwrap();
        let memory = MemoryStore::new();
        for secs in 0..120 {
            store.append(&point(secs)).unwrap();
            memory.append(&point(secs)).unwrap();
        }

        let queries = [
            RangeQuery::default(),
            RangeQuery::new(Some(at(17)), Some(at(63))),
            RangeQuery::new(Some(at(100)), None).with_page(5, 3),
            RangeQuery::new(None, Some(at(40))).with_page(1000, 0),
            RangeQuery::default().with_page(10, 55),
            RangeQuery::default().with_page(0, 0),
        ];
        for query in &queries {
            assert_eq!(store.range(query).unwrap(), memory.range(query).unwrap());
        }
    }

    #[test]
    fn test_journal_store_orders_out_of_order_timestamps() {
        let tmp = TempDir::new().unwrap();
        let store = JournalStore::open(small_segments(tmp.path())).unwrap();
        for secs in [5, 3, 9, 1, 7, 3, 0, 8] {
            store.append(&point(secs)).unwrap();
        }

        let hits = store.range(&RangeQuery::default().with_page(4, 0)).unwrap();
        let ts: Vec<_> = hits.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![at(0), at(1), at(3), at(3)]);
        assert_eq!(store.latest().unwrap(), Some(point(8)));
    }

    proptest! {
        #[test]
        fn prop_range_never_exceeds_limit_and_stays_in_window(
            secs in proptest::collection::vec(0i64..1000, 0..60),
            lo in 0i64..1000,
            width in 0i64..1000,
            limit in 0usize..20,
            offset in 0usize..20,
        ) {
            let store = MemoryStore::new();
            for s in &secs {
                store.append(&point(*s)).unwrap();
            }
            let query = RangeQuery::new(Some(at(lo)), Some(at(lo + width))).with_page(limit, offset);
            let hits = store.range(&query).unwrap();

            prop_assert!(hits.len() <= limit);
            for pair in hits.windows(2) {
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
            for p in &hits {
                prop_assert!(p.timestamp >= at(lo) && p.timestamp <= at(lo + width));
            }
        }
    }
}
