//! Local cache of encoded snapshots awaiting delivery.
//!
//! The cache is a bounded FIFO. When the entry count or byte budget is
//! exceeded, the oldest entries are evicted first. Contents are mirrored to
//! a newline-delimited file so they survive restart; entries are removed
//! from that file only after their delivery has been confirmed.
//!
//! If the backing file cannot be read or written, the cache logs the
//! failure and keeps working from memory alone.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::transport::DeliveryError;

/// Limits applied to the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of entries held
    pub max_entries: usize,

    /// Maximum total payload bytes held. The newest entry is always kept.
    pub max_bytes: usize,
}

impl CacheConfig {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(500, 256 * 1024)
    }
}

/// One cached, encoded snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Insertion order, increasing for the lifetime of the cache
    pub seq: u64,

    /// Encoded snapshot
    pub payload: Vec<u8>,
}

/// Statistics about cache operations.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Entries appended
    pub appended: u64,

    /// Entries evicted to honor the bounds
    pub evicted: u64,

    /// Entries delivered by a drain
    pub delivered: u64,

    /// Entries dropped during a drain because the endpoint rejected them
    pub dropped: u64,
}

/// Errors returned when an entry cannot be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Empty payloads carry no snapshot
    EmptyEntry,

    /// The payload would break the one-record-per-line file layout
    MultiLineEntry,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::EmptyEntry => write!(f, "Cache entry is empty"),
            CacheError::MultiLineEntry => write!(f, "Cache entry contains a line break"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Destination for drained entries.
#[allow(async_fn_in_trait)]
pub trait DeliverySink {
    /// Attempt to deliver one encoded snapshot.
    async fn deliver(&mut self, payload: &[u8]) -> Result<(), DeliveryError>;
}

/// Result of a [`LocalCache::drain`] pass.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Entries confirmed delivered and removed
    pub delivered: usize,

    /// Entries rejected as undeliverable and removed
    pub dropped: usize,

    /// Entries still cached after the pass
    pub remaining: usize,

    /// The transient failure that stopped the pass, if any
    pub stopped_by: Option<DeliveryError>,
}

impl DrainReport {
    /// Whether the pass emptied the cache.
    pub fn is_complete(&self) -> bool {
        self.stopped_by.is_none()
    }
}

/// Bounded, durable FIFO of encoded snapshots.
pub struct LocalCache {
    entries: VecDeque<CacheEntry>,
    total_bytes: usize,
    next_seq: u64,
    config: CacheConfig,
    path: Option<PathBuf>,
    stats: CacheStats,
}

impl LocalCache {
    /// Create a cache that lives in memory only.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            next_seq: 0,
            config,
            path: None,
            stats: CacheStats::default(),
        }
    }

    /// Open a cache backed by the file at `path`, loading any entries left
    /// by a previous run oldest-first.
    ///
    /// Never fails: if the file cannot be used, the cache runs in memory.
    pub fn open(path: impl Into<PathBuf>, config: CacheConfig) -> Self {
        let path = path.into();
        let mut cache = Self::in_memory(config);

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %path.display(), error = %e, "Cannot create cache directory, caching in memory only");
                return cache;
            }
        }

        let mut repair = false;
        match fs::read(&path) {
            Ok(contents) => {
                let mut lines: Vec<&[u8]> = contents.split(|b| *b == b'\n').collect();

                // A record without its newline was cut short by a crash mid-append
                if !contents.is_empty() && !contents.ends_with(b"\n") {
                    if let Some(tail) = lines.pop() {
                        warn!(path = %path.display(), bytes = tail.len(), "Discarding partially written cache record");
                        repair = true;
                    }
                }

                for line in lines {
                    if !line.iter().all(u8::is_ascii_whitespace) {
                        cache.push_back(line.to_vec());
                    }
                }
                info!(path = %path.display(), entries = cache.len(), "Loaded cached snapshots");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache file yet");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read cache file, caching in memory only");
                return cache;
            }
        }

        cache.path = Some(path);

        // The bounds may have shrunk since the file was written
        let evicted = cache.enforce_bounds();
        if evicted > 0 || repair {
            cache.rewrite();
        }

        cache
    }

    /// Append one encoded snapshot, evicting the oldest entries if the
    /// bounds are exceeded. Returns the number of entries evicted.
    pub fn append(&mut self, payload: Vec<u8>) -> Result<usize, CacheError> {
        if payload.is_empty() {
            return Err(CacheError::EmptyEntry);
        }
        if payload.contains(&b'\n') {
            return Err(CacheError::MultiLineEntry);
        }

        let bytes = payload.len();
        self.push_back(payload);
        self.stats.appended += 1;

        let evicted = self.enforce_bounds();
        if evicted > 0 {
            warn!(
                evicted = evicted,
                max_entries = self.config.max_entries,
                max_bytes = self.config.max_bytes,
                "Cache full: dropped oldest snapshots"
            );
            self.rewrite();
        } else if let Some(last) = self.entries.back() {
            let line = last.payload.clone();
            self.append_line(&line);
        }

        debug!(entries = self.entries.len(), bytes = bytes, "Cached snapshot");
        Ok(evicted)
    }

    /// Deliver cached entries oldest-first.
    ///
    /// Each entry is removed only after `sink` confirms it. The pass stops at
    /// the first transient failure, leaving that entry and everything after
    /// it in place and in order. An entry the endpoint rejects as fatal can
    /// never succeed, so it is removed and the pass continues.
    pub async fn drain(&mut self, sink: &mut impl DeliverySink) -> DrainReport {
        let mut report = DrainReport::default();

        while let Some(entry) = self.entries.front() {
            let seq = entry.seq;
            let result = sink.deliver(&entry.payload).await;

            match result {
                Ok(()) => {
                    self.pop_front();
                    self.rewrite();
                    self.stats.delivered += 1;
                    report.delivered += 1;
                }
                Err(DeliveryError::Fatal(reason)) => {
                    warn!(seq = seq, reason = %reason, "Cached snapshot rejected, dropping it");
                    self.pop_front();
                    self.rewrite();
                    self.stats.dropped += 1;
                    report.dropped += 1;
                }
                Err(e) => {
                    debug!(seq = seq, error = %e, "Drain interrupted");
                    report.stopped_by = Some(e);
                    break;
                }
            }
        }

        report.remaining = self.entries.len();
        if report.delivered > 0 || report.dropped > 0 {
            info!(
                delivered = report.delivered,
                dropped = report.dropped,
                remaining = report.remaining,
                "Drained cached snapshots"
            );
        }
        report
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes held.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Cached entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    /// Whether entries are currently mirrored to durable storage.
    pub fn is_durable(&self) -> bool {
        self.path.is_some()
    }

    /// Backing file path, if durable.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn push_back(&mut self, payload: Vec<u8>) {
        self.total_bytes += payload.len();
        self.entries.push_back(CacheEntry {
            seq: self.next_seq,
            payload,
        });
        self.next_seq += 1;
    }

    fn pop_front(&mut self) -> Option<CacheEntry> {
        let entry = self.entries.pop_front()?;
        self.total_bytes -= entry.payload.len();
        Some(entry)
    }

    fn enforce_bounds(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.config.max_entries
            || (self.total_bytes > self.config.max_bytes && self.entries.len() > 1)
        {
            self.pop_front();
            evicted += 1;
        }
        self.stats.evicted += evicted as u64;
        evicted
    }

    fn append_line(&mut self, payload: &[u8]) {
        let Some(path) = &self.path else {
            return;
        };

        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                file.write_all(&line)?;
                file.sync_data()
            });

        if let Err(e) = result {
            self.degrade(e);
        }
    }

    /// Replace the backing file with the current contents atomically.
    fn rewrite(&mut self) {
        let Some(path) = &self.path else {
            return;
        };

        let temp_path = path.with_extension("ndjson.tmp");
        let mut contents = Vec::with_capacity(self.total_bytes + self.entries.len());
        for entry in &self.entries {
            contents.extend_from_slice(&entry.payload);
            contents.push(b'\n');
        }

        let result = fs::File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(&contents)?;
                file.sync_data()
            })
            .and_then(|()| fs::rename(&temp_path, path));

        if let Err(e) = result {
            self.degrade(e);
        }
    }

    fn degrade(&mut self, error: std::io::Error) {
        if let Some(path) = self.path.take() {
            warn!(
                path = %path.display(),
                error = %error,
                entries = self.entries.len(),
                "Cache file unavailable, continuing in memory only"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::scratch_dir;
    use std::collections::VecDeque;

    /// Sink that replays scripted outcomes and records what it was given.
    struct ScriptedSink {
        outcomes: VecDeque<Result<(), DeliveryError>>,
        delivered: Vec<Vec<u8>>,
        attempts: usize,
    }

    impl ScriptedSink {
        fn new(outcomes: Vec<Result<(), DeliveryError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                delivered: Vec::new(),
                attempts: 0,
            }
        }
    }

    impl DeliverySink for ScriptedSink {
        async fn deliver(&mut self, payload: &[u8]) -> Result<(), DeliveryError> {
            self.attempts += 1;
            let outcome = self.outcomes.pop_front().unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.delivered.push(payload.to_vec());
            }
            outcome
        }
    }

    fn payload(i: usize) -> Vec<u8> {
        format!("{{\"n\":{}}}", i).into_bytes()
    }

    fn payloads(cache: &LocalCache) -> Vec<Vec<u8>> {
        cache.entries().map(|e| e.payload.clone()).collect()
    }

    #[test]
    fn test_entry_count_bound_evicts_oldest() {
        let mut cache = LocalCache::in_memory(CacheConfig::new(3, usize::MAX));

        for i in 0..10 {
            cache.append(payload(i)).unwrap();
            assert!(cache.len() <= 3);
        }

        assert_eq!(payloads(&cache), vec![payload(7), payload(8), payload(9)]);
        assert_eq!(cache.stats().appended, 10);
        assert_eq!(cache.stats().evicted, 7);
    }

    #[test]
    fn test_byte_budget_evicts_oldest() {
        let mut cache = LocalCache::in_memory(CacheConfig::new(100, 20));
        cache.append(b"aaaaaaaaaa".to_vec()).unwrap();
        cache.append(b"bbbbbbbbbb".to_vec()).unwrap();
        assert_eq!(cache.len(), 2);

        let evicted = cache.append(b"cccc".to_vec()).unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(payloads(&cache), vec![b"bbbbbbbbbb".to_vec(), b"cccc".to_vec()]);
        assert_eq!(cache.total_bytes(), 14);
    }

    #[test]
    fn test_oversized_entry_kept_alone() {
        let mut cache = LocalCache::in_memory(CacheConfig::new(10, 8));
        cache.append(b"small".to_vec()).unwrap();
        cache.append(b"much-too-large".to_vec()).unwrap();
        assert_eq!(payloads(&cache), vec![b"much-too-large".to_vec()]);
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let mut cache = LocalCache::in_memory(CacheConfig::default());
        assert_eq!(cache.append(Vec::new()), Err(CacheError::EmptyEntry));
        assert_eq!(cache.append(b"a\nb".to_vec()), Err(CacheError::MultiLineEntry));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_drain_delivers_in_order() {
        let mut cache = LocalCache::in_memory(CacheConfig::default());
        for i in 0..4 {
            cache.append(payload(i)).unwrap();
        }

        let mut sink = ScriptedSink::new(Vec::new());
        let report = cache.drain(&mut sink).await;

        assert!(report.is_complete());
        assert_eq!(report.delivered, 4);
        assert_eq!(report.remaining, 0);
        assert_eq!(sink.delivered, (0..4).map(payload).collect::<Vec<_>>());
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_transient_failure() {
        let mut cache = LocalCache::in_memory(CacheConfig::default());
        for i in 0..5 {
            cache.append(payload(i)).unwrap();
        }

        let mut sink = ScriptedSink::new(vec![
            Ok(()),
            Ok(()),
            Err(DeliveryError::Transient("broker down".to_string())),
        ]);
        let report = cache.drain(&mut sink).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.remaining, 3);
        assert!(matches!(report.stopped_by, Some(DeliveryError::Transient(_))));
        // Entry 3 was never attempted after entry 2 failed
        assert_eq!(sink.attempts, 3);
        assert_eq!(payloads(&cache), vec![payload(2), payload(3), payload(4)]);
    }

    #[tokio::test]
    async fn test_drain_drops_fatally_rejected_entry() {
        let mut cache = LocalCache::in_memory(CacheConfig::default());
        for i in 0..3 {
            cache.append(payload(i)).unwrap();
        }

        let mut sink = ScriptedSink::new(vec![
            Ok(()),
            Err(DeliveryError::Fatal("malformed".to_string())),
            Ok(()),
        ]);
        let report = cache.drain(&mut sink).await;

        assert!(report.is_complete());
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(sink.delivered, vec![payload(0), payload(2)]);
        assert_eq!(cache.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_contents_survive_restart() {
        let dir = scratch_dir("cache");
        let path = dir.join("cache.ndjson");

        {
            let mut cache = LocalCache::open(&path, CacheConfig::default());
            assert!(cache.is_durable());
            for i in 0..3 {
                cache.append(payload(i)).unwrap();
            }
        }

        let mut cache = LocalCache::open(&path, CacheConfig::default());
        assert_eq!(payloads(&cache), vec![payload(0), payload(1), payload(2)]);

        let mut sink = ScriptedSink::new(vec![
            Ok(()),
            Err(DeliveryError::Transient("offline".to_string())),
        ]);
        cache.drain(&mut sink).await;
        assert!(!path.with_extension("ndjson.tmp").exists());

        // Only confirmed deliveries are gone from the file
        let reopened = LocalCache::open(&path, CacheConfig::default());
        assert_eq!(payloads(&reopened), vec![payload(1), payload(2)]);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_reopen_applies_smaller_bound() {
        let dir = scratch_dir("cache-bound");
        let path = dir.join("cache.ndjson");

        let mut cache = LocalCache::open(&path, CacheConfig::new(10, usize::MAX));
        for i in 0..6 {
            cache.append(payload(i)).unwrap();
        }
        drop(cache);

        let cache = LocalCache::open(&path, CacheConfig::new(2, usize::MAX));
        assert_eq!(payloads(&cache), vec![payload(4), payload(5)]);
        let reopened = LocalCache::open(&path, CacheConfig::new(10, usize::MAX));
        assert_eq!(reopened.len(), 2);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_torn_tail_record_discarded_on_open() {
        let dir = scratch_dir("cache-torn");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.ndjson");
        // Power lost halfway through writing the second record
        fs::write(&path, b"{\"n\":0}\n{\"n\":1").unwrap();

        let mut cache = LocalCache::open(&path, CacheConfig::default());
        assert_eq!(payloads(&cache), vec![payload(0)]);
        assert_eq!(fs::read(&path).unwrap(), b"{\"n\":0}\n".to_vec());

        cache.append(payload(2)).unwrap();
        drop(cache);

        let reopened = LocalCache::open(&path, CacheConfig::default());
        assert_eq!(payloads(&reopened), vec![payload(0), payload(2)]);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unusable_path_falls_back_to_memory() {
        let dir = scratch_dir("cache-blocked");
        fs::create_dir_all(&dir).unwrap();
        // A regular file where the cache directory should be
        let blocker = dir.join("blocker");
        fs::write(&blocker, b"x").unwrap();

        let mut cache = LocalCache::open(blocker.join("cache.ndjson"), CacheConfig::default());
        assert!(!cache.is_durable());
        cache.append(payload(1)).unwrap();
        assert_eq!(cache.len(), 1);

        fs::remove_dir_all(dir).ok();
    }
}
