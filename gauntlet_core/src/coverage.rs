use crate::unix_millis;
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
};
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default bitmap size, same as AFL.
pub const DEFAULT_MAP_SIZE: usize = 65536;
/// Default number of snapshots retained by a [`CoverageTracker`].
pub const DEFAULT_HISTORY_CAP: usize = 1000;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Coverage bitmap I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Coverage bitmap encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Coverage bitmap decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Coverage bitmap size mismatch: expected {expected}, found {found}")]
    SizeMismatch { expected: usize, found: usize },
}

/// Computes the AFL edge identifier for a transition between two blocks.
#[inline]
pub fn edge_id(from: u32, to: u32) -> u32 {
    (from >> 1) ^ to
}

/// Classifies a hit count into one of the nine AFL buckets
/// `{0, 1, 2, 3, 4-7, 8-15, 16-31, 32-127, 128+}`, returned as `0..=8`.
#[inline]
pub fn bucket_of(hits: u8) -> u8 {
    match hits {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4..=7 => 4,
        8..=15 => 5,
        16..=31 => 6,
        32..=127 => 7,
        128..=255 => 8,
    }
}

/// Point-in-time coverage numbers for a map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub edges_covered: usize,
    pub total_edges: usize,
    pub hit_count: u64,
    pub new_edges: u64,
    pub coverage_percent: f64,
}

/// Fixed-size bitmap of saturating edge hit counters.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CoverageMap {
    bitmap: Vec<u8>,
    hit_count: u64,
    new_edges: u64,
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_SIZE)
    }
}

impl CoverageMap {
    /// Creates an empty map. A size of zero falls back to [`DEFAULT_MAP_SIZE`].
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_MAP_SIZE } else { size };
        Self {
            bitmap: vec![0u8; size],
            hit_count: 0,
            new_edges: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.bitmap.len()
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Records one traversal of the edge `from -> to`.
    ///
    /// Returns `true` when the edge was never seen before or when its hit count
    /// moved into a new bucket.
    pub fn record_edge(&mut self, from: u32, to: u32) -> bool {
        let index = edge_id(from, to) as usize % self.bitmap.len();
        let previous = self.bitmap[index];
        let current = previous.saturating_add(1);
        self.bitmap[index] = current;
        self.hit_count += 1;

        let is_new = previous == 0 || bucket_of(previous) != bucket_of(current);
        if previous == 0 {
            self.new_edges += 1;
        }
        is_new
    }

    /// Folds `other` into this map by keeping the larger counter per slot.
    ///
    /// Returns how many slots went from zero to nonzero. Maps of a different size
    /// are ignored.
    pub fn merge(&mut self, other: &CoverageMap) -> usize {
        if other.bitmap.len() != self.bitmap.len() {
            return 0;
        }
        let mut new_edges = 0;
        for (mine, &theirs) in self.bitmap.iter_mut().zip(other.bitmap.iter()) {
            if theirs == 0 {
                continue;
            }
            if *mine == 0 {
                new_edges += 1;
            }
            *mine = (*mine).max(theirs);
        }
        self.hit_count = self.hit_count.saturating_add(other.hit_count);
        self.new_edges += new_edges as u64;
        new_edges
    }

    /// MD5 fingerprint of the bitmap, as lowercase hex.
    pub fn hash(&self) -> String {
        format!("{:x}", md5::compute(&self.bitmap))
    }

    pub fn edges_covered(&self) -> usize {
        self.bitmap.iter().filter(|&&hits| hits > 0).count()
    }

    pub fn stats(&self) -> CoverageStats {
        let edges_covered = self.edges_covered();
        let total_edges = self.bitmap.len();
        CoverageStats {
            edges_covered,
            total_edges,
            hit_count: self.hit_count,
            new_edges: self.new_edges,
            coverage_percent: edges_covered as f64 * 100.0 / total_edges as f64,
        }
    }

    pub fn reset(&mut self) {
        self.bitmap.fill(0);
        self.hit_count = 0;
        self.new_edges = 0;
    }
}

/// Immutable record of the global coverage after one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    pub timestamp_ms: u64,
    pub stats: CoverageStats,
    pub input_hash: String,
    pub interesting: bool,
}

/// Merges per-execution maps into a global map and keeps a bounded history.
#[derive(Debug)]
pub struct CoverageTracker {
    global: RwLock<CoverageMap>,
    history: RwLock<VecDeque<CoverageSnapshot>>,
    history_cap: usize,
}

impl CoverageTracker {
    pub fn new(map_size: usize) -> Self {
        Self::with_history_cap(map_size, DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(map_size: usize, history_cap: usize) -> Self {
        Self {
            global: RwLock::new(CoverageMap::new(map_size)),
            history: RwLock::new(VecDeque::new()),
            history_cap: history_cap.max(1),
        }
    }

    fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Merges one execution's map. Returns `true` when it contributed new edges.
    pub fn record_execution(&self, exec_map: &CoverageMap, input_hash: &str) -> bool {
        let (new_edges, stats) = {
            let mut global = self.global.write();
            let new_edges = global.merge(exec_map);
            (new_edges, global.stats())
        };
        let interesting = new_edges > 0;

        let mut history = self.history.write();
        if history.len() >= self.history_cap {
            history.pop_front();
        }
        history.push_back(CoverageSnapshot {
            timestamp_ms: unix_millis(),
            stats,
            input_hash: input_hash.to_string(),
            interesting,
        });
        interesting
    }

    pub fn stats(&self) -> CoverageStats {
        self.global.read().stats()
    }

    pub fn global_map(&self) -> CoverageMap {
        self.global.read().clone()
    }

    pub fn history(&self) -> Vec<CoverageSnapshot> {
        self.history.read().iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    pub fn reset(&self) {
        self.global.write().reset();
        self.history.write().clear();
    }

    /// Writes the global bitmap to `path`.
    pub fn save_bitmap(&self, path: &Path) -> Result<(), CoverageError> {
        let bytes = bincode::encode_to_vec(&*self.global.read(), Self::bincode_config())?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Replaces the global bitmap with one saved by [`CoverageTracker::save_bitmap`].
    ///
    /// The saved map must have the same size as the current one.
    pub fn load_bitmap(&self, path: &Path) -> Result<CoverageStats, CoverageError> {
        let bytes = fs::read(path)?;
        let (loaded, _len): (CoverageMap, usize) =
            bincode::decode_from_slice(&bytes, Self::bincode_config())?;
        let mut global = self.global.write();
        if loaded.size() != global.size() {
            return Err(CoverageError::SizeMismatch {
                expected: global.size(),
                found: loaded.size(),
            });
        }
        *global = loaded;
        let stats = global.stats();
        info!(
            "Restored coverage bitmap from {:?}: {} edges",
            path, stats.edges_covered
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn edge_id_uses_afl_formula() {
        assert_eq!(edge_id(0b1010, 0b0001), 0b0101 ^ 0b0001);
        assert_eq!(edge_id(0, 7), 7);
    }

    #[test]
    fn bucket_boundaries() {
        let expected = [
            (0u8, 0u8),
            (1, 1),
            (2, 2),
            (3, 3),
            (4, 4),
            (7, 4),
            (8, 5),
            (15, 5),
            (16, 6),
            (31, 6),
            (32, 7),
            (127, 7),
            (128, 8),
            (255, 8),
        ];
        for (hits, bucket) in expected {
            assert_eq!(bucket_of(hits), bucket, "hits = {hits}");
        }
    }

    #[test]
    fn record_edge_reports_new_only_on_first_hit_and_bucket_changes() {
        let mut map = CoverageMap::new(1024);
        let mut new_flags = Vec::new();
        for _ in 0..10 {
            new_flags.push(map.record_edge(3, 9));
        }
        // Hits 1, 2, 3, 4 and 8 each land in a fresh bucket.
        assert_eq!(
            new_flags,
            vec![true, true, true, true, false, false, false, true, false, false]
        );
        assert_eq!(map.stats().edges_covered, 1);
        assert_eq!(map.stats().hit_count, 10);
    }

    #[test]
    fn counters_saturate_at_255() {
        let mut map = CoverageMap::new(16);
        for _ in 0..300 {
            map.record_edge(1, 2);
        }
        let index = edge_id(1, 2) as usize % 16;
        assert_eq!(map.bitmap()[index], 255);
        assert!(!map.record_edge(1, 2));
    }

    #[test]
    fn edges_covered_matches_nonzero_bytes() {
        let mut map = CoverageMap::new(64);
        map.record_edge(0, 1);
        map.record_edge(0, 2);
        map.record_edge(0, 2);
        map.record_edge(0, 65);
        let nonzero = map.bitmap().iter().filter(|b| **b != 0).count();
        assert_eq!(map.stats().edges_covered, nonzero);
        assert_eq!(nonzero, 2);
        assert_eq!(map.stats().total_edges, 64);
    }

    #[test]
    fn merge_counts_new_edges_and_ignores_size_mismatch() {
        let mut global = CoverageMap::new(128);
        let mut exec = CoverageMap::new(128);
        exec.record_edge(0, 5);
        exec.record_edge(0, 6);
        assert_eq!(global.merge(&exec), 2);
        assert_eq!(global.merge(&exec), 0);

        let mut other = CoverageMap::new(64);
        other.record_edge(0, 9);
        assert_eq!(global.merge(&other), 0);
        assert_eq!(global.stats().edges_covered, 2);
    }

    #[test]
    fn clone_is_deep_and_hash_tracks_content() {
        let mut map = CoverageMap::new(32);
        map.record_edge(4, 4);
        let snapshot = map.clone();
        assert_eq!(snapshot.hash(), map.hash());
        map.record_edge(8, 1);
        assert_ne!(snapshot.hash(), map.hash());
        assert_eq!(snapshot.stats().edges_covered, 1);
        assert_eq!(map.hash().len(), 32);
    }

    #[test]
    fn tracker_flags_interesting_and_caps_history() {
        let tracker = CoverageTracker::with_history_cap(256, 3);
        let mut exec = CoverageMap::new(256);
        exec.record_edge(1, 1);
        assert!(tracker.record_execution(&exec, "a"));
        assert!(!tracker.record_execution(&exec, "b"));
        exec.record_edge(2, 2);
        assert!(tracker.record_execution(&exec, "c"));
        assert!(!tracker.record_execution(&exec, "d"));

        let history = tracker.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].input_hash, "b");
        assert!(history[1].interesting);
        assert_eq!(tracker.stats().edges_covered, 2);
    }

    #[test]
    fn bitmap_survives_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coverage.bin");
        let tracker = CoverageTracker::new(512);
        let mut exec = CoverageMap::new(512);
        exec.record_edge(10, 20);
        exec.record_edge(30, 40);
        tracker.record_execution(&exec, "x");
        tracker.save_bitmap(&path).unwrap();

        let restored = CoverageTracker::new(512);
        let stats = restored.load_bitmap(&path).unwrap();
        assert_eq!(stats.edges_covered, 2);
        assert!(!restored.record_execution(&exec, "x"));

        let wrong_size = CoverageTracker::new(64);
        assert!(matches!(
            wrong_size.load_bitmap(&path),
            Err(CoverageError::SizeMismatch { .. })
        ));
    }
}
