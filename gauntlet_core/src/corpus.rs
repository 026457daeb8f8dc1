use crate::coverage::CoverageStats;
use crate::executor::ExecutionResult;
use crate::unix_millis;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Subdirectory holding retained inputs.
pub const QUEUE_DIR: &str = "queue";
/// Subdirectory holding crash-inducing inputs.
pub const CRASHES_DIR: &str = "crashes";

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading or writing corpus files.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// Entry metadata could not be encoded to JSON.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// Entry metadata on disk could not be decoded.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// Lowercase hex SHA-256 of `data`. Always 64 characters.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// An input retained because it produced new coverage, or because it was seeded.
///
/// The JSON metadata written next to the raw bytes mirrors this struct minus
/// `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    #[serde(skip)]
    pub data: Vec<u8>,
    pub hash: String,
    pub size: usize,
    pub coverage: CoverageStats,
    pub discovered_at_ms: u64,
    pub execution_count: u64,
    pub is_seed: bool,
    pub favored: bool,
}

impl CorpusEntry {
    pub fn new(data: Vec<u8>, coverage: CoverageStats, is_seed: bool) -> Self {
        Self {
            hash: content_hash(&data),
            size: data.len(),
            data,
            coverage,
            discovered_at_ms: unix_millis(),
            execution_count: 0,
            is_seed,
            favored: false,
        }
    }

    pub fn seed(data: Vec<u8>) -> Self {
        Self::new(data, CoverageStats::default(), true)
    }
}

/// An input that crashed the target, with whatever the target printed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashEntry {
    #[serde(skip)]
    pub input: Vec<u8>,
    #[serde(skip)]
    pub output: Vec<u8>,
    pub hash: String,
    pub exit_code: i32,
    pub discovered_at_ms: u64,
    pub unique: bool,
}

/// Aggregate numbers over the corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorpusStats {
    pub entries: usize,
    pub crashes: usize,
    pub total_size: usize,
    pub avg_size: f64,
    pub min_size: usize,
    pub max_size: usize,
    pub favored: usize,
    pub seeds: usize,
    pub persist_failures: u64,
}

#[derive(Debug, Default)]
struct EntryStore {
    entries: Vec<CorpusEntry>,
    index: HashMap<String, usize>,
}

impl EntryStore {
    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.hash.clone(), position))
            .collect();
    }
}

#[derive(Debug, Default)]
struct CrashStore {
    crashes: Vec<CrashEntry>,
    index: HashMap<String, usize>,
}

/// Content-addressed store of interesting inputs and crashes.
///
/// With a root directory, every accepted entry is also written to
/// `queue/<hash>` + `queue/<hash>.json` and every crash to `crashes/`.
/// Writes happen after the in-memory lock is released; failures are logged and
/// counted, never returned.
#[derive(Debug)]
pub struct Corpus {
    root: Option<PathBuf>,
    store: RwLock<EntryStore>,
    crash_store: RwLock<CrashStore>,
    persist_failures: AtomicU64,
}

impl Corpus {
    /// Creates a corpus without disk persistence.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            store: RwLock::new(EntryStore::default()),
            crash_store: RwLock::new(CrashStore::default()),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Creates a persistent corpus rooted at `root`, creating `queue/` and
    /// `crashes/` if needed. Existing entries are not loaded; call [`Corpus::load`].
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {:?} exists but is not a directory",
                root
            )));
        }
        for sub in [QUEUE_DIR, CRASHES_DIR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| {
                CorpusError::Io(format!("Failed to create corpus directory {:?}: {}", dir, e))
            })?;
        }
        Ok(Self {
            root: Some(root),
            ..Self::in_memory()
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn queue_dir(&self) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(QUEUE_DIR))
    }

    fn crashes_dir(&self) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(CRASHES_DIR))
    }

    fn note_persist_failure(&self, what: &str, err: &CorpusError) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
        warn!("Failed to persist {}: {}", what, err);
    }

    /// Adds `entry` unless an entry with the same hash exists. Returns whether
    /// it was added.
    pub fn add(&self, entry: CorpusEntry) -> bool {
        {
            let mut store = self.store.write();
            if store.index.contains_key(&entry.hash) {
                return false;
            }
            let position = store.entries.len();
            store.index.insert(entry.hash.clone(), position);
            store.entries.push(entry.clone());
        }

        if let Some(queue) = self.queue_dir() {
            if let Err(e) = write_entry_files(&queue, &entry) {
                self.note_persist_failure(&format!("corpus entry {}", entry.hash), &e);
            }
        }
        debug!("Corpus accepted {} ({} bytes)", entry.hash, entry.size);
        true
    }

    /// Records a crashing input. Duplicates (same input hash) are rejected.
    pub fn add_crash(&self, input: &[u8], result: &ExecutionResult) -> bool {
        let hash = content_hash(input);
        let crash = {
            let mut store = self.crash_store.write();
            if store.index.contains_key(&hash) {
                return false;
            }
            let crash = CrashEntry {
                input: input.to_vec(),
                output: result.output.clone(),
                hash: hash.clone(),
                exit_code: result.exit_code,
                discovered_at_ms: unix_millis(),
                unique: true,
            };
            let position = store.crashes.len();
            store.index.insert(hash, position);
            store.crashes.push(crash.clone());
            crash
        };

        if let Some(crashes) = self.crashes_dir() {
            if let Err(e) = write_crash_files(&crashes, &crash) {
                self.note_persist_failure(&format!("crash {}", crash.hash), &e);
            }
        }
        info!(
            "New crash {} (exit code {}, {} bytes)",
            crash.hash,
            crash.exit_code,
            crash.input.len()
        );
        true
    }

    /// Drops redundant entries and returns how many were removed.
    ///
    /// Entries are ranked by `edges_covered`; the top one becomes favored. An
    /// entry survives when it is a seed, favored, or covers at least one edge.
    /// This does not compare edges between entries.
    pub fn minimize(&self) -> usize {
        let removed: Vec<CorpusEntry> = {
            let mut store = self.store.write();
            if store.entries.is_empty() {
                return 0;
            }
            store
                .entries
                .sort_by(|a, b| b.coverage.edges_covered.cmp(&a.coverage.edges_covered));
            store.entries[0].favored = true;

            let (kept, removed): (Vec<_>, Vec<_>) =
                std::mem::take(&mut store.entries)
                    .into_iter()
                    .partition(|entry| {
                        entry.is_seed || entry.favored || entry.coverage.edges_covered > 0
                    });
            store.entries = kept;
            store.reindex();
            removed
        };

        if let Some(queue) = self.queue_dir() {
            for entry in &removed {
                for path in [
                    queue.join(&entry.hash),
                    queue.join(format!("{}.json", entry.hash)),
                ] {
                    if let Err(e) = fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            self.note_persist_failure(
                                &format!("removal of {:?}", path),
                                &CorpusError::from(e),
                            );
                        }
                    }
                }
            }
        }
        if !removed.is_empty() {
            info!("Corpus minimization removed {} entries", removed.len());
        }
        removed.len()
    }

    /// Rehydrates entries from `queue/`. Returns how many were added.
    ///
    /// Raw files without readable metadata are loaded as seeds.
    pub fn load(&self) -> Result<usize, CorpusError> {
        let Some(queue) = self.queue_dir() else {
            return Ok(0);
        };
        if !queue.is_dir() {
            return Ok(0);
        }
        let mut loaded = 0;
        for dir_entry in fs::read_dir(&queue).map_err(|e| {
            CorpusError::Io(format!("Failed to read queue directory {:?}: {}", queue, e))
        })? {
            let path = dir_entry?.path();
            if !path.is_file() || path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let data = fs::read(&path).map_err(|e| {
                CorpusError::Io(format!("Failed to read corpus input {:?}: {}", path, e))
            })?;
            let meta_path = path.with_file_name(format!(
                "{}.json",
                path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
            ));
            let entry = match read_entry_metadata(&meta_path) {
                Ok(mut meta) => {
                    meta.hash = content_hash(&data);
                    meta.size = data.len();
                    meta.data = data;
                    meta
                }
                Err(e) => {
                    warn!("Loading {:?} as a seed: {}", path, e);
                    CorpusEntry::seed(data)
                }
            };
            if self.insert_loaded(entry) {
                loaded += 1;
            }
        }
        info!("Loaded {} corpus entries from {:?}", loaded, queue);
        Ok(loaded)
    }

    /// Inserts without re-persisting, since the files are already on disk.
    fn insert_loaded(&self, entry: CorpusEntry) -> bool {
        let mut store = self.store.write();
        if store.index.contains_key(&entry.hash) {
            return false;
        }
        let position = store.entries.len();
        store.index.insert(entry.hash.clone(), position);
        store.entries.push(entry);
        true
    }

    /// Imports raw seed files. Directories are read one level deep; dotfiles
    /// are skipped. Returns how many new seeds were added.
    pub fn load_seeds(&self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError> {
        let mut loaded_count = 0;
        for path_buf in seed_paths {
            let path_ref = path_buf.as_path();
            if path_ref.is_file() {
                let data = fs::read(path_ref).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed file {:?}: {}", path_ref, e))
                })?;
                if self.add(CorpusEntry::seed(data)) {
                    loaded_count += 1;
                }
            } else if path_ref.is_dir() {
                for entry_result in fs::read_dir(path_ref).map_err(|e| {
                    CorpusError::Io(format!(
                        "Failed to read seed directory {:?}: {}",
                        path_ref, e
                    ))
                })? {
                    let file_path = entry_result?.path();
                    let hidden = file_path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with('.'));
                    if !file_path.is_file() || hidden {
                        continue;
                    }
                    let data = fs::read(&file_path).map_err(|e| {
                        CorpusError::Io(format!(
                            "Failed to read seed file {:?}: {}",
                            file_path, e
                        ))
                    })?;
                    if self.add(CorpusEntry::seed(data)) {
                        loaded_count += 1;
                    }
                }
            } else {
                warn!("Seed path {:?} does not exist, skipping", path_ref);
            }
        }
        Ok(loaded_count)
    }

    /// Adds `count` to the execution counter of the entry with `hash`.
    pub fn record_execution(&self, hash: &str, count: u64) {
        let mut store = self.store.write();
        if let Some(&position) = store.index.get(hash) {
            store.entries[position].execution_count += count;
        }
    }

    pub fn get(&self, hash: &str) -> Option<CorpusEntry> {
        let store = self.store.read();
        store
            .index
            .get(hash)
            .map(|&position| store.entries[position].clone())
    }

    /// Entry at `position` in the current ordering.
    pub fn get_at(&self, position: usize) -> Option<CorpusEntry> {
        self.store.read().entries.get(position).cloned()
    }

    /// Lets `choose` pick a position while the entries are read-locked and
    /// returns a copy of that entry.
    pub fn select_with<F>(&self, choose: F) -> Option<CorpusEntry>
    where
        F: FnOnce(&[CorpusEntry]) -> Option<usize>,
    {
        let store = self.store.read();
        choose(&store.entries).and_then(|position| store.entries.get(position).cloned())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.store.read().index.contains_key(hash)
    }

    pub fn entries(&self) -> Vec<CorpusEntry> {
        self.store.read().entries.clone()
    }

    pub fn crashes(&self) -> Vec<CrashEntry> {
        self.crash_store.read().crashes.clone()
    }

    pub fn size(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn crash_count(&self) -> usize {
        self.crash_store.read().crashes.len()
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CorpusStats {
        let store = self.store.read();
        let sizes = store.entries.iter().map(|entry| entry.size);
        let total_size: usize = sizes.clone().sum();
        let entries = store.entries.len();
        CorpusStats {
            entries,
            crashes: self.crash_count(),
            total_size,
            avg_size: if entries == 0 {
                0.0
            } else {
                total_size as f64 / entries as f64
            },
            min_size: sizes.clone().min().unwrap_or(0),
            max_size: sizes.max().unwrap_or(0),
            favored: store.entries.iter().filter(|entry| entry.favored).count(),
            seeds: store.entries.iter().filter(|entry| entry.is_seed).count(),
            persist_failures: self.persist_failures(),
        }
    }
}

fn write_entry_files(queue: &Path, entry: &CorpusEntry) -> Result<(), CorpusError> {
    fs::write(queue.join(&entry.hash), &entry.data)?;
    let metadata = serde_json::to_vec_pretty(entry)
        .map_err(|e| CorpusError::Serialization(e.to_string()))?;
    fs::write(queue.join(format!("{}.json", entry.hash)), metadata)?;
    Ok(())
}

fn write_crash_files(crashes: &Path, crash: &CrashEntry) -> Result<(), CorpusError> {
    fs::write(crashes.join(&crash.hash), &crash.input)?;
    if !crash.output.is_empty() {
        fs::write(crashes.join(format!("{}.output", crash.hash)), &crash.output)?;
    }
    let metadata = serde_json::to_vec_pretty(crash)
        .map_err(|e| CorpusError::Serialization(e.to_string()))?;
    fs::write(crashes.join(format!("{}.json", crash.hash)), metadata)?;
    Ok(())
}

fn read_entry_metadata(path: &Path) -> Result<CorpusEntry, CorpusError> {
    let raw = fs::read(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read metadata {:?}: {}", path, e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| CorpusError::Deserialization(format!("{:?}: {}", path, e)))
}

/// Background thread that periodically runs [`Corpus::minimize`].
#[derive(Debug)]
pub struct CorpusPruner {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CorpusPruner {
    pub fn spawn(corpus: Arc<Corpus>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("corpus-pruner".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            corpus.minimize();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .ok();
        if handle.is_none() {
            warn!("Failed to spawn corpus pruner thread");
        }
        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Stops the pruner and waits for its thread. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CorpusPruner {
    fn drop(&mut self) {
        self.stop();
    }
}
