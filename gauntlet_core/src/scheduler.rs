use crate::corpus::{Corpus, CorpusEntry};
use crate::random::SharedRandom;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// A `Scheduler` picks the next corpus entry to mutate.
///
/// Schedulers may learn from feedback through [`Scheduler::update_priority`],
/// which the feedback loop calls whenever an entry is added for new coverage.
pub trait Scheduler: Send + Sync {
    /// Returns a copy of the entry to fuzz next, or `None` for an empty corpus.
    fn next(&self, corpus: &Corpus) -> Option<CorpusEntry>;

    /// Recomputes the entry's priority from its coverage.
    fn update_priority(&self, entry: &CorpusEntry);
}

/// Fitness of an entry: `log2(edges_covered + 1)`.
pub fn fitness(entry: &CorpusEntry) -> f64 {
    ((entry.coverage.edges_covered + 1) as f64).log2()
}

/// Coverage-weighted scheduler.
///
/// Each entry is chosen with probability proportional to `fitness + 1`, so
/// entries with zero coverage (seeds) still get picked. Entries without a
/// stored weight use their current fitness.
pub struct InputScheduler {
    weights: RwLock<HashMap<String, f64>>,
    rng: SharedRandom,
}

impl InputScheduler {
    pub fn new(rng: SharedRandom) -> Self {
        Self {
            weights: RwLock::new(HashMap::new()),
            rng,
        }
    }

    pub fn weight(&self, hash: &str) -> Option<f64> {
        self.weights.read().get(hash).copied()
    }

    /// Drops weights of entries no longer in the corpus, e.g. after minimization.
    fn prune(&self, entries: &[CorpusEntry]) {
        if self.weights.read().len() <= entries.len() {
            return;
        }
        let live: HashSet<&str> = entries.iter().map(|entry| entry.hash.as_str()).collect();
        self.weights
            .write()
            .retain(|hash, _| live.contains(hash.as_str()));
    }

    fn pick(&self, entries: &[CorpusEntry]) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }
        let weights = self.weights.read();
        let selection: Vec<f64> = entries
            .iter()
            .map(|entry| weights.get(&entry.hash).copied().unwrap_or_else(|| fitness(entry)) + 1.0)
            .collect();
        drop(weights);

        let total: f64 = selection.iter().sum();
        let target = self.rng.uniform_f64() * total;
        let mut cumulative = 0.0;
        for (position, weight) in selection.iter().enumerate() {
            cumulative += weight;
            if target < cumulative {
                return Some(position);
            }
        }
        Some(entries.len() - 1)
    }
}

impl Scheduler for InputScheduler {
    fn next(&self, corpus: &Corpus) -> Option<CorpusEntry> {
        corpus.select_with(|entries| {
            self.prune(entries);
            self.pick(entries)
        })
    }

    fn update_priority(&self, entry: &CorpusEntry) {
        self.weights
            .write()
            .insert(entry.hash.clone(), fitness(entry));
    }
}

/// Uniform selection. Ignores feedback.
pub struct RandomScheduler {
    rng: SharedRandom,
}

impl RandomScheduler {
    pub fn new(rng: SharedRandom) -> Self {
        Self { rng }
    }
}

impl Scheduler for RandomScheduler {
    fn next(&self, corpus: &Corpus) -> Option<CorpusEntry> {
        corpus.select_with(|entries| {
            (!entries.is_empty()).then(|| self.rng.uniform_int(entries.len()))
        })
    }

    fn update_priority(&self, _entry: &CorpusEntry) {}
}
