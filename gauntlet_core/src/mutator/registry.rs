use super::{MutationType, MutatorRef};
use crate::random::SharedRandom;
use std::collections::HashMap;

/// Insertion-ordered collection of mutators addressed by name.
///
/// Iteration order is registration order; it determines the engine's default
/// active set, so lookups go through a side index instead of a bare map.
#[derive(Default, Clone)]
pub struct Registry {
    mutators: Vec<MutatorRef>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mutator. Registering an existing name replaces it in place and
    /// keeps its original position.
    pub fn register(&mut self, mutator: MutatorRef) {
        let name = mutator.name().to_string();
        match self.index.get(&name) {
            Some(&pos) => self.mutators[pos] = mutator,
            None => {
                self.index.insert(name, self.mutators.len());
                self.mutators.push(mutator);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<MutatorRef> {
        self.index.get(name).map(|&pos| self.mutators[pos].clone())
    }

    pub fn get_by_type(&self, mutation_type: MutationType) -> Vec<MutatorRef> {
        self.mutators
            .iter()
            .filter(|m| m.mutation_type() == mutation_type)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<MutatorRef> {
        self.mutators.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.mutators.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn count(&self) -> usize {
        self.mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }

    pub fn remove(&mut self, name: &str) -> Option<MutatorRef> {
        let pos = self.index.remove(name)?;
        let removed = self.mutators.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(removed)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("mutators", &self.names())
            .finish()
    }
}

/// Picks one mutator out of a candidate list.
pub trait Selector: Send + Sync {
    fn select_mutator(&self, candidates: &[MutatorRef]) -> Option<MutatorRef>;
}

/// Uniform choice among candidates.
#[derive(Clone)]
pub struct RandomSelector {
    rng: SharedRandom,
}

impl RandomSelector {
    pub fn new(rng: SharedRandom) -> Self {
        Self { rng }
    }

    /// True with probability `p`, clamped to `[0, 1]`.
    pub fn should_mutate(&self, p: f64) -> bool {
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        if p >= 1.0 {
            return true;
        }
        if p <= 0.0 {
            return false;
        }
        self.rng.uniform_f64() < p
    }
}

impl Selector for RandomSelector {
    fn select_mutator(&self, candidates: &[MutatorRef]) -> Option<MutatorRef> {
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.uniform_int(candidates.len())].clone())
    }
}

/// Choice proportional to a per-name weight. Unlisted names weigh 1.0.
#[derive(Clone)]
pub struct WeightedSelector {
    weights: HashMap<String, f64>,
    rng: SharedRandom,
}

impl WeightedSelector {
    pub const DEFAULT_WEIGHT: f64 = 1.0;

    pub fn new(rng: SharedRandom) -> Self {
        Self {
            weights: HashMap::new(),
            rng,
        }
    }

    pub fn with_weights(rng: SharedRandom, weights: HashMap<String, f64>) -> Self {
        Self { weights, rng }
    }

    pub fn set_weight(&mut self, name: impl Into<String>, weight: f64) {
        self.weights.insert(name.into(), weight.max(0.0));
    }

    pub fn weight(&self, name: &str) -> f64 {
        self.weights
            .get(name)
            .copied()
            .unwrap_or(Self::DEFAULT_WEIGHT)
    }
}

impl Selector for WeightedSelector {
    fn select_mutator(&self, candidates: &[MutatorRef]) -> Option<MutatorRef> {
        if candidates.is_empty() {
            return None;
        }
        let weights: Vec<f64> = candidates
            .iter()
            .map(|m| self.weight(m.name()).max(0.0))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return Some(candidates[self.rng.uniform_int(candidates.len())].clone());
        }

        let target = self.rng.uniform_f64() * total;
        let mut cumulative = 0.0;
        for (candidate, weight) in candidates.iter().zip(&weights) {
            cumulative += weight;
            if target < cumulative {
                return Some(candidate.clone());
            }
        }
        // Floating point rounding can leave target == total.
        candidates
            .iter()
            .zip(&weights)
            .rev()
            .find(|(_, w)| **w > 0.0)
            .map(|(c, _)| c.clone())
    }
}
