use super::infer::{TypeInferrer, looks_like_uuid};
use super::registry::{RandomSelector, Registry, Selector, WeightedSelector};
use super::{InputType, MutationError, MutatorRef};
use crate::random::SharedRandom;
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_MUTATION_PROBABILITY: f64 = 1.0;
pub const DEFAULT_MAX_MUTATIONS: usize = 5;

/// How the engine picks a mutator out of its active set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStrategy {
    #[default]
    Random,
    Weighted,
}

/// One step of the engine's type-detection cascade. Detectors run in list
/// order and the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDetector {
    /// Starts with `{` or `[` and has at least two bytes. Does not parse.
    Json,
    /// Starts with `<`.
    Xml,
    /// Optional leading `-`, then decimal digits only.
    Integer,
    Uuid,
    /// Full [`TypeInferrer`] cascade. Never reports `Unknown` as a match.
    Inferred,
}

impl TypeDetector {
    pub const BUILTIN: [TypeDetector; 4] = [
        TypeDetector::Json,
        TypeDetector::Xml,
        TypeDetector::Integer,
        TypeDetector::Uuid,
    ];

    pub fn detect(self, input: &[u8]) -> Option<InputType> {
        match self {
            TypeDetector::Json => (input.len() >= 2 && matches!(input[0], b'{' | b'['))
                .then_some(InputType::Json),
            TypeDetector::Xml => input.starts_with(b"<").then_some(InputType::Xml),
            TypeDetector::Integer => is_negatable_decimal(input).then_some(InputType::Integer),
            TypeDetector::Uuid => looks_like_uuid(input).then_some(InputType::Uuid),
            TypeDetector::Inferred => match TypeInferrer::new().infer_type(input) {
                InputType::Unknown => None,
                other => Some(other),
            },
        }
    }
}

fn is_negatable_decimal(input: &[u8]) -> bool {
    let digits = input.strip_prefix(b"-").unwrap_or(input);
    !digits.is_empty() && digits.iter().all(u8::is_ascii_digit)
}

/// Outcome of one engine call.
///
/// On failure `mutated` holds the last successfully produced bytes (the
/// original input if nothing ran) and `error` says why.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<'a> {
    pub original: &'a [u8],
    pub mutated: Vec<u8>,
    /// Names of the mutators applied, in order. Empty when the probability
    /// roll skipped mutation.
    pub mutators: Vec<String>,
    pub input_type: InputType,
    pub success: bool,
    pub error: Option<MutationError>,
}

impl MutationResult<'_> {
    pub fn mutator_name(&self) -> Option<&str> {
        self.mutators.last().map(String::as_str)
    }
}

/// Drives registered mutators: detects the input type, rolls the mutation
/// probability, selects a mutator with the configured strategy and applies it.
pub struct MutatorEngine {
    registry: Registry,
    strategy: MutationStrategy,
    probability: f64,
    max_mutations: usize,
    active: Option<Vec<String>>,
    detectors: Vec<TypeDetector>,
    random_selector: RandomSelector,
    weighted_selector: WeightedSelector,
    rng: SharedRandom,
}

impl MutatorEngine {
    pub fn new(registry: Registry, rng: SharedRandom) -> Self {
        Self {
            registry,
            strategy: MutationStrategy::default(),
            probability: DEFAULT_MUTATION_PROBABILITY,
            max_mutations: DEFAULT_MAX_MUTATIONS,
            active: None,
            detectors: TypeDetector::BUILTIN.to_vec(),
            random_selector: RandomSelector::new(rng.clone()),
            weighted_selector: WeightedSelector::new(rng.clone()),
            rng,
        }
    }

    pub fn with_strategy(mut self, strategy: MutationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_max_mutations(mut self, max_mutations: usize) -> Self {
        self.max_mutations = max_mutations.max(1);
        self
    }

    pub fn with_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.weighted_selector = WeightedSelector::with_weights(self.rng.clone(), weights);
        self
    }

    pub fn with_detectors(mut self, detectors: Vec<TypeDetector>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Restricts selection to the named mutators. Every name must be registered.
    pub fn with_active_mutators<S: AsRef<str>>(
        mut self,
        names: &[S],
    ) -> Result<Self, MutationError> {
        let mut active = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if self.registry.get(name).is_none() {
                return Err(MutationError::UnknownMutator(name.to_string()));
            }
            active.push(name.to_string());
        }
        self.active = Some(active);
        Ok(self)
    }

    pub fn set_weight(&mut self, name: impl Into<String>, weight: f64) {
        self.weighted_selector.set_weight(name, weight);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn strategy(&self) -> MutationStrategy {
        self.strategy
    }

    pub fn max_mutations(&self) -> usize {
        self.max_mutations
    }

    /// Configured subset, or every registered mutator in registration order.
    pub fn active_mutators(&self) -> Vec<MutatorRef> {
        match &self.active {
            Some(names) => names.iter().filter_map(|n| self.registry.get(n)).collect(),
            None => self.registry.all(),
        }
    }

    pub fn detect_type(&self, input: &[u8]) -> InputType {
        self.detectors
            .iter()
            .find_map(|detector| detector.detect(input))
            .unwrap_or(InputType::Unknown)
    }

    fn selector(&self) -> &dyn Selector {
        match self.strategy {
            MutationStrategy::Random => &self.random_selector,
            MutationStrategy::Weighted => &self.weighted_selector,
        }
    }

    pub fn mutate<'a>(&self, input: &'a [u8]) -> MutationResult<'a> {
        let input_type = self.detect_type(input);
        let mut result = MutationResult {
            original: input,
            mutated: input.to_vec(),
            mutators: Vec::new(),
            input_type,
            success: true,
            error: None,
        };

        if !self.random_selector.should_mutate(self.probability) {
            return result;
        }

        let Some(mutator) = self.selector().select_mutator(&self.active_mutators()) else {
            result.success = false;
            result.error = Some(MutationError::NoMutators);
            return result;
        };

        result.mutators.push(mutator.name().to_string());
        match mutator.mutate_with_type(input, input_type) {
            Ok(mutated) => {
                trace!(
                    "{} ({input_type}): {} -> {} bytes",
                    mutator.name(),
                    input.len(),
                    mutated.len()
                );
                result.mutated = mutated;
            }
            Err(e) => {
                trace!("{} failed: {e}", mutator.name());
                result.success = false;
                result.error = Some(e);
            }
        }
        result
    }

    /// Applies `n` mutations, each on the previous output. The first failure
    /// stops the chain.
    pub fn mutate_n<'a>(&self, input: &'a [u8], n: usize) -> MutationResult<'a> {
        let mut current = input.to_vec();
        let mut applied = Vec::new();
        let mut error = None;
        for _ in 0..n {
            let (mutated, mutators, step_error) = {
                let step = self.mutate(&current);
                (step.mutated, step.mutators, step.error)
            };
            applied.extend(mutators);
            if step_error.is_some() {
                error = step_error;
                break;
            }
            current = mutated;
        }
        MutationResult {
            original: input,
            mutated: current,
            mutators: applied,
            input_type: self.detect_type(input),
            success: error.is_none(),
            error,
        }
    }

    /// Chains a random number of mutations in `[1, max_mutations]`.
    pub fn mutate_chain<'a>(&self, input: &'a [u8]) -> MutationResult<'a> {
        let n = 1 + self.rng.uniform_int(self.max_mutations);
        self.mutate_n(input, n)
    }
}

/// Mutation capability consumed by the feedback loop. Infallible: a failed
/// mutation yields the input unchanged.
pub trait InputMutator: Send + Sync {
    fn mutate(&self, input: &[u8]) -> Vec<u8>;
}

impl InputMutator for MutatorEngine {
    fn mutate(&self, input: &[u8]) -> Vec<u8> {
        let result = MutatorEngine::mutate(self, input);
        if result.success {
            result.mutated
        } else {
            input.to_vec()
        }
    }
}

/// Feeds every input through [`MutatorEngine::mutate_chain`].
pub struct ChainingMutator {
    engine: Arc<MutatorEngine>,
}

impl ChainingMutator {
    pub fn new(engine: Arc<MutatorEngine>) -> Self {
        Self { engine }
    }
}

impl InputMutator for ChainingMutator {
    fn mutate(&self, input: &[u8]) -> Vec<u8> {
        let result = self.engine.mutate_chain(input);
        if result.success {
            result.mutated
        } else {
            input.to_vec()
        }
    }
}
