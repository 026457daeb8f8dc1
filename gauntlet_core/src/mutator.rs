//! Mutation capability, the registry that orders mutators and the engine that
//! drives them.
//!
//! Byte-level AFL mutators live in [`afl`]; type-aware mutators with security
//! payloads live in [`smart`], [`json`] and [`xml`]; [`infer`] classifies raw
//! inputs.

pub mod afl;
pub mod engine;
pub mod infer;
pub mod json;
pub mod registry;
pub mod smart;
pub mod xml;

use crate::random::{RandomSource, SharedRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use engine::{
    ChainingMutator, InputMutator, MutationResult, MutationStrategy, MutatorEngine, TypeDetector,
};
pub use registry::{RandomSelector, Registry, Selector, WeightedSelector};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// An explicit offset/width does not fit inside the input.
    #[error("Offset {offset} with width {width} is out of range for length {len}")]
    OutOfRange {
        offset: usize,
        width: usize,
        len: usize,
    },

    /// The engine has no mutator to choose from.
    #[error("No active mutators available")]
    NoMutators,

    /// A configured mutator name is not registered.
    #[error("Unknown mutator '{0}'")]
    UnknownMutator(String),

    /// A structured mutator failed to re-encode its result.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Coarse category tag of a mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationType {
    BitFlip,
    ArithmeticAdd,
    InterestingValues,
    ByteSwap,
    Havoc,
    Dictionary,
    StructureAware,
}

/// Detected or inferred shape of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    Unknown,
    Json,
    Xml,
    Html,
    Jwt,
    Uuid,
    Email,
    Url,
    Base64,
    Hex,
    Integer,
    Float,
    String,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputType::Unknown => "unknown",
            InputType::Json => "json",
            InputType::Xml => "xml",
            InputType::Html => "html",
            InputType::Jwt => "jwt",
            InputType::Uuid => "uuid",
            InputType::Email => "email",
            InputType::Url => "url",
            InputType::Base64 => "base64",
            InputType::Hex => "hex",
            InputType::Integer => "integer",
            InputType::Float => "float",
            InputType::String => "string",
        };
        f.write_str(name)
    }
}

/// A `Mutator` turns one input into a new one.
///
/// Implementations never modify the caller's buffer and never fail on short or
/// odd-shaped input: they return the input unchanged instead. Only explicit
/// offset APIs on concrete mutators report [`MutationError::OutOfRange`].
pub trait Mutator: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError>;

    /// Mutates with knowledge of the input's detected type. Defaults to
    /// [`Mutator::mutate`].
    fn mutate_with_type(
        &self,
        input: &[u8],
        input_type: InputType,
    ) -> Result<Vec<u8>, MutationError> {
        let _ = input_type;
        self.mutate(input)
    }

    fn mutation_type(&self) -> MutationType;
}

/// Shared handle stored in the registry and handed out by selectors.
pub type MutatorRef = Arc<dyn Mutator>;

/// Uniform pick from a fixed, non-empty table.
pub(crate) fn pick<'a, T>(rng: &dyn RandomSource, items: &'a [T]) -> &'a T {
    &items[rng.uniform_int(items.len())]
}

/// Registers the byte-level AFL mutators, in their canonical order.
pub fn register_afl_mutators(registry: &mut Registry, rng: &SharedRandom) {
    use afl::*;
    for width in [1, 2, 4] {
        registry.register(Arc::new(BitFlipMutator::new(width, rng.clone())));
    }
    for width in [1, 2, 4] {
        registry.register(Arc::new(ByteFlipMutator::new(width, rng.clone())));
    }
    for width in [1, 2, 4] {
        registry.register(Arc::new(ArithmeticMutator::new(
            width,
            ARITH_MAX,
            rng.clone(),
        )));
    }
    for width in [1, 2, 4] {
        registry.register(Arc::new(InterestingValueMutator::new(width, rng.clone())));
    }
    for width in [2, 4] {
        registry.register(Arc::new(ByteSwapMutator::new(width, rng.clone())));
    }
    registry.register(Arc::new(RandomByteMutator::new(4, rng.clone())));
    registry.register(Arc::new(DeleteMutator::new(16, rng.clone())));
    registry.register(Arc::new(InsertMutator::new(16, rng.clone())));
    registry.register(Arc::new(CloneMutator::new(32, rng.clone())));
}

/// Registers the payload, structure-aware, boundary and Unicode mutators.
pub fn register_smart_mutators(registry: &mut Registry, rng: &SharedRandom) {
    use json::{JsonMutationType, JsonMutator};
    use smart::{BoundaryMutator, PayloadType, SmartMutator, UnicodeAttackMutator};
    use xml::{XmlMutationType, XmlMutator};

    for payload_type in PayloadType::ALL {
        registry.register(Arc::new(SmartMutator::new(payload_type, rng.clone())));
    }
    for mutation_type in JsonMutationType::ALL {
        registry.register(Arc::new(JsonMutator::new(mutation_type, rng.clone())));
    }
    for mutation_type in XmlMutationType::ALL {
        registry.register(Arc::new(XmlMutator::new(mutation_type, rng.clone())));
    }
    registry.register(Arc::new(BoundaryMutator::new(rng.clone())));
    registry.register(Arc::new(UnicodeAttackMutator::new(rng.clone())));
}

/// A registry holding every built-in mutator.
pub fn default_registry(rng: &SharedRandom) -> Registry {
    let mut registry = Registry::new();
    register_afl_mutators(&mut registry, rng);
    register_smart_mutators(&mut registry, rng);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn registration_helpers_populate_in_order() {
        let rng = SeededRandom::shared(0);
        let mut registry = Registry::new();
        register_afl_mutators(&mut registry, &rng);
        let afl_count = registry.count();
        assert_eq!(afl_count, 18);
        assert_eq!(registry.names()[0], "bitflip_1");
        assert_eq!(registry.names()[afl_count - 1], "clone");

        register_smart_mutators(&mut registry, &rng);
        assert!(registry.count() > afl_count);
        assert_eq!(registry.names()[afl_count], "smart_sqli");
        assert!(registry.get("json_injection").is_some());
        assert!(registry.get("xml_entity_injection").is_some());
        assert!(registry.get("boundary").is_some());
        assert!(registry.get("unicode_attack").is_some());
    }

    #[test]
    fn every_builtin_mutator_tolerates_empty_and_tiny_input() {
        let rng = SeededRandom::shared(11);
        let registry = default_registry(&rng);
        for mutator in registry.all() {
            for input in [&b""[..], &b"A"[..], &b"{}"[..], &b"<"[..]] {
                let result = mutator.mutate(input);
                assert!(
                    result.is_ok(),
                    "{} failed on {:?}: {:?}",
                    mutator.name(),
                    input,
                    result
                );
            }
        }
    }

    #[test]
    fn input_type_display_is_lowercase() {
        assert_eq!(InputType::Json.to_string(), "json");
        assert_eq!(InputType::Unknown.to_string(), "unknown");
    }
}
