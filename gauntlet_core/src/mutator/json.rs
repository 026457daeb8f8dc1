use super::smart::PayloadType;
use super::{MutationError, MutationType, Mutator, pick};
use crate::random::{RandomSource, SharedRandom};
use log::trace;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};

/// Which structural transformation a [`JsonMutator`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonMutationType {
    /// Swap every scalar's type and flip the top-level container kind.
    TypeConfusion,
    /// Re-insert one key under a mangled spelling.
    KeyMangling,
    /// Rewrite every scalar with an injection-flavoured variant.
    ValueMutation,
    /// Add, drop, nest or duplicate members of the top-level container.
    StructuralMutation,
    /// Overwrite the first string field with an attack payload.
    Injection,
}

impl JsonMutationType {
    pub const ALL: [JsonMutationType; 5] = [
        JsonMutationType::TypeConfusion,
        JsonMutationType::KeyMangling,
        JsonMutationType::ValueMutation,
        JsonMutationType::StructuralMutation,
        JsonMutationType::Injection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JsonMutationType::TypeConfusion => "type_confusion",
            JsonMutationType::KeyMangling => "key_mangling",
            JsonMutationType::ValueMutation => "value_mutation",
            JsonMutationType::StructuralMutation => "structural",
            JsonMutationType::Injection => "injection",
        }
    }
}

const INJECTED_KEY: &str = "__proto__";
const ARRAY_SENTINEL: &str = "__gauntlet_sentinel__";

const INJECTION_FAMILIES: [PayloadType; 3] =
    [PayloadType::Sqli, PayloadType::Xss, PayloadType::Ssti];

/// Structure-aware mutator for JSON documents.
///
/// Input that does not parse as JSON is returned unchanged. So is a document
/// that fails to re-serialize.
pub struct JsonMutator {
    mutation_type: JsonMutationType,
    name: String,
    rng: SharedRandom,
}

impl JsonMutator {
    pub fn new(mutation_type: JsonMutationType, rng: SharedRandom) -> Self {
        Self {
            mutation_type,
            name: format!("json_{}", mutation_type.as_str()),
            rng,
        }
    }

    pub fn json_mutation_type(&self) -> JsonMutationType {
        self.mutation_type
    }

    /// Applies this mutator's transformation to an already-parsed document.
    pub fn mutate_value(&self, value: JsonValue) -> JsonValue {
        let rng = &*self.rng;
        match self.mutation_type {
            JsonMutationType::TypeConfusion => {
                let confused = confuse_types(value, rng);
                swap_container(confused)
            }
            JsonMutationType::KeyMangling => {
                let mut value = value;
                if let Some(map) = first_object_mut(&mut value) {
                    mangle_one_key(map, rng);
                }
                value
            }
            JsonMutationType::ValueMutation => {
                let mut value = value;
                mutate_scalars(&mut value, rng);
                value
            }
            JsonMutationType::StructuralMutation => mutate_structure(value, rng),
            JsonMutationType::Injection => {
                let mut value = value;
                if let Some(slot) = first_string_mut(&mut value) {
                    let family = *pick(rng, &INJECTION_FAMILIES);
                    *slot = pick(rng, family.payloads()).to_string();
                }
                value
            }
        }
    }

    fn encode(value: &JsonValue) -> Result<Vec<u8>, MutationError> {
        serde_json::to_vec(value).map_err(|e| MutationError::Serialization(e.to_string()))
    }
}

impl Mutator for JsonMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Structure-aware JSON mutation"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        let value: JsonValue = match serde_json::from_slice(input) {
            Ok(value) => value,
            Err(_) => return Ok(input.to_vec()),
        };
        match Self::encode(&self.mutate_value(value)) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                trace!("{}: {e}, keeping input", self.name);
                Ok(input.to_vec())
            }
        }
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::StructureAware
    }
}

fn number(value: f64) -> JsonValue {
    JsonNumber::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::from(0))
}

fn confuse_types(value: JsonValue, rng: &dyn RandomSource) -> JsonValue {
    match value {
        JsonValue::String(s) => match rng.uniform_int(3) {
            0 => JsonValue::from(s.len() as i64),
            1 => JsonValue::Bool(!s.is_empty()),
            _ => JsonValue::Null,
        },
        JsonValue::Number(n) => JsonValue::String(n.to_string()),
        JsonValue::Bool(b) => {
            if rng.coin() {
                JsonValue::String(b.to_string())
            } else {
                JsonValue::from(i64::from(b))
            }
        }
        JsonValue::Null => JsonValue::String("null".to_string()),
        JsonValue::Array(items) => {
            JsonValue::Array(items.into_iter().map(|v| confuse_types(v, rng)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .map(|(k, v)| (k, confuse_types(v, rng)))
                .collect(),
        ),
    }
}

fn swap_container(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Array(map.into_iter().map(|(_, v)| v).collect()),
        JsonValue::Array(items) => JsonValue::Object(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        ),
        other => other,
    }
}

fn first_object_mut(value: &mut JsonValue) -> Option<&mut JsonMap<String, JsonValue>> {
    match value {
        JsonValue::Object(map) => Some(map),
        JsonValue::Array(items) => items.iter_mut().find_map(first_object_mut),
        _ => None,
    }
}

fn first_string_mut(value: &mut JsonValue) -> Option<&mut String> {
    match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Array(items) => items.iter_mut().find_map(first_string_mut),
        JsonValue::Object(map) => map.values_mut().find_map(first_string_mut),
        _ => None,
    }
}

fn mangle_key(key: &str, choice: usize) -> String {
    match choice {
        0 => key.to_uppercase(),
        1 => key.to_lowercase(),
        2 => format!("{key}'"),
        3 => format!("__{key}__"),
        _ => format!("{key}\0"),
    }
}

fn mangle_one_key(map: &mut JsonMap<String, JsonValue>, rng: &dyn RandomSource) {
    if map.is_empty() {
        return;
    }
    let Some(key) = map.keys().nth(rng.uniform_int(map.len())).cloned() else {
        return;
    };
    // Try every variant from a random start; one that would clobber a sibling
    // (or leave the key as is) is skipped.
    let start = rng.uniform_int(5);
    let Some(mangled) = (0..5)
        .map(|step| mangle_key(&key, (start + step) % 5))
        .find(|candidate| *candidate != key && !map.contains_key(candidate))
    else {
        return;
    };
    if let Some(value) = map.remove(&key) {
        map.insert(mangled, value);
    }
}

fn mutate_string(s: &str, rng: &dyn RandomSource) -> String {
    match rng.uniform_int(6) {
        0 => format!("{s}'"),
        1 => format!("<script>{s}</script>"),
        2 => format!("{s} OR 1=1"),
        3 => format!("{{{{{s}}}}}"),
        4 => format!("{s}\0"),
        _ => s.repeat(100),
    }
}

fn mutate_number(n: &JsonNumber, rng: &dyn RandomSource) -> JsonValue {
    match rng.uniform_int(5) {
        0 => JsonValue::from(0),
        1 => JsonValue::from(-1),
        2 => number(n.as_f64().unwrap_or(0.0) * 1e6),
        3 => number(f64::MAX),
        _ => number(f64::MIN),
    }
}

fn mutate_scalars(value: &mut JsonValue, rng: &dyn RandomSource) {
    match value {
        JsonValue::String(s) => *s = mutate_string(s, rng),
        JsonValue::Number(n) => {
            let replacement = mutate_number(n, rng);
            *value = replacement;
        }
        JsonValue::Bool(b) => *b = !*b,
        JsonValue::Null => {}
        JsonValue::Array(items) => items.iter_mut().for_each(|v| mutate_scalars(v, rng)),
        JsonValue::Object(map) => map.values_mut().for_each(|v| mutate_scalars(v, rng)),
    }
}

fn mutate_structure(value: JsonValue, rng: &dyn RandomSource) -> JsonValue {
    match value {
        JsonValue::Object(mut map) => {
            match rng.uniform_int(4) {
                0 => {
                    map.insert(
                        INJECTED_KEY.to_string(),
                        serde_json::json!({ "polluted": true }),
                    );
                }
                1 => return JsonValue::Array(vec![JsonValue::Object(map)]),
                2 => {
                    if let Some(key) = map.keys().nth(rng.uniform_int(map.len())).cloned() {
                        map.remove(&key);
                    }
                }
                _ => {
                    if let Some((key, dup)) = map
                        .iter()
                        .nth(rng.uniform_int(map.len()))
                        .map(|(k, v)| (format!("{k}_dup"), v.clone()))
                    {
                        map.insert(key, dup);
                    }
                }
            }
            JsonValue::Object(map)
        }
        JsonValue::Array(mut items) => {
            match rng.uniform_int(3) {
                0 => items.push(JsonValue::String(ARRAY_SENTINEL.to_string())),
                1 => {
                    items.pop();
                }
                _ => {
                    if let Some(first) = items.first().cloned() {
                        items.insert(1, first);
                    }
                }
            }
            JsonValue::Array(items)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;
    use serde_json::json;

    fn mutator(kind: JsonMutationType, seed: u64) -> JsonMutator {
        JsonMutator::new(kind, SeededRandom::shared(seed))
    }

    fn parse(bytes: &[u8]) -> JsonValue {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn non_json_is_returned_unchanged() {
        for kind in JsonMutationType::ALL {
            let out = mutator(kind, 1).mutate(b"not json").unwrap();
            assert_eq!(out, b"not json".to_vec());
        }
    }

    #[test]
    fn type_confusion_swaps_scalars_and_container() {
        let m = mutator(JsonMutationType::TypeConfusion, 2);
        let out = parse(&m.mutate(br#"{"n": 5, "b": true, "z": null}"#).unwrap());
        let items = out.as_array().expect("object becomes array");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], json!("5"));
        assert!(items[1].is_string() || items[1].is_number());
        assert_eq!(items[2], json!("null"));

        let out = parse(&m.mutate(b"[1, 2]").unwrap());
        assert_eq!(out, json!({"0": "1", "1": "2"}));
    }

    #[test]
    fn key_mangling_keeps_value_under_new_key() {
        let m = mutator(JsonMutationType::KeyMangling, 3);
        for _ in 0..20 {
            let out = parse(&m.mutate(br#"{"userId": 42}"#).unwrap());
            let map = out.as_object().unwrap();
            assert_eq!(map.len(), 1);
            let (key, value) = map.iter().next().unwrap();
            assert_ne!(key, "userId");
            assert_eq!(value, &json!(42));
        }
    }

    #[test]
    fn key_mangling_never_overwrites_a_sibling() {
        for seed in 0..40 {
            let m = mutator(JsonMutationType::KeyMangling, seed);
            let out = parse(&m.mutate(br#"{"a": 1, "A": 2}"#).unwrap());
            let map = out.as_object().unwrap();
            assert_eq!(map.len(), 2, "seed {seed}: {out}");
            let mut values: Vec<i64> = map.values().filter_map(JsonValue::as_i64).collect();
            values.sort_unstable();
            assert_eq!(values, vec![1, 2]);
        }
    }

    #[test]
    fn value_mutation_rewrites_every_scalar() {
        let m = mutator(JsonMutationType::ValueMutation, 4);
        let out = parse(&m.mutate(br#"{"s": "ab", "n": 7, "f": false}"#).unwrap());
        assert_ne!(out["s"], json!("ab"));
        assert!(out["s"].as_str().unwrap().contains("ab"));
        assert_ne!(out["n"], json!(7));
        assert_eq!(out["f"], json!(true));
    }

    #[test]
    fn structural_mutation_changes_shape() {
        let m = mutator(JsonMutationType::StructuralMutation, 5);
        let original = json!({"a": 1, "b": 2});
        for _ in 0..20 {
            let out = parse(&m.mutate(original.to_string().as_bytes()).unwrap());
            assert_ne!(out, original);
        }
        let arr = json!([1, 2, 3]);
        for _ in 0..20 {
            let out = parse(&m.mutate(arr.to_string().as_bytes()).unwrap());
            let len = out.as_array().unwrap().len();
            assert!(len == 2 || len == 4);
        }
    }

    #[test]
    fn injection_touches_only_first_string_field() {
        let m = mutator(JsonMutationType::Injection, 6);
        let out = parse(&m.mutate(br#"{"id": 1, "name": "bob", "role": "user"}"#).unwrap());
        assert_eq!(out["id"], json!(1));
        assert_eq!(out["role"], json!("user"));
        let injected = out["name"].as_str().unwrap();
        let all: Vec<&str> = INJECTION_FAMILIES
            .iter()
            .flat_map(|family| family.payloads().iter().copied())
            .collect();
        assert!(all.contains(&injected));
    }
}
