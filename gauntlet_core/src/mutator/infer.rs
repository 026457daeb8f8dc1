use super::InputType;

const HTML_MARKERS: &[&str] = &[
    "<!doctype html",
    "<html",
    "<head",
    "<body",
    "<div",
    "<span",
    "<script",
    "<style",
    "<form",
    "<input",
    "<iframe",
    "<img",
    "<table",
    "<a ",
    "<p>",
    "<br",
];

const URL_SCHEMES: &[&str] = &["http://", "https://", "ftp://", "file://"];

/// Classifies raw inputs with a fixed, first-match-wins cascade:
/// JSON, HTML, XML, JWT, UUID, Email, URL, Base64, Hex, Integer, Float, then
/// String. Empty and non UTF-8 inputs are [`InputType::Unknown`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeInferrer;

impl TypeInferrer {
    pub fn new() -> Self {
        Self
    }

    pub fn infer_type(&self, input: &[u8]) -> InputType {
        if input.is_empty() {
            return InputType::Unknown;
        }
        if looks_like_json(input) {
            return InputType::Json;
        }
        let Ok(text) = std::str::from_utf8(input) else {
            return InputType::Unknown;
        };
        let text = text.trim();

        if text.starts_with('<') {
            let lower = text.to_ascii_lowercase();
            if HTML_MARKERS.iter().any(|marker| lower.contains(marker)) {
                return InputType::Html;
            }
            return InputType::Xml;
        }
        if looks_like_jwt(text) {
            InputType::Jwt
        } else if looks_like_uuid(text.as_bytes()) {
            InputType::Uuid
        } else if looks_like_email(text) {
            InputType::Email
        } else if URL_SCHEMES.iter().any(|scheme| text.starts_with(scheme)) {
            InputType::Url
        } else if looks_like_base64(text) {
            InputType::Base64
        } else if looks_like_hex(text) {
            InputType::Hex
        } else if looks_like_integer(text.as_bytes()) {
            InputType::Integer
        } else if looks_like_float(text) {
            InputType::Float
        } else {
            InputType::String
        }
    }
}

/// Starts with `{` or `[` and parses as a JSON document.
pub fn looks_like_json(input: &[u8]) -> bool {
    let trimmed = input.trim_ascii();
    matches!(trimmed.first(), Some(b'{') | Some(b'['))
        && serde_json::from_slice::<serde_json::Value>(trimmed).is_ok()
}

/// 36 bytes, dashes at 8/13/18/23 and hex digits everywhere else.
pub fn looks_like_uuid(input: &[u8]) -> bool {
    input.len() == 36
        && input.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

/// Optional leading sign followed by at least one ASCII digit.
pub fn looks_like_integer(input: &[u8]) -> bool {
    let digits = match input.first() {
        Some(b'-') | Some(b'+') => &input[1..],
        _ => input,
    };
    !digits.is_empty() && digits.iter().all(u8::is_ascii_digit)
}

fn is_base64url_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn looks_like_jwt(text: &str) -> bool {
    let parts: Vec<&str> = text.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| part.len() >= 4 && part.chars().all(is_base64url_char))
}

fn looks_like_email(text: &str) -> bool {
    if text.chars().any(char::is_whitespace) {
        return false;
    }
    let Some(at) = text.find('@') else {
        return false;
    };
    if at == 0 || at == text.len() - 1 {
        return false;
    }
    match text[at + 1..].rfind('.') {
        Some(dot) => dot > 0 && at + 1 + dot < text.len() - 1,
        None => false,
    }
}

fn looks_like_base64(text: &str) -> bool {
    if text.is_empty() || text.len() % 4 != 0 {
        return false;
    }
    let body = text.trim_end_matches('=');
    text.len() - body.len() <= 2
        && !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
}

fn looks_like_hex(text: &str) -> bool {
    !text.is_empty() && text.len() % 2 == 0 && text.chars().all(|c| c.is_ascii_hexdigit())
}

fn looks_like_float(text: &str) -> bool {
    let mut dots = 0;
    let mut exponents = 0;
    let mut digits = 0;
    for (i, c) in text.chars().enumerate() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            'e' | 'E' => exponents += 1,
            '+' | '-' => {
                let prev = text[..i].chars().last();
                if i != 0 && !matches!(prev, Some('e') | Some('E')) {
                    return false;
                }
            }
            _ => return false,
        }
    }
    digits > 0 && dots <= 1 && exponents <= 1 && text.parse::<f64>().is_ok()
}
