//! Lexer for `value; key=param; ...` header syntax (RFC 2045, RFC 6266).
//!
//! Parameter values may be bare tokens, quoted strings with backslash
//! escapes, or RFC 2231 extended values (`key*=charset'lang'%XX..`). Parsing
//! is best effort: malformed quoting never fails, the segment is kept as an
//! opaque token instead.
//!
//! Only the first 1536 bytes and the first 16 `;`-separated segments are
//! looked at. Anything beyond is treated as absent.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_8};
use percent_encoding::percent_decode;

use crate::constants;

/// A header value split into its leading value and its parameters.
///
/// Parameter names are matched case-insensitively. When a name repeats, the
/// last occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderParams {
    value: String,
    params: Vec<(String, String)>,
}

impl HeaderParams {
    /// The part before the first `;`, e.g. `form-data`.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Looks `key` up, asking `fallback` for a value when it is missing.
    pub fn get_or_else<F>(&self, key: &str, fallback: F) -> Cow<'_, str>
    where
        F: FnOnce() -> String,
    {
        match self.get(key) {
            Some(value) => Cow::Borrowed(value),
            None => Cow::Owned(fallback()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Splits a raw header value into its leading value and parameters.
///
/// Extended parameters keep their trailing `*` in the name (`filename*`) and
/// carry the charset-decoded value.
///
/// # Examples
///
/// ```
/// use multiform::parse_header_params;
///
/// let params = parse_header_params(br#"form-data; name="a \"b\""; filename*=UTF-8''%E2%82%AC.txt"#);
/// assert_eq!(params.value(), "form-data");
/// assert_eq!(params.get("name"), Some("a \"b\""));
/// assert_eq!(params.get("filename*"), Some("€.txt"));
/// ```
pub fn parse_header_params(raw: &[u8]) -> HeaderParams {
    let raw = &raw[..raw.len().min(constants::MAX_HEADER_PARAM_BYTES)];
    let mut lexer = Lexer { raw, pos: 0 };

    let value = lexer.take_until(b';');
    let mut params = Vec::new();
    let mut segments = 1;

    while lexer.eat(b';') {
        segments += 1;
        if segments > constants::MAX_HEADER_PARAM_SEGMENTS {
            break;
        }

        if let Some((key, value)) = lexer.param() {
            params.push((key, value));
        }
    }

    HeaderParams {
        value: String::from_utf8_lossy(trim(value)).into_owned(),
        params,
    }
}

struct Lexer<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<u8> {
        self.raw.get(self.pos).copied()
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn take_until(&mut self, stop: u8) -> &'a [u8] {
        let start = self.pos;
        while self.peek().map_or(false, |b| b != stop) {
            self.pos += 1;
        }
        &self.raw[start..self.pos]
    }

    /// Lexes one `key=value` parameter, leaving the cursor on the next `;`.
    fn param(&mut self) -> Option<(String, String)> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().map_or(false, |b| b != b'=' && b != b';') {
            self.pos += 1;
        }
        let key = trim(&self.raw[start..self.pos]);

        if !self.eat(b'=') || key.is_empty() {
            self.take_until(b';');
            return None;
        }

        let key = String::from_utf8_lossy(key).to_ascii_lowercase();
        self.skip_ws();

        let value = if self.peek() == Some(b'"') {
            self.quoted()
        } else {
            trim(self.take_until(b';')).to_vec()
        };

        let value = if key.ends_with('*') {
            decode_extended_value(&value)
        } else {
            String::from_utf8_lossy(&value).into_owned()
        };

        Some((key, value))
    }

    /// Lexes a quoted string. Without a closing quote the rest of the segment
    /// is returned verbatim, opening quote included.
    fn quoted(&mut self) -> Vec<u8> {
        let open = self.pos;
        self.pos += 1;

        let mut value = Vec::new();
        while let Some(b) = self.peek() {
            match b {
                b'"' => {
                    self.pos += 1;
                    self.take_until(b';');
                    return value;
                }
                b'\\' if self.pos + 1 < self.raw.len() => {
                    value.push(self.raw[self.pos + 1]);
                    self.pos += 2;
                }
                _ => {
                    value.push(b);
                    self.pos += 1;
                }
            }
        }

        self.pos = open;
        trim(self.take_until(b';')).to_vec()
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let is_ws = |b: &u8| matches!(b, b' ' | b'\t' | b'\r' | b'\n');
    let start = bytes.iter().position(|b| !is_ws(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !is_ws(b)).map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Decodes `charset'language'percent-encoded` into a string. Values that do
/// not follow that shape are percent-decoded as UTF-8.
fn decode_extended_value(value: &[u8]) -> String {
    let mut pieces = value.splitn(3, |b| *b == b'\'');

    let (charset, encoded) = match (pieces.next(), pieces.next(), pieces.next()) {
        (Some(charset), Some(_lang), Some(encoded)) => (charset, encoded),
        _ => (&b""[..], value),
    };

    let encoding = Encoding::for_label(charset).unwrap_or(UTF_8);
    let bytes: Vec<u8> = percent_decode(encoded).collect();
    let (text, _, _) = encoding.decode(&bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_and_quoted_strings() {
        let params = parse_header_params(br#"form-data; name="my field"; filename=plain.txt"#);
        assert_eq!(params.value(), "form-data");
        assert_eq!(params.get("name"), Some("my field"));
        assert_eq!(params.get("FILENAME"), Some("plain.txt"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_quoted_semicolon_and_escapes() {
        let params = parse_header_params(br#"form-data; name="a;b"; filename="c:\\dir\\x.txt""#);
        assert_eq!(params.get("name"), Some("a;b"));
        assert_eq!(params.get("filename"), Some("c:\\dir\\x.txt"));
    }

    #[test]
    fn test_extended_value_charsets() {
        let params = parse_header_params(b"attachment; filename*=UTF-8'en'%E2%82%AC%20rates.txt");
        assert_eq!(params.get("filename*"), Some("€ rates.txt"));

        let params = parse_header_params(b"attachment; filename*=iso-8859-1''%A3%20rates");
        assert_eq!(params.get("filename*"), Some("£ rates"));

        let params = parse_header_params(b"attachment; filename*=no-quotes%41");
        assert_eq!(params.get("filename*"), Some("no-quotesA"));
    }

    #[test]
    fn test_unterminated_quote_is_opaque() {
        let params = parse_header_params(br#"form-data; filename="ok.txt"; name="broken"#);
        assert_eq!(params.get("filename"), Some("ok.txt"));
        assert_eq!(params.get("name"), Some("\"broken"));
    }

    #[test]
    fn test_segment_limit() {
        let mut raw = String::from("form-data");
        for i in 0..20 {
            raw.push_str(&format!("; p{}=v{}", i, i));
        }
        let params = parse_header_params(raw.as_bytes());

        assert_eq!(params.len(), 15);
        assert_eq!(params.get("p14"), Some("v14"));
        assert_eq!(params.get("p15"), None);
    }

    #[test]
    fn test_byte_limit() {
        let padding = "x".repeat(1600);
        let raw = format!("form-data; name=\"a\"; junk=\"{}\"; filename=\"late.txt\"", padding);
        let params = parse_header_params(raw.as_bytes());

        assert_eq!(params.get("name"), Some("a"));
        assert!(params.get("filename").is_none());
    }

    #[test]
    fn test_valueless_and_empty_segments() {
        let params = parse_header_params(b"form-data;; flag; name=x ;");
        assert_eq!(params.get("flag"), None);
        assert_eq!(params.get("name"), Some("x"));
    }

    #[test]
    fn test_lookup_miss_policy() {
        let params = parse_header_params(b"form-data; name=x");
        assert_eq!(params.get_or_else("name", || "fallback".to_owned()), "x");
        assert_eq!(params.get_or_else("filename", || "fallback".to_owned()), "fallback");
        assert!(!params.contains("filename"));
    }

    #[test]
    fn test_last_duplicate_wins() {
        let params = parse_header_params(b"form-data; name=a; name=b");
        assert_eq!(params.get("name"), Some("b"));
    }
}
