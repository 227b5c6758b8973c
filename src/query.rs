//! Query string splitting, percent-decoding and the inverse builders.

use percent_encoding::percent_decode;

use crate::helpers::has_only_valid_escapes;
use crate::limits::ParseLimits;
use crate::nested;
use crate::params::{Param, Params, Value};

/// Parses `application/x-www-form-urlencoded` data and URL query strings.
///
/// Both limits are checked before any pair is decoded, so an oversized
/// string is rejected without doing any work on it.
///
/// # Examples
///
/// ```
/// use multiform::{ParseLimits, QueryParser};
///
/// let parser = QueryParser::new(ParseLimits::default());
/// let params = parser.parse_nested_query("user[name]=Jo+Doe&user[langs][]=rust&user[langs][]=c").unwrap();
///
/// let user = params.get("user").and_then(|u| u.as_map()).unwrap();
/// assert_eq!(user.get("name").and_then(|n| n.as_str()), Some("Jo Doe"));
/// assert_eq!(user.get("langs").and_then(|l| l.as_list()).map(|l| l.len()), Some(2));
/// ```
#[derive(Debug, Clone)]
pub struct QueryParser {
    limits: ParseLimits,
    separators: Vec<u8>,
}

impl QueryParser {
    /// Creates a parser splitting on `&`.
    pub fn new(limits: ParseLimits) -> QueryParser {
        QueryParser {
            limits,
            separators: b"&".to_vec(),
        }
    }

    /// Splits on any of the given characters instead, e.g. `"&;"`.
    pub fn with_separators(mut self, separators: &str) -> QueryParser {
        if !separators.is_empty() {
            self.separators = separators.as_bytes().to_vec();
        }
        self
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    /// Splits `qs` into decoded `(key, value)` pairs, in input order.
    ///
    /// A pair without `=` yields [`Value::Null`]; `key=` yields an empty
    /// text value. Empty pairs (`a=1&&b=2`) are skipped.
    pub fn pairs<Q: AsRef<[u8]>>(&self, qs: Q) -> crate::Result<Vec<(String, Value)>> {
        let qs = qs.as_ref();
        if qs.is_empty() {
            return Ok(Vec::new());
        }

        self.check_limits(qs)?;

        let mut pairs = Vec::new();
        for piece in self.split(qs) {
            if piece.is_empty() {
                continue;
            }

            let (key, value) = match piece.iter().position(|b| *b == b'=') {
                Some(idx) => (&piece[..idx], Some(&piece[idx + 1..])),
                None => (piece, None),
            };

            let key = String::from_utf8_lossy(&unescape_bytes(key)?).into_owned();
            let value = match value {
                Some(raw) => bytes_to_value(unescape_bytes(raw)?),
                None => Value::Null,
            };

            pairs.push((key, value));
        }

        Ok(pairs)
    }

    /// Parses without bracket nesting. A repeated key keeps its last value.
    pub fn parse_query<Q: AsRef<[u8]>>(&self, qs: Q) -> crate::Result<Params> {
        let mut params = Params::new();
        for (key, value) in self.pairs(qs)? {
            params.insert(key, Param::Scalar(value));
        }
        Ok(params)
    }

    /// Parses with bracket nesting, see [`normalize_params`](crate::normalize_params).
    pub fn parse_nested_query<Q: AsRef<[u8]>>(&self, qs: Q) -> crate::Result<Params> {
        let mut params = Params::new();
        for (key, value) in self.pairs(qs)? {
            self.normalize_params(&mut params, &key, value)?;
        }
        Ok(params)
    }

    /// Stores one pair under its bracketed key, using this parser's depth limit.
    pub fn normalize_params(&self, params: &mut Params, name: &str, value: Value) -> crate::Result<()> {
        nested::normalize_params(params, name, value, self.limits.max_param_depth)
    }

    fn check_limits(&self, qs: &[u8]) -> crate::Result<()> {
        if ParseLimits::exceeds(self.limits.max_query_bytesize, qs.len()) {
            log::warn!("query of {} bytes rejected", qs.len());
            return Err(crate::Error::QueryLimitExceeded {
                what: "query size",
                actual: qs.len(),
                limit: self.limits.max_query_bytesize,
            });
        }

        let pairs = qs.iter().filter(|b| self.separators.contains(b)).count() + 1;
        if ParseLimits::exceeds(self.limits.max_query_pairs, pairs) {
            log::warn!("query with {} pairs rejected", pairs);
            return Err(crate::Error::QueryLimitExceeded {
                what: "number of query parameters",
                actual: pairs,
                limit: self.limits.max_query_pairs,
            });
        }

        Ok(())
    }

    /// Splits on the separators, dropping spaces that directly follow one.
    fn split<'a>(&'a self, qs: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        qs.split(move |b| self.separators.contains(b)).enumerate().map(|(idx, piece)| {
            if idx == 0 {
                piece
            } else {
                let spaces = piece.iter().take_while(|b| **b == b' ').count();
                &piece[spaces..]
            }
        })
    }
}

impl Default for QueryParser {
    fn default() -> Self {
        QueryParser::new(ParseLimits::default())
    }
}

/// [`QueryParser::parse_query`] with the default limits.
pub fn parse_query<Q: AsRef<[u8]>>(qs: Q) -> crate::Result<Params> {
    QueryParser::default().parse_query(qs)
}

/// [`QueryParser::parse_nested_query`] with the default limits.
pub fn parse_nested_query<Q: AsRef<[u8]>>(qs: Q) -> crate::Result<Params> {
    QueryParser::default().parse_nested_query(qs)
}

fn bytes_to_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(text) => Value::Text(text),
        Err(err) => Value::Binary(err.into_bytes().into()),
    }
}

/// Decodes a form component: `+` becomes a space and `%XX` escapes are
/// decoded. A `%` not followed by two hex digits is an error naming the
/// whole component.
pub fn unescape(s: &str) -> crate::Result<String> {
    unescape_bytes(s.as_bytes()).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn unescape_bytes(input: &[u8]) -> crate::Result<Vec<u8>> {
    if !has_only_valid_escapes(input) {
        return Err(crate::Error::InvalidParameter(String::from_utf8_lossy(input).into_owned()));
    }

    let spaced: Vec<u8> = input.iter().map(|&b| if b == b'+' { b' ' } else { b }).collect();
    Ok(percent_decode(&spaced).collect())
}

/// Encodes a form component. Alphanumerics and `*-._` are kept, a space
/// becomes `+`, everything else becomes an upper-case `%XX`.
pub fn escape(s: &str) -> String {
    escape_bytes(s.as_bytes())
}

pub(crate) fn escape_bytes(input: &[u8]) -> String {
    form_urlencoded::byte_serialize(input).collect()
}

fn escape_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Text(text) => escape(text),
        Value::Binary(bytes) => escape_bytes(bytes),
        Value::File(file) => escape(&file.filename),
    }
}

/// Builds a flat query string. List items repeat their key; maps fall back
/// to bracket notation.
///
/// # Examples
///
/// ```
/// use multiform::{build_query, Param, Params};
///
/// let mut params = Params::new();
/// params.insert("q", "rust lang");
/// params.insert("tag", Param::List(vec!["a".into(), "b".into()]));
///
/// assert_eq!(build_query(&params), "q=rust+lang&tag=a&tag=b");
/// ```
pub fn build_query(params: &Params) -> String {
    let mut out = Vec::new();

    for (key, param) in params.iter() {
        match param {
            Param::List(items) => {
                for item in items {
                    match item {
                        Param::Scalar(value) => push_pair(&mut out, key, value),
                        nested => build_nested(nested, key, &mut out),
                    }
                }
            }
            Param::Scalar(value) => push_pair(&mut out, key, value),
            map => build_nested(map, key, &mut out),
        }
    }

    out.join("&")
}

/// Builds a query string that [`parse_nested_query`] turns back into
/// `params`. Empty maps and lists produce nothing.
pub fn build_nested_query(params: &Params) -> String {
    let mut out = Vec::new();
    for (key, param) in params.iter() {
        build_nested(param, key, &mut out);
    }
    out.join("&")
}

fn build_nested(param: &Param, prefix: &str, out: &mut Vec<String>) {
    match param {
        Param::Scalar(value) => push_pair(out, prefix, value),
        Param::List(items) => {
            let prefix = format!("{}[]", prefix);
            for item in items {
                build_nested(item, &prefix, out);
            }
        }
        Param::Map(map) => {
            for (key, child) in map.iter() {
                build_nested(child, &format!("{}[{}]", prefix, key), out);
            }
        }
    }
}

fn push_pair(out: &mut Vec<String>, key: &str, value: &Value) {
    match value {
        Value::Null => out.push(escape(key)),
        value => out.push(format!("{}={}", escape(key), escape_value(value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_distinguish_missing_and_empty_values() {
        let pairs = QueryParser::default().pairs("a&b=&c=1").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".to_owned(), Value::Null),
                ("b".to_owned(), Value::Text(String::new())),
                ("c".to_owned(), Value::Text("1".to_owned())),
            ]
        );
    }

    #[test]
    fn test_separator_runs_and_spaces() {
        let parser = QueryParser::default().with_separators("&;");
        let params = parser.parse_query("a=1&&b=2; c=3;").unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params.get("c").and_then(Param::as_str), Some("3"));
    }

    #[test]
    fn test_flat_parse_last_write_wins() {
        let params = parse_query("a=1&a=2&a[]=3").unwrap();
        assert_eq!(params.get("a").and_then(Param::as_str), Some("2"));
        assert_eq!(params.get("a[]").and_then(Param::as_str), Some("3"));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a+b%20c%2B").unwrap(), "a b c+");
        assert_eq!(
            unescape("a%").unwrap_err().to_string(),
            "invalid %-encoding (a%)"
        );
        assert!(unescape("%zz").is_err());
    }

    #[test]
    fn test_invalid_encoding_in_query() {
        let err = parse_nested_query("a%=1").unwrap_err();
        assert_eq!(err, crate::Error::InvalidParameter("a%".to_owned()));

        let err = parse_nested_query("a=%E").unwrap_err();
        assert_eq!(err.to_string(), "invalid %-encoding (%E)");
    }

    #[test]
    fn test_non_utf8_values_stay_binary() {
        let params = parse_query("a=%FF%FE").unwrap();
        assert_eq!(
            params.get("a").and_then(Param::as_value),
            Some(&Value::Binary(bytes::Bytes::from_static(b"\xff\xfe")))
        );
    }

    #[test]
    fn test_bytesize_limit_checked_first() {
        let parser = QueryParser::new(ParseLimits::new().query_bytesize(8));
        let err = parser.parse_nested_query("a=12345678").unwrap_err();
        assert_eq!(err.to_string(), "total query size (10) exceeds limit (8)");

        // the bad escape is never looked at
        let err = parser.parse_nested_query("a%=1234567").unwrap_err();
        assert!(matches!(err, crate::Error::QueryLimitExceeded { .. }));
    }

    #[test]
    fn test_pair_limit() {
        let parser = QueryParser::new(ParseLimits::new().query_pairs(3));
        assert!(parser.parse_query("a=1&b=2&c=3").is_ok());

        let err = parser.parse_query("a=1&b=2&c=3&d=4").unwrap_err();
        assert_eq!(err.to_string(), "total number of query parameters (4) exceeds limit (3)");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a b&c=d/é*-._"), "a+b%26c%3Dd%2F%C3%A9*-._");
    }

    #[test]
    fn test_build_nested_query() {
        let params = parse_nested_query("a[b][]=1&a[b][]=2&c&d=x+y").unwrap();
        let built = build_nested_query(&params);
        assert_eq!(built, "a%5Bb%5D%5B%5D=1&a%5Bb%5D%5B%5D=2&c&d=x+y");
        assert_eq!(parse_nested_query(&built).unwrap(), params);
    }
}
