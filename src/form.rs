use std::sync::Arc;

use encoding_rs::Encoding;

use crate::buffer::StreamBuffer;
use crate::constants;
use crate::limits::ParseLimits;
use crate::multipart::Multipart;
use crate::params::Params;
use crate::part::Part;
use crate::query::QueryParser;
use crate::source::{BoundedSource, ByteSource};
use crate::spool::{self, SpoolFactory, TempFileRegistry};

/// Turns a request body into [`Params`], picking the parser from the
/// `Content-Type`.
///
/// - `application/x-www-form-urlencoded` bodies are read whole, up to the
///   query size limit, and parsed with bracket nesting.
/// - `multipart/*` bodies are scanned part by part; file parts become
///   [`Value::File`](crate::Value::File) entries.
/// - Anything else yields an empty map.
///
/// # Examples
///
/// ```
/// use multiform::{memory_spool, FormParser, ParseLimits, ReaderSource};
///
/// let body = "--B\r\nContent-Disposition: form-data; name=\"user[name]\"\r\n\r\nJo\r\n--B--\r\n";
/// let parser = FormParser::new(ParseLimits::default()).spool_with(memory_spool);
///
/// let params = parser
///     .parse(
///         Some("multipart/form-data; boundary=B"),
///         Some(body.len() as u64),
///         Some(ReaderSource::new(body.as_bytes())),
///     )
///     .unwrap();
///
/// let user = params.get("user").and_then(|u| u.as_map()).unwrap();
/// assert_eq!(user.get("name").and_then(|n| n.as_str()), Some("Jo"));
/// ```
#[derive(Clone)]
pub struct FormParser {
    limits: ParseLimits,
    default_charset: String,
    separators: String,
    spool_factory: Arc<dyn SpoolFactory>,
    registry: Option<TempFileRegistry>,
}

impl FormParser {
    pub fn new(limits: ParseLimits) -> FormParser {
        FormParser {
            limits,
            default_charset: constants::DEFAULT_CHARSET.to_owned(),
            separators: "&".to_owned(),
            spool_factory: Arc::new(spool::disk_spool),
            registry: None,
        }
    }

    /// Charset for text parts that declare none. A `_charset_` field in the
    /// body overrides it.
    pub fn default_charset(mut self, charset: &str) -> FormParser {
        self.default_charset = charset.to_owned();
        self
    }

    /// Separator characters for urlencoded bodies.
    pub fn separators(mut self, separators: &str) -> FormParser {
        self.separators = separators.to_owned();
        self
    }

    /// Uses `factory` to create the spool of every file part.
    pub fn spool_with<F: SpoolFactory + 'static>(mut self, factory: F) -> FormParser {
        self.spool_factory = Arc::new(factory);
        self
    }

    /// Records every spool opened while parsing in `registry`.
    pub fn track_spools(mut self, registry: TempFileRegistry) -> FormParser {
        self.registry = Some(registry);
        self
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    /// Parses a body according to its content type.
    pub fn parse<S: ByteSource>(
        &self,
        content_type: Option<&str>,
        content_length: Option<u64>,
        source: Option<S>,
    ) -> crate::Result<Params> {
        let content_type = match content_type {
            Some(content_type) => content_type,
            None => return Ok(Params::new()),
        };

        let mime = match content_type.parse::<mime::Mime>() {
            Ok(mime) => mime,
            Err(err) => {
                log::debug!("not parsing body with content type {:?}: {}", content_type, err);
                return Ok(Params::new());
            }
        };

        if mime.type_() == mime::APPLICATION && mime.subtype() == mime::WWW_FORM_URLENCODED {
            self.parse_urlencoded(content_length, source)
        } else if mime.type_() == mime::MULTIPART {
            self.parse_multipart(content_type, content_length, source)
        } else {
            Ok(Params::new())
        }
    }

    /// Parses a `multipart/*` body.
    ///
    /// A declared length of zero yields an empty map without touching the
    /// source; any other length with no source is
    /// [`MissingInput`](crate::Error::MissingInput).
    pub fn parse_multipart<S: ByteSource>(
        &self,
        content_type: &str,
        content_length: Option<u64>,
        source: Option<S>,
    ) -> crate::Result<Params> {
        let source = match self.open(content_length, source)? {
            Some(source) => source,
            None => return Ok(Params::new()),
        };

        let boundary = crate::parse_boundary(content_type)?;

        let mut multipart = Multipart::with_limits(source, boundary, self.limits.clone())?
            .spool_factory(Arc::clone(&self.spool_factory));
        if let Some(registry) = &self.registry {
            multipart = multipart.track_spools(registry.clone());
        }

        self.parse_parts(multipart)
    }

    /// Reads every part and folds them into a parameter tree.
    pub fn parse_parts<S: ByteSource>(&self, multipart: Multipart<S>) -> crate::Result<Params> {
        let parts = multipart.collect::<crate::Result<Vec<Part>>>()?;
        let charset = self.body_charset(&parts);
        let parser = QueryParser::new(self.limits.clone());

        let mut params = Params::new();
        for part in parts {
            let name = part.name().to_owned();
            parser.normalize_params(&mut params, &name, part.into_value(&charset))?;
        }

        log::debug!("parsed multipart body into {} params", params.len());
        Ok(params)
    }

    /// Parses an `application/x-www-form-urlencoded` body.
    pub fn parse_urlencoded<S: ByteSource>(&self, content_length: Option<u64>, source: Option<S>) -> crate::Result<Params> {
        let source = match self.open(content_length, source)? {
            Some(source) => source,
            None => return Ok(Params::new()),
        };

        let mut buffer = StreamBuffer::new(source, self.limits.chunk_size);
        let body = buffer.read_to_end(self.limits.max_query_bytesize)?;

        QueryParser::new(self.limits.clone())
            .with_separators(&self.separators)
            .parse_nested_query(&body)
    }

    fn open<S: ByteSource>(
        &self,
        content_length: Option<u64>,
        source: Option<S>,
    ) -> crate::Result<Option<BoundedSource<S>>> {
        if content_length == Some(0) {
            return Ok(None);
        }

        match source {
            Some(source) => Ok(Some(BoundedSource::new(source, content_length.unwrap_or(u64::MAX)))),
            None => Err(crate::Error::MissingInput),
        }
    }

    fn body_charset(&self, parts: &[Part]) -> String {
        let declared = parts
            .iter()
            .filter(|part| !part.is_file() && part.name() == constants::CHARSET_FIELD_NAME)
            .filter_map(|part| part.text().ok())
            .map(|charset| charset.trim().to_owned())
            .last();

        match declared {
            Some(charset) if Encoding::for_label(charset.as_bytes()).is_some() => charset,
            Some(charset) => {
                log::debug!("ignoring unknown {} {:?}", constants::CHARSET_FIELD_NAME, charset);
                self.default_charset.clone()
            }
            None => self.default_charset.clone(),
        }
    }
}

impl Default for FormParser {
    fn default() -> Self {
        FormParser::new(ParseLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Param, Value};
    use crate::source::ReaderSource;

    fn reader(body: &'static str) -> Option<ReaderSource<&'static [u8]>> {
        Some(ReaderSource::new(body.as_bytes()))
    }

    #[test]
    fn test_urlencoded_body() {
        let parser = FormParser::default();
        let params = parser
            .parse(Some("application/x-www-form-urlencoded"), None, reader("a[]=1&a[]=2&b=x+y"))
            .unwrap();

        assert_eq!(params.get("a").and_then(Param::as_list).map(|l| l.len()), Some(2));
        assert_eq!(params.get("b").and_then(Param::as_str), Some("x y"));
    }

    #[test]
    fn test_urlencoded_respects_content_length() {
        let params = FormParser::default()
            .parse_urlencoded(Some(3), reader("a=1&b=2"))
            .unwrap();
        assert_eq!(params.get("a").and_then(Param::as_str), Some("1"));
        assert!(params.get("b").is_none());
    }

    #[test]
    fn test_urlencoded_size_limit() {
        let parser = FormParser::new(ParseLimits::new().query_bytesize(4));
        let err = parser.parse_urlencoded(None, reader("a=123456")).unwrap_err();
        assert!(matches!(err, crate::Error::QueryLimitExceeded { what: "query size", .. }));
    }

    #[test]
    fn test_zero_length_and_missing_input() {
        let parser = FormParser::default();
        let none: Option<ReaderSource<&[u8]>> = None;

        let params = parser
            .parse(Some("multipart/form-data; boundary=X"), Some(0), none)
            .unwrap();
        assert!(params.is_empty());

        let none: Option<ReaderSource<&[u8]>> = None;
        let err = parser
            .parse(Some("multipart/form-data; boundary=X"), Some(10), none)
            .unwrap_err();
        assert_eq!(err, crate::Error::MissingInput);
    }

    #[test]
    fn test_other_content_types_are_ignored() {
        let parser = FormParser::default();
        assert!(parser.parse(Some("application/json"), None, reader("{}")).unwrap().is_empty());
        assert!(parser.parse::<ReaderSource<&[u8]>>(None, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_charset_field_sets_default() {
        let mut body = b"--X\r\nContent-Disposition: form-data; name=\"_charset_\"\r\n\r\niso-8859-1\r\n".to_vec();
        body.extend_from_slice(b"--X\r\nContent-Disposition: form-data; name=\"word\"\r\n\r\ncaf\xe9\r\n--X--\r\n");

        let params = FormParser::default()
            .parse(Some("multipart/form-data; boundary=X"), None, Some(ReaderSource::new(&body[..])))
            .unwrap();

        assert_eq!(params.get("word").and_then(Param::as_str), Some("caf\u{e9}"));
        assert_eq!(params.get("_charset_").and_then(Param::as_str), Some("iso-8859-1"));
    }

    #[test]
    fn test_invalid_text_is_binary() {
        let mut body = b"--X\r\nContent-Disposition: form-data; name=\"raw\"\r\n\r\n".to_vec();
        body.extend_from_slice(b"\xff\xfe");
        body.extend_from_slice(b"\r\n--X--\r\n");

        let params = FormParser::default()
            .parse(Some("multipart/form-data; boundary=X"), None, Some(ReaderSource::new(&body[..])))
            .unwrap();

        assert_eq!(
            params.get("raw").and_then(Param::as_value),
            Some(&Value::Binary(bytes::Bytes::from_static(b"\xff\xfe")))
        );
    }
}
