use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use http::header::HeaderMap;
#[cfg(feature = "json")]
use serde::de::DeserializeOwned;

use crate::constants;
use crate::params::{UploadedFile, Value};
use crate::spool::SpoolHandle;

/// Where a part's body ended up.
#[derive(Debug, Clone)]
pub enum PartBody {
    /// A plain field, held in memory.
    Memory(Bytes),
    /// A file upload, streamed into a spool.
    Spooled(SpoolHandle),
}

/// A single part of a multipart body, fully read.
///
/// Parts carrying a filename are spooled; their body is a [`SpoolHandle`]
/// that was closed for writing when the part's closing boundary was seen.
/// Every other part is kept in memory.
#[derive(Debug, Clone)]
pub struct Part {
    pub(crate) name: String,
    pub(crate) file_name: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) head: String,
    pub(crate) body: PartBody,
    pub(crate) idx: usize,
}

impl Part {
    /// The field name.
    ///
    /// Without a `name` disposition parameter this falls back to the
    /// `Content-ID` header, then the filename, then the content type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sanitized filename, without any directory component.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// The raw `Content-Type` header value.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The `Content-Type` parsed as a [`mime::Mime`], when it is valid.
    pub fn mime(&self) -> Option<mime::Mime> {
        self.content_type.as_ref().and_then(|ct| ct.parse().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The header block exactly as received, without the blank line.
    pub fn head(&self) -> &str {
        &self.head
    }

    /// Position of the part in the body, counting from 0. Parts skipped for
    /// having an empty filename still take up an index.
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn body(&self) -> &PartBody {
        &self.body
    }

    pub fn is_file(&self) -> bool {
        matches!(self.body, PartBody::Spooled(_))
    }

    /// The spool backing a file part.
    pub fn spool(&self) -> Option<&SpoolHandle> {
        match &self.body {
            PartBody::Spooled(spool) => Some(spool),
            PartBody::Memory(_) => None,
        }
    }

    /// The whole body. For a file part this reads the spool back.
    pub fn bytes(&self) -> crate::Result<Bytes> {
        match &self.body {
            PartBody::Memory(bytes) => Ok(bytes.clone()),
            PartBody::Spooled(spool) => spool.read_to_vec().map(Bytes::from).map_err(crate::Error::SpoolFailed),
        }
    }

    /// The body decoded as text using the part's charset, or UTF-8. Invalid
    /// sequences are replaced.
    pub fn text(&self) -> crate::Result<String> {
        self.text_with_charset(constants::DEFAULT_CHARSET)
    }

    /// Like [`text`](Part::text) with a different fallback charset for parts
    /// that do not declare one.
    pub fn text_with_charset(&self, default_encoding: &str) -> crate::Result<String> {
        let encoding = Encoding::for_label(self.charset(default_encoding).as_bytes()).unwrap_or(UTF_8);
        let bytes = self.bytes()?;

        let (text, _, _) = encoding.decode(&bytes);
        Ok(text.into_owned())
    }

    /// Decodes the body as JSON.
    ///
    /// # Optional
    ///
    /// This requires the optional `json` feature to be enabled.
    #[cfg(feature = "json")]
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        let bytes = self.bytes()?;
        serde_json::from_slice(&bytes).map_err(crate::Error::DecodeJson)
    }

    /// Converts the part into the value stored in the parameter tree.
    ///
    /// File parts become [`Value::File`]. Other parts are decoded with their
    /// declared charset, or `default_charset`; data that is not valid in that
    /// charset, or a charset nobody knows, gives [`Value::Binary`].
    pub fn into_value(self, default_charset: &str) -> Value {
        let charset = self.charset(default_charset).into_owned();

        match self.body {
            PartBody::Spooled(tempfile) => Value::File(UploadedFile {
                name: self.name,
                filename: self.file_name.unwrap_or_default(),
                content_type: self.content_type,
                head: self.head,
                tempfile,
            }),
            PartBody::Memory(bytes) => decode_field(bytes, &charset),
        }
    }

    fn charset<'a>(&self, default_charset: &'a str) -> std::borrow::Cow<'a, str> {
        match self.mime().and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_owned())) {
            Some(charset) => charset.into(),
            None => default_charset.into(),
        }
    }
}

fn decode_field(bytes: Bytes, charset: &str) -> Value {
    let encoding = match Encoding::for_label(charset.as_bytes()) {
        Some(encoding) => encoding,
        None => {
            log::debug!("unknown charset {:?}, keeping field as binary", charset);
            return Value::Binary(bytes);
        }
    };

    match encoding.decode_without_bom_handling_and_without_replacement(&bytes) {
        Some(text) => Value::Text(text.into_owned()),
        None => Value::Binary(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_part(content_type: Option<&str>, body: &'static [u8]) -> Part {
        Part {
            name: "f".to_owned(),
            file_name: None,
            content_type: content_type.map(str::to_owned),
            headers: HeaderMap::new(),
            head: String::new(),
            body: PartBody::Memory(Bytes::from_static(body)),
            idx: 0,
        }
    }

    #[test]
    fn test_declared_charset_is_used() {
        let part = memory_part(Some("text/plain; charset=iso-8859-1"), b"caf\xe9");
        assert_eq!(part.clone().into_value("utf-8"), Value::Text("café".to_owned()));
        assert_eq!(part.text().unwrap(), "café");
    }

    #[test]
    fn test_default_charset_applies_without_declaration() {
        let part = memory_part(None, b"caf\xe9");
        assert_eq!(part.clone().into_value("windows-1252"), Value::Text("café".to_owned()));
        assert_eq!(
            part.into_value("utf-8"),
            Value::Binary(Bytes::from_static(b"caf\xe9"))
        );
    }

    #[test]
    fn test_unknown_charset_is_binary() {
        let part = memory_part(Some("text/plain; charset=x-nonsense"), b"abc");
        assert_eq!(part.into_value("utf-8"), Value::Binary(Bytes::from_static(b"abc")));
    }

    #[test]
    fn test_file_part_becomes_uploaded_file() {
        let spool = SpoolHandle::new(crate::spool::memory_spool("a.txt", None).unwrap());
        let part = Part {
            name: "upload".to_owned(),
            file_name: Some("a.txt".to_owned()),
            content_type: Some("text/plain".to_owned()),
            headers: HeaderMap::new(),
            head: "Content-Type: text/plain".to_owned(),
            body: PartBody::Spooled(spool.clone()),
            idx: 1,
        };

        assert!(part.is_file());
        match part.into_value("utf-8") {
            Value::File(file) => {
                assert_eq!(file.filename, "a.txt");
                assert_eq!(file.content_type.as_deref(), Some("text/plain"));
                assert!(file.tempfile.ptr_eq(&spool));
            }
            other => panic!("expected a file, got {:?}", other),
        }
    }
}
