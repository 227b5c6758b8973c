use std::fmt::{self, Debug, Display, Formatter};

use derive_more::Display;
use http::StatusCode;

use crate::params::ParamKind;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A set of errors that can occur while parsing a multipart stream, a query
/// string or while building nested parameters.
///
/// Every variant is fatal for the parse that produced it; a caller either gets
/// a complete result or one of these.
#[derive(Display)]
#[non_exhaustive]
pub enum Error {
    /// The declared boundary is longer than the protocol allows.
    #[display(fmt = "multipart boundary is {} bytes, the limit is {} bytes", len, limit)]
    BoundaryTooLong { len: usize, limit: usize },

    /// A body was announced but no input source was supplied.
    #[display(fmt = "missing input stream")]
    MissingInput,

    /// Data other than whitespace was found before the first boundary, or the
    /// body held no multipart content at all.
    #[display(fmt = "bad content body: no multipart boundary found where one was required")]
    EmptyContent,

    /// The source ran dry before a boundary or a header terminator was found.
    #[display(fmt = "unexpected end of input in multipart stream")]
    UnexpectedEndOfInput,

    /// Too many file parts in one body.
    #[display(fmt = "maximum file multiparts in content reached ({})", limit)]
    PartLimitExceeded { limit: usize },

    /// Too many parts (fields and files together) in one body.
    #[display(fmt = "maximum total multiparts in content reached ({})", limit)]
    TotalPartLimitExceeded { limit: usize },

    /// A parameter key nests deeper than allowed.
    #[display(fmt = "parameter nesting exceeds the depth limit ({})", limit)]
    ParamsTooDeep { limit: usize },

    /// The same key path was used as two different kinds of value.
    #[display(fmt = "expected {} (got {}) for param `{}'", expected, actual, param)]
    ParameterType {
        param: String,
        expected: ParamKind,
        actual: ParamKind,
    },

    /// A query string was too large or carried too many pairs.
    #[display(fmt = "total {} ({}) exceeds limit ({})", what, actual, limit)]
    QueryLimitExceeded {
        what: &'static str,
        actual: usize,
        limit: usize,
    },

    /// Malformed percent-encoding in a key or value.
    #[display(fmt = "invalid %-encoding ({})", _0)]
    InvalidParameter(String),

    /// A part's header block did not end within the configured size.
    #[display(fmt = "multipart part header exceeds the size limit: {} bytes", limit)]
    HeaderTooLarge { limit: usize },

    /// In-memory (non-file) part data exceeded the configured size.
    #[display(fmt = "multipart buffered data exceeds the size limit: {} bytes", limit)]
    BufferedUploadTooLarge { limit: usize },

    /// Failed to read headers.
    #[display(fmt = "failed to read part headers: {}", _0)]
    ReadHeaderFailed(httparse::Error),

    /// Failed to decode a part's raw header name to
    /// [`HeaderName`](http::header::HeaderName) type.
    #[display(fmt = "failed to decode part's raw header name: {:?} {}", name, cause)]
    DecodeHeaderName { name: String, cause: BoxError },

    /// Failed to decode a part's raw header value to
    /// [`HeaderValue`](http::header::HeaderValue) type.
    #[display(fmt = "failed to decode part's raw header value: {}", cause)]
    DecodeHeaderValue { value: Vec<u8>, cause: BoxError },

    /// Reading from the byte source failed.
    #[display(fmt = "stream read failed: {}", _0)]
    StreamReadFailed(BoxError),

    /// Creating, writing or closing a spool failed.
    #[display(fmt = "failed to spool upload: {}", _0)]
    SpoolFailed(std::io::Error),

    /// The `Content-Type` is not a `multipart/*` type.
    #[display(fmt = "Content-Type is not multipart")]
    NoMultipart,

    /// Failed to convert the `Content-Type` to [`mime::Mime`] type.
    #[display(fmt = "Failed to convert Content-Type to `mime::Mime` type: {}", _0)]
    DecodeContentType(mime::FromStrError),

    /// No boundary found in `Content-Type` header.
    #[display(fmt = "multipart boundary not found in Content-Type")]
    NoBoundary,

    /// Failed to decode the part data as `JSON` in
    /// [`part.json()`](crate::Part::json) method.
    #[cfg(feature = "json")]
    #[display(fmt = "failed to decode part data as JSON: {}", _0)]
    DecodeJson(serde_json::Error),
}

impl Error {
    /// The HTTP status a server would answer with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BoundaryTooLong { .. }
            | Error::PartLimitExceeded { .. }
            | Error::TotalPartLimitExceeded { .. }
            | Error::QueryLimitExceeded { .. }
            | Error::HeaderTooLarge { .. }
            | Error::BufferedUploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NoMultipart | Error::DecodeContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::StreamReadFailed(_) | Error::SpoolFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the error is the client's fault rather than a local I/O failure.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ReadHeaderFailed(err) => Some(err),
            Error::SpoolFailed(err) => Some(err),
            Error::DecodeContentType(err) => Some(err),
            Error::StreamReadFailed(err) => Some(err.as_ref()),
            #[cfg(feature = "json")]
            Error::DecodeJson(err) => Some(err),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string().eq(&other.to_string())
    }
}

impl Eq for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_type_message_names_segment() {
        let err = Error::ParameterType {
            param: "y".to_owned(),
            expected: ParamKind::Map,
            actual: ParamKind::Scalar,
        };
        assert_eq!(err.to_string(), "expected Map (got Scalar) for param `y'");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::BoundaryTooLong { len: 71, limit: 70 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(Error::EmptyContent.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::InvalidParameter("a%".to_owned()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert!(!Error::SpoolFailed(std::io::ErrorKind::Other.into()).is_client_error());
        assert!(Error::UnexpectedEndOfInput.is_client_error());
    }

    #[test]
    fn test_errors_compare_by_message() {
        assert_eq!(Error::PartLimitExceeded { limit: 3 }, Error::PartLimitExceeded { limit: 3 });
        assert_ne!(Error::PartLimitExceeded { limit: 3 }, Error::PartLimitExceeded { limit: 4 });
    }
}
