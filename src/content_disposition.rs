use http::header::{self, HeaderMap, HeaderName};

use crate::header_params::{parse_header_params, HeaderParams};
use crate::helpers;

pub(crate) struct ContentDisposition {
    pub(crate) field_name: Option<String>,
    pub(crate) file_name: Option<String>,
}

impl ContentDisposition {
    pub fn parse(headers: &HeaderMap) -> ContentDisposition {
        let params = headers
            .get(header::CONTENT_DISPOSITION)
            .map(|val| parse_header_params(val.as_bytes()))
            .unwrap_or_default();

        let field_name = params.get("name").map(|name| name.to_owned());
        let file_name = Self::file_name(&params);

        ContentDisposition { field_name, file_name }
    }

    // `filename*` is already charset-decoded, so it skips the escape decoding
    // applied to plain `filename`.
    fn file_name(params: &HeaderParams) -> Option<String> {
        if let Some(extended) = params.get("filename*") {
            return Some(helpers::sanitize_filename(extended, false));
        }

        params.get("filename").map(|raw| helpers::sanitize_filename(raw, true))
    }
}

/// The metadata the scanner needs about one part, read from its headers.
pub(crate) struct PartMeta {
    pub(crate) name: String,
    pub(crate) file_name: Option<String>,
    pub(crate) content_type: Option<String>,
}

impl PartMeta {
    /// Resolves the field name, falling back to `Content-ID`, then the
    /// filename, then the part's content type.
    pub fn from_headers(headers: &HeaderMap) -> PartMeta {
        let disposition = ContentDisposition::parse(headers);
        let content_type = header_text(headers, &header::CONTENT_TYPE);

        let name = disposition
            .field_name
            .filter(|name| !name.is_empty())
            .or_else(|| header_text(headers, &HeaderName::from_static("content-id")))
            .or_else(|| disposition.file_name.clone().filter(|f| !f.is_empty()))
            .or_else(|| content_type.clone())
            .unwrap_or_else(|| crate::constants::DEFAULT_PART_CONTENT_TYPE.to_owned());

        PartMeta {
            name,
            file_name: disposition.file_name,
            content_type,
        }
    }
}

fn header_text(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|val| String::from_utf8_lossy(val.as_bytes()).trim().to_owned())
        .filter(|val| !val.is_empty())
}
