//! A streaming parser for `multipart/form-data` bodies and nested query
//! strings.
//!
//! Bodies are pulled from a [`ByteSource`] in bounded chunks. File uploads
//! are streamed into [spools](Spool) instead of memory, and every parse runs
//! under a set of [`ParseLimits`] that guard against hostile input.
//!
//! Keys in bracket notation (`user[langs][]`) build a nested [`Params`] tree,
//! both for query strings and for multipart field names.
//!
//! # Examples
//!
//! ```
//! use multiform::{memory_spool, FormParser, Param, ParseLimits, ReaderSource};
//!
//! # fn run() -> multiform::Result<()> {
//! let body = "--AaB03x\r\n\
//!     Content-Disposition: form-data; name=\"reply\"\r\n\r\n\
//!     yes\r\n\
//!     --AaB03x\r\n\
//!     Content-Disposition: form-data; name=\"upload\"; filename=\"notes.txt\"\r\n\
//!     Content-Type: text/plain\r\n\r\n\
//!     some notes\r\n\
//!     --AaB03x--\r\n";
//!
//! let parser = FormParser::new(ParseLimits::from_env()).spool_with(memory_spool);
//! let params = parser.parse(
//!     Some("multipart/form-data; boundary=AaB03x"),
//!     Some(body.len() as u64),
//!     Some(ReaderSource::new(body.as_bytes())),
//! )?;
//!
//! assert_eq!(params.get("reply").and_then(Param::as_str), Some("yes"));
//!
//! let upload = params.get("upload").and_then(Param::as_file).unwrap();
//! assert_eq!(upload.filename, "notes.txt");
//! assert_eq!(upload.size(), 10);
//! # Ok(())
//! # }
//! # run().unwrap();
//! ```
//!
//! Query strings go through [`QueryParser`]:
//!
//! ```
//! use multiform::{parse_nested_query, Param};
//!
//! let params = parse_nested_query("x[y][][z]=1&x[y][][w]=2").unwrap();
//! let list = params.get("x").and_then(|x| x.get_path(&["y"])).and_then(Param::as_list).unwrap();
//! assert_eq!(list.len(), 1);
//! ```
//!
//! # Optional features
//!
//! **`json`**: adds [`Part::json`] and `serde::Serialize` for the parameter
//! tree.
//!
//! **`all`**: enables every feature.

pub use bytes;

pub use error::Error;
pub use form::FormParser;
pub use header_params::{parse_header_params, HeaderParams};
pub use limits::ParseLimits;
pub use multipart::Multipart;
pub use nested::{normalize_params, params_hash_has_key};
pub use params::{Param, ParamKind, Params, UploadedFile, Value};
pub use part::{Part, PartBody};
pub use query::{build_nested_query, build_query, escape, parse_nested_query, parse_query, unescape, QueryParser};
pub use source::{BoundedSource, ByteSource, ChunkSource, ReaderSource};
pub use spool::{disk_spool, memory_spool, DiskSpool, MemorySpool, Spool, SpoolFactory, SpoolHandle, TempFileRegistry};

mod buffer;
mod constants;
mod content_disposition;
mod error;
mod form;
mod header_params;
mod helpers;
mod limits;
mod multipart;
mod nested;
mod params;
mod part;
mod query;
mod source;
mod spool;
mod state;

/// A Result type often returned from methods that can have `multiform` errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Parses the `Content-Type` header to extract the boundary value.
///
/// Any `multipart/*` type is accepted. The boundary must be non-empty and at
/// most 70 bytes long.
pub fn parse_boundary<T: AsRef<str>>(content_type: T) -> crate::Result<String> {
    let m = content_type
        .as_ref()
        .parse::<mime::Mime>()
        .map_err(crate::Error::DecodeContentType)?;

    if m.type_() != mime::MULTIPART {
        return Err(crate::Error::NoMultipart);
    }

    let boundary = m
        .get_param(mime::BOUNDARY)
        .map(|name| name.as_str().to_owned())
        .filter(|name| !name.is_empty())
        .ok_or(crate::Error::NoBoundary)?;

    if boundary.len() > constants::MAX_BOUNDARY_LEN {
        log::warn!("rejecting multipart boundary of {} bytes", boundary.len());
        return Err(crate::Error::BoundaryTooLong {
            len: boundary.len(),
            limit: constants::MAX_BOUNDARY_LEN,
        });
    }

    Ok(boundary)
}
