pub(crate) const MAX_BOUNDARY_LEN: usize = 70;

pub(crate) const DEFAULT_FILE_PART_LIMIT: usize = 128;
pub(crate) const DEFAULT_TOTAL_PART_LIMIT: usize = 4096;
pub(crate) const DEFAULT_PARAM_DEPTH_LIMIT: usize = 32;
pub(crate) const DEFAULT_QUERY_BYTESIZE_LIMIT: usize = 4 * 1024 * 1024;
pub(crate) const DEFAULT_QUERY_PAIRS_LIMIT: usize = 4096;
pub(crate) const DEFAULT_HEADER_BYTESIZE_LIMIT: usize = 64 * 1024;
pub(crate) const DEFAULT_BUFFERED_UPLOAD_BYTESIZE_LIMIT: usize = 16 * 1024 * 1024;
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

pub(crate) const MAX_HEADERS: usize = 32;

// Header parameter lexing stops after this many `;` segments or bytes.
pub(crate) const MAX_HEADER_PARAM_SEGMENTS: usize = 16;
pub(crate) const MAX_HEADER_PARAM_BYTES: usize = 1536;

pub(crate) const BOUNDARY_EXT: &str = "--";
pub(crate) const CRLF: &str = "\r\n";
pub(crate) const CRLF_CRLF: &str = "\r\n\r\n";

pub(crate) const DEFAULT_CHARSET: &str = "utf-8";
pub(crate) const DEFAULT_PART_CONTENT_TYPE: &str = "text/plain";
pub(crate) const CHARSET_FIELD_NAME: &str = "_charset_";

pub(crate) const SPOOL_PREFIX: &str = "multiform";
pub(crate) const MAX_SPOOL_SUFFIX_LEN: usize = 16;

pub(crate) fn is_transport_padding(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_sane() {
        assert!(DEFAULT_FILE_PART_LIMIT < DEFAULT_TOTAL_PART_LIMIT);
        assert!(DEFAULT_CHUNK_SIZE > MAX_BOUNDARY_LEN + CRLF_CRLF.len());
        assert_eq!(BOUNDARY_EXT.len() + CRLF.len(), 4);
    }

    #[test]
    fn test_transport_padding() {
        assert!(is_transport_padding(b' '));
        assert!(is_transport_padding(b'\t'));
        assert!(!is_transport_padding(b'\r'));
        assert!(!is_transport_padding(b'-'));
    }
}
