use crate::constants;

/// Resource bounds applied to a single parse, to keep a hostile client from
/// exhausting memory, disk or CPU.
///
/// A zero value means "unlimited" for every field except `max_param_depth`
/// and `chunk_size`. The boundary cap is fixed at
/// [`ParseLimits::MAX_BOUNDARY_LENGTH`].
///
/// Limits are read once when a parse starts. To use different limits for one
/// call, build a new value and pass it in; nothing here is global.
///
/// # Examples
///
/// ```
/// use multiform::ParseLimits;
///
/// let limits = ParseLimits::new().part_count(3).param_depth(8);
/// assert_eq!(limits.max_part_count, 3);
/// assert_eq!(limits.max_param_depth, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLimits {
    /// Maximum number of file parts in one body.
    pub max_part_count: usize,
    /// Maximum number of parts (fields and files) in one body.
    pub max_total_part_count: usize,
    /// Maximum number of key segments in one parameter name.
    pub max_param_depth: usize,
    /// Maximum size in bytes of a raw query string.
    pub max_query_bytesize: usize,
    /// Maximum number of pairs in a query string.
    pub max_query_pairs: usize,
    /// Maximum size in bytes of one part's header block.
    pub max_header_bytes: usize,
    /// Maximum number of bytes held in memory for non-file parts.
    pub max_buffered_bytes: usize,
    /// Size of each read issued to the byte source.
    pub chunk_size: usize,
}

impl ParseLimits {
    /// Creates the default limits.
    pub fn new() -> ParseLimits {
        ParseLimits::default()
    }

    /// Creates the default limits, overridden by any `MULTIFORM_*` environment
    /// variables that hold a valid number.
    pub fn from_env() -> ParseLimits {
        ParseLimits::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](ParseLimits::from_env) but reads values through
    /// `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> ParseLimits
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut limits = ParseLimits::default();

        let fields: [(&str, &mut usize); 7] = [
            ("MULTIFORM_FILE_LIMIT", &mut limits.max_part_count),
            ("MULTIFORM_TOTAL_PART_LIMIT", &mut limits.max_total_part_count),
            ("MULTIFORM_PARAM_DEPTH_LIMIT", &mut limits.max_param_depth),
            ("MULTIFORM_QUERY_BYTESIZE_LIMIT", &mut limits.max_query_bytesize),
            ("MULTIFORM_QUERY_PARAMS_LIMIT", &mut limits.max_query_pairs),
            ("MULTIFORM_HEADER_BYTESIZE_LIMIT", &mut limits.max_header_bytes),
            (
                "MULTIFORM_BUFFERED_UPLOAD_BYTESIZE_LIMIT",
                &mut limits.max_buffered_bytes,
            ),
        ];

        for (key, slot) in fields {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<usize>() {
                    Ok(value) => *slot = value,
                    Err(err) => log::warn!("ignoring {}={:?}: {}", key, raw, err),
                }
            }
        }

        limits
    }

    /// Sets the maximum number of file parts.
    pub fn part_count(mut self, limit: usize) -> ParseLimits {
        self.max_part_count = limit;
        self
    }

    /// Sets the maximum number of parts of any kind.
    pub fn total_part_count(mut self, limit: usize) -> ParseLimits {
        self.max_total_part_count = limit;
        self
    }

    /// Sets the maximum key nesting depth.
    pub fn param_depth(mut self, limit: usize) -> ParseLimits {
        self.max_param_depth = limit;
        self
    }

    /// Sets the maximum raw query string size.
    pub fn query_bytesize(mut self, limit: usize) -> ParseLimits {
        self.max_query_bytesize = limit;
        self
    }

    /// Sets the maximum number of query pairs.
    pub fn query_pairs(mut self, limit: usize) -> ParseLimits {
        self.max_query_pairs = limit;
        self
    }

    /// Sets the maximum size of one part's header block.
    pub fn header_bytes(mut self, limit: usize) -> ParseLimits {
        self.max_header_bytes = limit;
        self
    }

    /// Sets the maximum in-memory size of non-file parts.
    ///
    /// It is useful to avoid an attacker running the server out of memory with
    /// huge textual fields, which are never spooled to disk.
    pub fn buffered_bytes(mut self, limit: usize) -> ParseLimits {
        self.max_buffered_bytes = limit;
        self
    }

    /// Sets the read size. Values below 1 are raised to 1.
    pub fn chunk_size(mut self, size: usize) -> ParseLimits {
        self.chunk_size = size.max(1);
        self
    }

    /// Longest boundary accepted, 70 bytes per RFC 2046.
    pub const MAX_BOUNDARY_LENGTH: usize = constants::MAX_BOUNDARY_LEN;

    pub(crate) fn exceeds(limit: usize, count: usize) -> bool {
        limit > 0 && count > limit
    }
}

impl Default for ParseLimits {
    fn default() -> Self {
        ParseLimits {
            max_part_count: constants::DEFAULT_FILE_PART_LIMIT,
            max_total_part_count: constants::DEFAULT_TOTAL_PART_LIMIT,
            max_param_depth: constants::DEFAULT_PARAM_DEPTH_LIMIT,
            max_query_bytesize: constants::DEFAULT_QUERY_BYTESIZE_LIMIT,
            max_query_pairs: constants::DEFAULT_QUERY_PAIRS_LIMIT,
            max_header_bytes: constants::DEFAULT_HEADER_BYTESIZE_LIMIT,
            max_buffered_bytes: constants::DEFAULT_BUFFERED_UPLOAD_BYTESIZE_LIMIT,
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
        }
    }
}
