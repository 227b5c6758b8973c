use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::HeaderMap;

use crate::buffer::StreamBuffer;
use crate::constants;
use crate::content_disposition::PartMeta;
use crate::helpers;
use crate::limits::ParseLimits;
use crate::part::{Part, PartBody};
use crate::source::ByteSource;
use crate::spool::{self, SpoolFactory, SpoolHandle, TempFileRegistry};
use crate::state::{MultipartState, StreamingStage};

/// Represents the implementation of `multipart/form-data` formatted data.
///
/// This will parse the source into [`Part`] instances, one at a time, via
/// [`next_part`](Multipart::next_part) or its [`Iterator`] implementation.
/// Parts with a filename are streamed into a spool as they are read; other
/// parts are buffered in memory.
///
/// Parsing is single pass: once the final boundary has been read, or an
/// error was returned, every later call yields nothing. On error, every
/// spool opened so far is closed before the error is returned.
///
/// # Examples
///
/// ```
/// use multiform::{ChunkSource, Multipart};
/// use std::convert::Infallible;
///
/// # fn run() -> multiform::Result<()> {
/// let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"my_text_field\"\r\n\r\nabcd\r\n--X-BOUNDARY--\r\n";
/// let source = ChunkSource::new(vec![Ok::<_, Infallible>(data)]);
/// let mut multipart = Multipart::new(source, "X-BOUNDARY")?;
///
/// while let Some(part) = multipart.next_part()? {
///     println!("{}: {:?}", part.name(), part.text()?);
/// }
/// # Ok(())
/// # }
/// # run().unwrap();
/// ```
pub struct Multipart<S> {
    state: MultipartState<S>,
    limits: ParseLimits,
    spool_factory: Arc<dyn SpoolFactory>,
    registry: Option<TempFileRegistry>,
}

struct PendingPart {
    meta: PartMeta,
    headers: HeaderMap,
    head: String,
    idx: usize,
    sink: PartSink,
}

enum PartSink {
    Memory(BytesMut),
    Spool(SpoolHandle),
    /// `filename=""`: no file was selected, the body is dropped.
    Discard,
}

impl<S: ByteSource> Multipart<S> {
    /// Construct a new `Multipart` instance with the given source and
    /// boundary, using the default limits.
    pub fn new<B: Into<String>>(source: S, boundary: B) -> crate::Result<Multipart<S>> {
        Multipart::with_limits(source, boundary, ParseLimits::default())
    }

    /// Construct a new `Multipart` instance with the given source, boundary
    /// and limits.
    ///
    /// The boundary is validated here, before the source is touched.
    pub fn with_limits<B: Into<String>>(source: S, boundary: B, limits: ParseLimits) -> crate::Result<Multipart<S>> {
        let boundary = boundary.into();

        if boundary.is_empty() {
            return Err(crate::Error::NoBoundary);
        }

        if boundary.len() > ParseLimits::MAX_BOUNDARY_LENGTH {
            log::warn!("rejecting multipart boundary of {} bytes", boundary.len());
            return Err(crate::Error::BoundaryTooLong {
                len: boundary.len(),
                limit: ParseLimits::MAX_BOUNDARY_LENGTH,
            });
        }

        let state = MultipartState {
            buffer: StreamBuffer::new(source, limits.chunk_size),
            boundary,
            stage: StreamingStage::SeekingFirstBoundary,
            next_part_idx: 0,
            total_parts: 0,
            file_parts: 0,
            buffered_bytes: 0,
            open_spools: Vec::new(),
        };

        Ok(Multipart {
            state,
            limits,
            spool_factory: Arc::new(spool::disk_spool),
            registry: None,
        })
    }

    /// Uses `factory` to create the spool of every file part.
    ///
    /// # Examples
    ///
    /// ```
    /// use multiform::{memory_spool, ChunkSource, Multipart};
    /// use std::convert::Infallible;
    ///
    /// let data = "--X\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nhi\r\n--X--\r\n";
    /// let source = ChunkSource::new(vec![Ok::<_, Infallible>(data)]);
    /// let mut multipart = Multipart::new(source, "X").unwrap().spool_with(memory_spool);
    ///
    /// let part = multipart.next_part().unwrap().unwrap();
    /// assert_eq!(part.spool().unwrap().read_to_vec().unwrap(), b"hi");
    /// ```
    pub fn spool_with<F: SpoolFactory + 'static>(self, factory: F) -> Multipart<S> {
        self.spool_factory(Arc::new(factory))
    }

    /// Like [`spool_with`](Multipart::spool_with), for a factory that is
    /// already shared.
    pub fn spool_factory(mut self, factory: Arc<dyn SpoolFactory>) -> Multipart<S> {
        self.spool_factory = factory;
        self
    }

    /// Records every spool this parse opens in `registry`.
    pub fn track_spools(mut self, registry: TempFileRegistry) -> Multipart<S> {
        self.registry = Some(registry);
        self
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    pub fn boundary(&self) -> &str {
        &self.state.boundary
    }

    /// Number of bytes pulled from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.state.buffer.bytes_read
    }

    /// Yields the next [`Part`] if available.
    pub fn next_part(&mut self) -> crate::Result<Option<Part>> {
        if self.state.is_done() {
            return Ok(None);
        }

        match self.read_next_part() {
            Ok(Some(part)) => Ok(Some(part)),
            Ok(None) => {
                log::debug!(
                    "multipart body done: {} parts, {} bytes read",
                    self.state.next_part_idx,
                    self.state.buffer.bytes_read
                );
                Ok(None)
            }
            Err(err) => {
                self.abort(&err);
                Err(err)
            }
        }
    }

    fn read_next_part(&mut self) -> crate::Result<Option<Part>> {
        loop {
            match self.state.stage {
                StreamingStage::SeekingFirstBoundary => self.read_boundary(true)?,
                StreamingStage::ReadingBoundary => self.read_boundary(false)?,
                StreamingStage::DeterminingBoundaryType => self.determine_boundary_type()?,
                StreamingStage::ReadingTransportPadding => self.read_transport_padding()?,
                StreamingStage::ReadingPartHeaders => {
                    let pending = self.read_part_headers()?;
                    if let Some(part) = self.read_part_body(pending)? {
                        return Ok(Some(part));
                    }
                }
                // Bodies are read in the same step as their headers; a failed
                // body read moves the stream to `Failed`.
                StreamingStage::ReadingPartBody => unreachable!("part body read outside of its header step"),
                StreamingStage::Eof | StreamingStage::Failed => return Ok(None),
            }
        }
    }

    /// Consumes `"--" boundary`. Before the first one, leading whitespace is
    /// skipped and anything else is rejected.
    fn read_boundary(&mut self, first: bool) -> crate::Result<()> {
        let dash_boundary = self.state.dash_boundary();
        let buffer = &mut self.state.buffer;

        loop {
            if first {
                buffer.skip_while(|b| b.is_ascii_whitespace());
            }

            if buffer.buf.len() >= dash_boundary.len() {
                if !buffer.starts_with(&dash_boundary) {
                    return Err(crate::Error::EmptyContent);
                }

                drop(buffer.buf.split_to(dash_boundary.len()));
                self.state.stage = StreamingStage::DeterminingBoundaryType;
                return Ok(());
            }

            if !dash_boundary.starts_with(&buffer.buf) {
                return Err(crate::Error::EmptyContent);
            }

            if !buffer.fill()? {
                return if buffer.buf.is_empty() {
                    Err(crate::Error::EmptyContent)
                } else {
                    Err(crate::Error::UnexpectedEndOfInput)
                };
            }
        }
    }

    /// Tells a part boundary from the final `--` one.
    fn determine_boundary_type(&mut self) -> crate::Result<()> {
        let buffer = &mut self.state.buffer;

        while buffer.buf.len() < constants::BOUNDARY_EXT.len() {
            if !buffer.fill()? {
                return Err(crate::Error::UnexpectedEndOfInput);
            }
        }

        if buffer.starts_with(constants::BOUNDARY_EXT.as_bytes()) {
            drop(buffer.buf.split_to(constants::BOUNDARY_EXT.len()));
            log::debug!("found final boundary");
            self.state.stage = StreamingStage::Eof;
        } else {
            self.state.stage = StreamingStage::ReadingTransportPadding;
        }

        Ok(())
    }

    /// Skips spaces and tabs after a boundary, up to the line break.
    fn read_transport_padding(&mut self) -> crate::Result<()> {
        let buffer = &mut self.state.buffer;

        loop {
            buffer.skip_while(constants::is_transport_padding);

            if buffer.starts_with(constants::CRLF.as_bytes()) {
                drop(buffer.buf.split_to(constants::CRLF.len()));
                break;
            }

            if buffer.starts_with(b"\n") {
                drop(buffer.buf.split_to(1));
                break;
            }

            if !buffer.buf.is_empty() && &buffer.buf[..] != b"\r" {
                return Err(crate::Error::EmptyContent);
            }

            if !buffer.fill()? {
                return Err(crate::Error::UnexpectedEndOfInput);
            }
        }

        self.state.stage = StreamingStage::ReadingPartHeaders;
        Ok(())
    }

    fn read_part_headers(&mut self) -> crate::Result<PendingPart> {
        let header_limit = self.limits.max_header_bytes;
        let buffer = &mut self.state.buffer;

        let terminator = constants::CRLF_CRLF.as_bytes();
        let mut scanned = 0;

        let header_bytes = loop {
            if buffer.buf.len() >= constants::CRLF.len() {
                // An empty header block: the blank line follows the boundary line.
                if buffer.starts_with(constants::CRLF.as_bytes()) {
                    drop(buffer.buf.split_to(constants::CRLF.len()));
                    break Bytes::new();
                }

                if let Some(bytes) = buffer.read_until(terminator, scanned) {
                    break bytes;
                }

                // A terminator split across reads starts in the last 3 bytes.
                scanned = buffer.buf.len().saturating_sub(terminator.len() - 1);
            }

            if ParseLimits::exceeds(header_limit, buffer.buf.len()) {
                log::warn!("part header block exceeds {} bytes", header_limit);
                return Err(crate::Error::HeaderTooLarge { limit: header_limit });
            }

            if !buffer.fill()? {
                return Err(crate::Error::UnexpectedEndOfInput);
            }
        };

        if ParseLimits::exceeds(header_limit, header_bytes.len()) {
            log::warn!("part header block exceeds {} bytes", header_limit);
            return Err(crate::Error::HeaderTooLarge { limit: header_limit });
        }

        let headers = parse_headers(&header_bytes)?;
        let head = String::from_utf8_lossy(strip_blank_line(&header_bytes)).into_owned();

        let idx = self.state.next_part_idx;
        self.state.next_part_idx += 1;
        self.state.total_parts += 1;

        if ParseLimits::exceeds(self.limits.max_total_part_count, self.state.total_parts) {
            log::warn!("multipart body exceeds {} parts", self.limits.max_total_part_count);
            return Err(crate::Error::TotalPartLimitExceeded {
                limit: self.limits.max_total_part_count,
            });
        }

        let meta = PartMeta::from_headers(&headers);

        let sink = match meta.file_name.as_deref() {
            Some("") => PartSink::Discard,
            Some(file_name) => {
                self.state.file_parts += 1;

                if ParseLimits::exceeds(self.limits.max_part_count, self.state.file_parts) {
                    log::warn!("multipart body exceeds {} file parts", self.limits.max_part_count);
                    return Err(crate::Error::PartLimitExceeded {
                        limit: self.limits.max_part_count,
                    });
                }

                let spool = self
                    .spool_factory
                    .create(file_name, meta.content_type.as_deref())
                    .map_err(crate::Error::SpoolFailed)?;
                let spool = SpoolHandle::new(spool);

                self.state.open_spools.push(spool.clone());
                if let Some(registry) = &self.registry {
                    registry.record(spool.clone());
                }

                PartSink::Spool(spool)
            }
            None => PartSink::Memory(BytesMut::new()),
        };

        log::debug!("reading part {} `{}` (file: {:?})", idx, meta.name, meta.file_name);
        self.state.stage = StreamingStage::ReadingPartBody;

        Ok(PendingPart {
            meta,
            headers,
            head,
            idx,
            sink,
        })
    }

    /// Reads the body up to the next delimiter. Returns `None` for a part
    /// that is dropped.
    fn read_part_body(&mut self, mut pending: PendingPart) -> crate::Result<Option<Part>> {
        let delimiter = self.state.delimiter();

        loop {
            let (done, bytes) = match self.state.buffer.read_part_data(&delimiter) {
                Some(data) => data,
                None => {
                    if !self.state.buffer.fill()? {
                        return Err(crate::Error::UnexpectedEndOfInput);
                    }
                    continue;
                }
            };

            match &mut pending.sink {
                PartSink::Memory(buf) => {
                    self.state.buffered_bytes += bytes.len();
                    if ParseLimits::exceeds(self.limits.max_buffered_bytes, self.state.buffered_bytes) {
                        log::warn!("buffered multipart fields exceed {} bytes", self.limits.max_buffered_bytes);
                        return Err(crate::Error::BufferedUploadTooLarge {
                            limit: self.limits.max_buffered_bytes,
                        });
                    }
                    buf.extend_from_slice(&bytes);
                }
                PartSink::Spool(spool) => spool.write_all(&bytes).map_err(crate::Error::SpoolFailed)?,
                PartSink::Discard => {}
            }

            if done {
                break;
            }
        }

        self.state.stage = StreamingStage::ReadingBoundary;

        let body = match pending.sink {
            PartSink::Memory(buf) => PartBody::Memory(buf.freeze()),
            PartSink::Spool(spool) => {
                spool.close().map_err(crate::Error::SpoolFailed)?;
                self.state.open_spools.retain(|open| !open.ptr_eq(&spool));
                PartBody::Spooled(spool)
            }
            PartSink::Discard => {
                log::debug!("skipping part {}: empty filename", pending.idx);
                return Ok(None);
            }
        };

        Ok(Some(Part {
            name: pending.meta.name,
            file_name: pending.meta.file_name,
            content_type: pending.meta.content_type,
            headers: pending.headers,
            head: pending.head,
            body,
            idx: pending.idx,
        }))
    }

    fn abort(&mut self, err: &crate::Error) {
        log::debug!("aborting multipart parse: {}", err);
        self.state.stage = StreamingStage::Failed;

        for spool in self.state.open_spools.drain(..) {
            if let Err(err) = spool.close() {
                log::warn!("failed to close spool {:?}: {}", spool.path(), err);
            }
        }
    }
}

impl<S: ByteSource> Iterator for Multipart<S> {
    type Item = crate::Result<Part>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_part().transpose()
    }
}

fn parse_headers(header_bytes: &[u8]) -> crate::Result<HeaderMap> {
    if header_bytes.is_empty() {
        return Ok(HeaderMap::new());
    }

    let mut headers = [httparse::EMPTY_HEADER; constants::MAX_HEADERS];

    match httparse::parse_headers(header_bytes, &mut headers) {
        Ok(httparse::Status::Complete((_, raw_headers))) => helpers::convert_raw_headers_to_header_map(raw_headers),
        Ok(httparse::Status::Partial) => Err(crate::Error::UnexpectedEndOfInput),
        Err(err) => Err(crate::Error::ReadHeaderFailed(err)),
    }
}

fn strip_blank_line(header_bytes: &[u8]) -> &[u8] {
    header_bytes
        .strip_suffix(constants::CRLF_CRLF.as_bytes())
        .unwrap_or(header_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChunkSource;
    use std::convert::Infallible;

    fn multipart(data: &'static str, limits: ParseLimits) -> Multipart<impl ByteSource> {
        let source = ChunkSource::new(vec![Ok::<_, Infallible>(data)]);
        Multipart::with_limits(source, "X-BOUNDARY", limits)
            .unwrap()
            .spool_with(spool::memory_spool)
    }

    #[test]
    fn test_basic_fields_and_files() {
        let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"My Field\"\r\n\r\nabcd\r\n--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"File Field\"; filename=\"a-text-file.txt\"\r\nContent-Type: text/plain\r\n\r\nHello world\nHello\r\nWorld\rAgain\r\n--X-BOUNDARY--\r\n";
        let mut m = multipart(data, ParseLimits::default());

        let field = m.next_part().unwrap().unwrap();
        assert_eq!(field.name(), "My Field");
        assert_eq!(field.file_name(), None);
        assert_eq!(field.index(), 0);
        assert_eq!(field.text().unwrap(), "abcd");

        let file = m.next_part().unwrap().unwrap();
        assert_eq!(file.name(), "File Field");
        assert_eq!(file.file_name(), Some("a-text-file.txt"));
        assert_eq!(file.mime(), Some(mime::TEXT_PLAIN));
        assert_eq!(file.head(), "Content-Disposition: form-data; name=\"File Field\"; filename=\"a-text-file.txt\"\r\nContent-Type: text/plain");
        assert!(file.spool().unwrap().is_closed());
        assert_eq!(file.text().unwrap(), "Hello world\nHello\r\nWorld\rAgain");

        assert!(m.next_part().unwrap().is_none());
        assert!(m.next_part().unwrap().is_none());
    }

    #[test]
    fn test_empty_submission() {
        let mut m = multipart("--X-BOUNDARY--\r\n", ParseLimits::default());
        assert!(m.next_part().unwrap().is_none());
    }

    #[test]
    fn test_leading_whitespace_and_padding() {
        let data = "\r\n  \r\n--X-BOUNDARY \t\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--X-BOUNDARY--";
        let parts: Vec<_> = multipart(data, ParseLimits::default()).collect::<crate::Result<_>>().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text().unwrap(), "1");
    }

    #[test]
    fn test_empty_header_block() {
        let data = "--X-BOUNDARY\r\n\r\nbody\r\n--X-BOUNDARY--\r\n";
        let part = multipart(data, ParseLimits::default()).next().unwrap().unwrap();
        assert_eq!(part.name(), "text/plain");
        assert_eq!(part.text().unwrap(), "body");
        assert!(part.headers().is_empty());
    }

    #[test]
    fn test_preamble_garbage() {
        let data = "garbage\r\n--X-BOUNDARY--\r\n";
        let err = multipart(data, ParseLimits::default()).next_part().unwrap_err();
        assert_eq!(err, crate::Error::EmptyContent);
    }

    #[test]
    fn test_empty_body() {
        let err = multipart("", ParseLimits::default()).next_part().unwrap_err();
        assert_eq!(err, crate::Error::EmptyContent);
    }

    #[test]
    fn test_truncated_body() {
        let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end";
        let mut m = multipart(data, ParseLimits::default());
        assert_eq!(m.next_part().unwrap_err(), crate::Error::UnexpectedEndOfInput);
        assert!(m.next_part().unwrap().is_none());

        let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; na";
        let err = multipart(data, ParseLimits::default()).next_part().unwrap_err();
        assert_eq!(err, crate::Error::UnexpectedEndOfInput);
    }

    #[test]
    fn test_empty_filename_is_skipped() {
        let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"f\"; filename=\"\"\r\n\r\nignored\r\n--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--X-BOUNDARY--\r\n";
        let parts: Vec<_> = multipart(data, ParseLimits::default()).collect::<crate::Result<_>>().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name(), "a");
        assert_eq!(parts[0].index(), 1);
    }

    #[test]
    fn test_header_limit() {
        let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\"\r\n\r\n1\r\n--X-BOUNDARY--\r\n";
        let err = multipart(data, ParseLimits::new().header_bytes(16)).next_part().unwrap_err();
        assert_eq!(err, crate::Error::HeaderTooLarge { limit: 16 });
    }

    #[test]
    fn test_buffered_limit() {
        let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n0123456789\r\n--X-BOUNDARY--\r\n";
        let err = multipart(data, ParseLimits::new().buffered_bytes(4)).next_part().unwrap_err();
        assert_eq!(err, crate::Error::BufferedUploadTooLarge { limit: 4 });
    }

    #[test]
    fn test_boundary_validation() {
        let source = ChunkSource::new(Vec::<Result<&'static str, Infallible>>::new());
        assert_eq!(Multipart::new(source, "").err(), Some(crate::Error::NoBoundary));

        let source = ChunkSource::new(Vec::<Result<&'static str, Infallible>>::new());
        let err = Multipart::new(source, "b".repeat(71)).err();
        assert_eq!(err, Some(crate::Error::BoundaryTooLong { len: 71, limit: 70 }));
    }
}
