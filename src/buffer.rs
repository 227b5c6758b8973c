use bytes::{Bytes, BytesMut};
use memchr::memmem;

use crate::constants;
use crate::source::ByteSource;

pub(crate) struct StreamBuffer<S> {
    pub(crate) eof: bool,
    pub(crate) buf: BytesMut,
    pub(crate) source: S,
    pub(crate) chunk_size: usize,
    pub(crate) bytes_read: u64,
}

impl<S: ByteSource> StreamBuffer<S> {
    pub fn new(source: S, chunk_size: usize) -> Self {
        StreamBuffer {
            eof: false,
            buf: BytesMut::new(),
            source,
            chunk_size: chunk_size.max(1),
            bytes_read: 0,
        }
    }

    /// Issues one read against the source. Returns `false` once the source is
    /// exhausted.
    pub fn fill(&mut self) -> crate::Result<bool> {
        if self.eof {
            return Ok(false);
        }

        match self.source.read_chunk(self.chunk_size)? {
            Some(data) => {
                log::trace!("read chunk of {} bytes", data.len());
                self.bytes_read += data.len() as u64;
                self.buf.extend_from_slice(&data);
                Ok(true)
            }
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Splits off everything up to and including `pattern`, searching from
    /// offset `from`.
    pub fn read_until(&mut self, pattern: &[u8], from: usize) -> Option<Bytes> {
        let from = from.min(self.buf.len());
        memmem::find(&self.buf[from..], pattern).map(|idx| self.buf.split_to(from + idx + pattern.len()).freeze())
    }

    /// Drops leading bytes matching `skip`. Returns how many were dropped.
    pub fn skip_while<F: Fn(u8) -> bool>(&mut self, skip: F) -> usize {
        let n = self.buf.iter().take_while(|b| skip(**b)).count();
        drop(self.buf.split_to(n));
        n
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.buf.starts_with(prefix)
    }

    /// Reads body bytes of the current part.
    ///
    /// `delimiter` is `CRLF "--" boundary`. A delimiter only ends the part when
    /// it is followed by `CRLF` or `--`; otherwise it is ordinary content.
    ///
    /// Returns `Some((true, bytes))` when the delimiter was found; the leading
    /// `CRLF` is consumed and the buffer then starts with `"--" boundary`.
    /// Returns `Some((false, bytes))` for content that can safely be handed
    /// out, and `None` when more input is needed before anything can be
    /// decided. The tail of the buffer that could still be the start of a
    /// delimiter split across two reads is always kept back.
    pub fn read_part_data(&mut self, delimiter: &[u8]) -> Option<(bool, Bytes)> {
        let d_len = delimiter.len();
        let mut from = 0;

        while let Some(rel_idx) = memmem::find(&self.buf[from..], delimiter) {
            let idx = from + rel_idx;
            let suffix = &self.buf[idx + d_len..];

            if suffix.len() < 2 {
                // The delimiter is there but its suffix has not arrived yet.
                return if idx > 0 {
                    Some((false, self.buf.split_to(idx).freeze()))
                } else {
                    None
                };
            }

            if &suffix[..2] == constants::CRLF.as_bytes() || &suffix[..2] == constants::BOUNDARY_EXT.as_bytes() {
                let bytes = self.buf.split_to(idx).freeze();

                // discard \r\n.
                drop(self.buf.split_to(constants::CRLF.len()));

                return Some((true, bytes));
            }

            from = idx + 1;
        }

        let keep = d_len - 1;
        if self.buf.len() > keep {
            let safe = self.buf.len() - keep;
            Some((false, self.buf.split_to(safe).freeze()))
        } else {
            None
        }
    }

    pub fn read_full_buf(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len()).freeze()
    }

    /// Reads whatever the source has left, failing once more than `limit`
    /// bytes (when non-zero) have accumulated.
    pub fn read_to_end(&mut self, limit: usize) -> crate::Result<Bytes> {
        loop {
            if limit > 0 && self.buf.len() > limit {
                return Err(crate::Error::QueryLimitExceeded {
                    what: "query size",
                    actual: self.buf.len(),
                    limit,
                });
            }

            if !self.fill()? {
                return Ok(self.read_full_buf());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChunkSource;
    use std::convert::Infallible;

    fn buffer_of(chunks: Vec<&'static str>) -> StreamBuffer<ChunkSource<std::vec::IntoIter<Result<&'static str, Infallible>>>> {
        let chunks: Vec<Result<&'static str, Infallible>> = chunks.into_iter().map(Ok).collect();
        StreamBuffer::new(ChunkSource::new(chunks), 1024)
    }

    fn drain_part<S: ByteSource>(buffer: &mut StreamBuffer<S>, delimiter: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        loop {
            match buffer.read_part_data(delimiter) {
                Some((done, bytes)) => {
                    data.extend_from_slice(&bytes);
                    if done {
                        return data;
                    }
                }
                None => assert!(buffer.fill().unwrap(), "source ran dry"),
            }
        }
    }

    #[test]
    fn test_read_until() {
        let mut buffer = buffer_of(vec!["a: b\r\n\r\nrest"]);
        buffer.fill().unwrap();
        assert_eq!(buffer.read_until(b"\r\n\r\n", 0), Some(Bytes::from_static(b"a: b\r\n\r\n")));
        assert_eq!(buffer.read_until(b"\r\n\r\n", 0), None);
        assert_eq!(buffer.read_full_buf(), Bytes::from_static(b"rest"));
    }

    #[test]
    fn test_read_until_resumes_from_offset() {
        let mut buffer = buffer_of(vec!["a: b\r\n\r", "\nrest"]);
        buffer.fill().unwrap();
        assert_eq!(buffer.read_until(b"\r\n\r\n", 0), None);

        let resume = buffer.buf.len() - 3;
        buffer.fill().unwrap();
        assert_eq!(buffer.read_until(b"\r\n\r\n", resume), Some(Bytes::from_static(b"a: b\r\n\r\n")));
        assert_eq!(buffer.read_until(b"\r\n\r\n", 100), None);
    }

    #[test]
    fn test_read_part_data_single_chunk() {
        let mut buffer = buffer_of(vec!["hello\r\n--XB\r\nnext"]);
        let data = drain_part(&mut buffer, b"\r\n--XB");
        assert_eq!(data, b"hello");
        assert!(buffer.starts_with(b"--XB\r\n"));
    }

    #[test]
    fn test_read_part_data_delimiter_split_across_reads() {
        let mut buffer = buffer_of(vec!["hel", "lo\r", "\n-", "-X", "B-", "-\r\n"]);
        let data = drain_part(&mut buffer, b"\r\n--XB");
        assert_eq!(data, b"hello");
        assert!(buffer.starts_with(b"--XB--"));
    }

    #[test]
    fn test_read_part_data_ignores_lookalike_delimiter() {
        let mut buffer = buffer_of(vec!["a\r\n--XBc\r\n--XB\r\n"]);
        let data = drain_part(&mut buffer, b"\r\n--XB");
        assert_eq!(data, b"a\r\n--XBc");
    }

    #[test]
    fn test_read_part_data_needs_more() {
        let mut buffer = buffer_of(vec!["\r\n--X"]);
        buffer.fill().unwrap();
        assert_eq!(buffer.read_part_data(b"\r\n--XB"), None);
    }

    #[test]
    fn test_read_to_end_limit() {
        let mut buffer = buffer_of(vec!["abc", "def"]);
        assert_eq!(buffer.read_to_end(0).unwrap(), Bytes::from_static(b"abcdef"));

        let mut buffer = buffer_of(vec!["abc", "def"]);
        assert!(matches!(
            buffer.read_to_end(4),
            Err(crate::Error::QueryLimitExceeded { limit: 4, .. })
        ));
    }
}
