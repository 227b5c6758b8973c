//! Byte sources the multipart scanner and the form parser pull from.
//!
//! A source hands out chunks of at most `max` bytes. `Ok(None)` means the
//! source is exhausted; an empty chunk means nothing is available yet and the
//! caller should ask again. Cancellation is the source's business: a source
//! that gives up returns an error, which aborts the parse.

use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::error::BoxError;

/// A pull-based supplier of body bytes.
pub trait ByteSource {
    /// Reads up to `max` bytes.
    fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>>;
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        (**self).read_chunk(max)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        (**self).read_chunk(max)
    }
}

/// Adapts any [`Read`] into a [`ByteSource`].
///
/// `Interrupted` and `WouldBlock` reads are reported as "no data yet".
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    scratch: BytesMut,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> ReaderSource<R> {
        ReaderSource {
            reader,
            scratch: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        let max = max.max(1);
        if self.scratch.len() < max {
            // Reclaims the allocation once earlier chunks are dropped.
            self.scratch.resize(max, 0);
        }

        match self.reader.read(&mut self.scratch[..max]) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(self.scratch.split_to(n).freeze())),
            Err(err) if matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                Ok(Some(Bytes::new()))
            }
            Err(err) => Err(crate::Error::StreamReadFailed(err.into())),
        }
    }
}

/// Adapts an iterator of chunks into a [`ByteSource`].
///
/// Chunks larger than the requested size are handed out in pieces.
///
/// # Examples
///
/// ```
/// use multiform::bytes::Bytes;
/// use multiform::{ByteSource, ChunkSource};
/// use std::convert::Infallible;
///
/// let chunks = vec![Ok::<_, Infallible>("abc"), Ok("def")];
/// let mut source = ChunkSource::new(chunks);
///
/// assert_eq!(source.read_chunk(2).unwrap(), Some(Bytes::from("ab")));
/// assert_eq!(source.read_chunk(8).unwrap(), Some(Bytes::from("c")));
/// assert_eq!(source.read_chunk(8).unwrap(), Some(Bytes::from("def")));
/// assert_eq!(source.read_chunk(8).unwrap(), None);
/// ```
pub struct ChunkSource<I> {
    chunks: I,
    pending: Bytes,
}

impl<I, O, E> ChunkSource<I>
where
    I: Iterator<Item = Result<O, E>>,
    O: Into<Bytes>,
    E: Into<BoxError>,
{
    pub fn new<T>(chunks: T) -> ChunkSource<I>
    where
        T: IntoIterator<IntoIter = I>,
    {
        ChunkSource {
            chunks: chunks.into_iter(),
            pending: Bytes::new(),
        }
    }
}

impl<I, O, E> ByteSource for ChunkSource<I>
where
    I: Iterator<Item = Result<O, E>>,
    O: Into<Bytes>,
    E: Into<BoxError>,
{
    fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        if self.pending.is_empty() {
            match self.chunks.next() {
                Some(Ok(chunk)) => self.pending = chunk.into(),
                Some(Err(err)) => return Err(crate::Error::StreamReadFailed(err.into())),
                None => return Ok(None),
            }
        }

        let n = self.pending.len().min(max.max(1));
        Ok(Some(self.pending.split_to(n)))
    }
}

/// Caps another source at a declared content length.
///
/// The length only bounds how much is read; a body that ends early is still
/// reported through the inner source's EOF.
#[derive(Debug)]
pub struct BoundedSource<S> {
    inner: S,
    remaining: u64,
}

impl<S: ByteSource> BoundedSource<S> {
    pub fn new(inner: S, content_length: u64) -> BoundedSource<S> {
        BoundedSource {
            inner,
            remaining: content_length,
        }
    }

    /// Bytes that may still be read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<S: ByteSource> ByteSource for BoundedSource<S> {
    fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let max = (max as u64).min(self.remaining) as usize;

        match self.inner.read_chunk(max)? {
            Some(mut chunk) => {
                if chunk.len() > max {
                    chunk.truncate(max);
                }
                self.remaining -= chunk.len() as u64;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_reader_source() {
        let mut source = ReaderSource::new(&b"hello"[..]);
        assert_eq!(source.read_chunk(3).unwrap(), Some(Bytes::from_static(b"hel")));
        assert_eq!(source.read_chunk(3).unwrap(), Some(Bytes::from_static(b"lo")));
        assert_eq!(source.read_chunk(3).unwrap(), None);
    }

    #[test]
    fn test_reader_source_reuses_scratch_between_reads() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut source = ReaderSource::new(&data[..]);

        let mut out = Vec::new();
        while let Some(chunk) = source.read_chunk(1024).unwrap() {
            assert!(chunk.len() <= 1024);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);
        assert!(source.scratch.capacity() <= 2 * 1024);
    }

    #[test]
    fn test_chunk_source_propagates_errors() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(io::Error::new(io::ErrorKind::TimedOut, "cancelled")),
        ];
        let mut source = ChunkSource::new(chunks);

        assert_eq!(source.read_chunk(16).unwrap(), Some(Bytes::from_static(b"ab")));
        let err = source.read_chunk(16).unwrap_err();
        assert_eq!(err.to_string(), "stream read failed: cancelled");
    }

    #[test]
    fn test_bounded_source_stops_at_content_length() {
        let source = ChunkSource::new(vec![Ok::<_, Infallible>("0123456789")]);
        let mut bounded = BoundedSource::new(source, 4);

        assert_eq!(bounded.read_chunk(3).unwrap(), Some(Bytes::from_static(b"012")));
        assert_eq!(bounded.read_chunk(3).unwrap(), Some(Bytes::from_static(b"3")));
        assert_eq!(bounded.remaining(), 0);
        assert_eq!(bounded.read_chunk(3).unwrap(), None);
    }

    #[test]
    fn test_bounded_source_reports_short_body() {
        let source = ReaderSource::new(&b"ab"[..]);
        let mut bounded = BoundedSource::new(source, 10);

        assert_eq!(bounded.read_chunk(8).unwrap(), Some(Bytes::from_static(b"ab")));
        assert_eq!(bounded.read_chunk(8).unwrap(), None);
    }
}
