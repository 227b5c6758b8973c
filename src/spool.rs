//! Backing stores for file uploads.
//!
//! Every part that carries a filename is streamed into a [`Spool`] created by
//! a [`SpoolFactory`], one spool per part. The scanner closes each spool when
//! the part's closing boundary is seen, and closes every spool it opened if
//! the parse aborts. Deleting the data afterwards is up to whoever holds the
//! [`SpoolHandle`]; a [`DiskSpool`] removes its file when the last handle is
//! dropped.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard, PoisonError};

use spin::Mutex;
use tempfile::NamedTempFile;

use crate::constants;

/// Writable, later readable storage for one upload.
pub trait Spool: Write + Send + fmt::Debug {
    /// Finishes writing. Later writes fail; reading back still works.
    fn close(&mut self) -> io::Result<()>;

    fn is_closed(&self) -> bool;

    /// Bytes written so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a reader positioned at the start of the data.
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Location on disk, for spools that have one.
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Creates a spool for a part, given its filename and content type.
pub trait SpoolFactory: Send + Sync {
    fn create(&self, filename: &str, content_type: Option<&str>) -> io::Result<Box<dyn Spool>>;
}

impl<F> SpoolFactory for F
where
    F: Fn(&str, Option<&str>) -> io::Result<Box<dyn Spool>> + Send + Sync,
{
    fn create(&self, filename: &str, content_type: Option<&str>) -> io::Result<Box<dyn Spool>> {
        self(filename, content_type)
    }
}

/// The default factory: a named temporary file whose suffix keeps the
/// upload's extension.
pub fn disk_spool(filename: &str, _content_type: Option<&str>) -> io::Result<Box<dyn Spool>> {
    DiskSpool::for_filename(filename).map(|spool| Box::new(spool) as Box<dyn Spool>)
}

/// A factory keeping uploads in memory.
pub fn memory_spool(_filename: &str, _content_type: Option<&str>) -> io::Result<Box<dyn Spool>> {
    Ok(Box::new(MemorySpool::new()))
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "spool is closed for writing")
}

/// An upload stored in a [`NamedTempFile`], removed from disk on drop.
pub struct DiskSpool {
    file: NamedTempFile,
    len: u64,
    closed: bool,
}

impl DiskSpool {
    pub fn new() -> io::Result<DiskSpool> {
        DiskSpool::for_filename("")
    }

    pub fn for_filename(filename: &str) -> io::Result<DiskSpool> {
        let suffix = spool_suffix(filename);

        let file = tempfile::Builder::new()
            .prefix(constants::SPOOL_PREFIX)
            .suffix(&suffix)
            .tempfile()?;

        Ok(DiskSpool {
            file,
            len: 0,
            closed: false,
        })
    }
}

// Only ASCII alphanumerics of the extension reach the temp file name.
fn spool_suffix(filename: &str) -> String {
    let ext: String = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(constants::MAX_SPOOL_SUFFIX_LEN)
        .collect();

    if ext.is_empty() {
        String::new()
    } else {
        format!(".{}", ext)
    }
}

impl fmt::Debug for DiskSpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSpool")
            .field("path", &self.file.path())
            .field("len", &self.len)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Write for DiskSpool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        let n = self.file.write(buf)?;
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Spool for DiskSpool {
    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.file.flush()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.file.reopen()?))
    }

    fn path(&self) -> Option<&Path> {
        Some(self.file.path())
    }
}

/// An upload kept in memory.
#[derive(Debug, Default)]
pub struct MemorySpool {
    data: Vec<u8>,
    closed: bool,
}

impl MemorySpool {
    pub fn new() -> MemorySpool {
        MemorySpool::default()
    }
}

impl Write for MemorySpool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Spool for MemorySpool {
    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

/// A shared handle to a spool.
///
/// The scanner, the parsed result and a [`TempFileRegistry`] can all hold the
/// same spool; closing through any of them closes it for all.
///
/// Writes go through a blocking lock: a disk spool holds it for the whole
/// write syscall.
#[derive(Clone)]
pub struct SpoolHandle {
    inner: Arc<std::sync::Mutex<Box<dyn Spool>>>,
}

impl SpoolHandle {
    pub fn new(spool: Box<dyn Spool>) -> SpoolHandle {
        SpoolHandle {
            inner: Arc::new(std::sync::Mutex::new(spool)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Spool>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.lock().write_all(data)
    }

    pub fn close(&self) -> io::Result<()> {
        self.lock().close()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }

    pub fn len(&self) -> u64 {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path().map(Path::to_path_buf)
    }

    pub fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        self.lock().reader()
    }

    /// Reads the whole upload into memory.
    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.len() as usize);
        self.reader()?.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn ptr_eq(&self, other: &SpoolHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SpoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SpoolHandle").field(&*self.lock()).finish()
    }
}

/// The spools opened while handling one request.
///
/// Hand a clone to the parser and keep one yourself; every spool the parser
/// creates is recorded here, so cleanup can happen even when the parse
/// fails halfway.
#[derive(Clone, Default)]
pub struct TempFileRegistry {
    spools: Arc<Mutex<Vec<SpoolHandle>>>,
}

impl TempFileRegistry {
    pub fn new() -> TempFileRegistry {
        TempFileRegistry::default()
    }

    pub(crate) fn record(&self, spool: SpoolHandle) {
        self.spools.lock().push(spool);
    }

    pub fn spools(&self) -> Vec<SpoolHandle> {
        self.spools.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.spools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every recorded spool, in the order they were opened, and
    /// forgets them.
    pub fn close_all(&self) -> io::Result<()> {
        let spools = std::mem::take(&mut *self.spools.lock());
        let mut first_err = None;

        for spool in spools {
            if let Err(err) = spool.close() {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for TempFileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempFileRegistry").field("len", &self.len()).finish()
    }
}
