//! Buffered file system used by the import pipeline.
//!
//! Hosts can place file contents in the buffer (for example data proxied from
//! a browser) and have them written to the backing file system on flush. Reads
//! prefer buffered contents and fall through to the backing store otherwise.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use tracing::{debug, info};

/// Storage behind the buffer.
pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

/// The process file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    }
}

#[derive(Debug, Clone)]
struct BufferedFile {
    data: Bytes,
    dirty: bool,
}

pub struct FileSystemBuffer {
    backend: Box<dyn FileSystem>,
    files: RwLock<HashMap<PathBuf, BufferedFile>>,
}

impl FileSystemBuffer {
    pub fn new(backend: Box<dyn FileSystem>) -> Self {
        Self {
            backend,
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Open `path` for reading.
    ///
    /// The whole file is held in memory, so cloning the returned stream gives
    /// an independent reader over the same bytes without touching the source
    /// again.
    pub fn open(&self, path: impl AsRef<Path>) -> io::Result<InputFileStream> {
        let path = path.as_ref();
        let buffered = {
            let files = self
                .files
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            files.get(path).map(|file| file.data.clone())
        };
        let data = match buffered {
            Some(data) => data,
            None => Bytes::from(self.backend.read(path)?),
        };
        debug!(path = %path.display(), bytes = data.len(), "opened input stream");
        Ok(InputFileStream::new(data))
    }

    /// Place `data` in the buffer; it reaches the backing store on the next flush.
    pub fn write_file(&self, path: impl Into<PathBuf>, data: impl Into<Bytes>) {
        let path = path.into();
        let data = data.into();
        debug!(path = %path.display(), bytes = data.len(), "buffered file");
        let mut files = self
            .files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        files.insert(path, BufferedFile { data, dirty: true });
    }

    /// Forget a buffered file without writing it. Returns whether it was buffered.
    pub fn drop_file(&self, path: impl AsRef<Path>) -> bool {
        let mut files = self
            .files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        files.remove(path.as_ref()).is_some()
    }

    pub fn is_buffered(&self, path: impl AsRef<Path>) -> bool {
        let files = self
            .files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        files.contains_key(path.as_ref())
    }

    /// Paths whose buffered contents have not been written yet.
    pub fn dirty_files(&self) -> Vec<PathBuf> {
        let files = self
            .files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut dirty: Vec<PathBuf> = files
            .iter()
            .filter(|(_, file)| file.dirty)
            .map(|(path, _)| path.clone())
            .collect();
        dirty.sort();
        dirty
    }

    /// Write every pending buffer to the backing store.
    pub fn flush(&self) -> io::Result<()> {
        let mut files = self
            .files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut flushed = 0usize;
        for (path, file) in files.iter_mut().filter(|(_, file)| file.dirty) {
            self.backend.write(path, &file.data)?;
            file.dirty = false;
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, "flushed buffered files");
        }
        Ok(())
    }

    /// Write the pending buffer for `path`, if there is one.
    pub fn flush_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        let mut files = self
            .files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(file) = files.get_mut(path).filter(|file| file.dirty) {
            self.backend.write(path, &file.data)?;
            file.dirty = false;
            debug!(path = %path.display(), "flushed buffered file");
        }
        Ok(())
    }
}

impl Default for FileSystemBuffer {
    fn default() -> Self {
        Self::new(Box::new(LocalFileSystem))
    }
}

/// Readable view over a file held in memory.
#[derive(Debug, Clone)]
pub struct InputFileStream {
    inner: Cursor<Bytes>,
}

impl InputFileStream {
    pub fn new(data: Bytes) -> Self {
        Self {
            inner: Cursor::new(data),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.get_ref().is_empty()
    }

    /// The complete contents, independent of the read position.
    pub fn bytes(&self) -> Bytes {
        self.inner.get_ref().clone()
    }
}

impl Read for InputFileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BufRead for InputFileStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}
