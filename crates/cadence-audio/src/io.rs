//! Random-access byte sources feeding the container parser and decoder.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use cadence_core::{Error, Result};
use tracing::debug;

/// Seekable byte source. The decoder is its sole reader.
pub trait DataSource: Send {
    /// Read up to `buf.len()` bytes, returning how many were read (0 at end of data).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move the cursor to an absolute byte position.
    fn seek(&mut self, position: u64) -> Result<()>;

    /// Current absolute byte position.
    fn tell(&mut self) -> Result<u64>;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Whether the cursor is at or past the end of the data.
    fn end_of_file(&mut self) -> Result<bool> {
        Ok(self.tell()? >= self.size())
    }

    /// Fill `buf` completely unless the data ends first. Returns bytes read.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Skip `count` bytes forward from the current position.
    fn skip(&mut self, count: u64) -> Result<()> {
        let position = self.tell()?;
        self.seek(position.saturating_add(count))
    }
}

/// [`DataSource`] over any seekable reader.
pub struct ReaderSource<R> {
    reader: R,
    size: u64,
}

impl<R: Read + Seek + Send> ReaderSource<R> {
    /// Wrap a reader, measuring its length and rewinding to the start.
    pub fn new(mut reader: R) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self { reader, size })
    }

    /// Unwrap the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Seek + Send> DataSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.reader.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.reader.stream_position()?)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Buffered file on disk.
pub type FileDataSource = ReaderSource<BufReader<File>>;

impl FileDataSource {
    /// Open a file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Unable to read file {}: {e}", path.display()),
            ))
        })?;
        let source = Self::new(BufReader::new(file))?;
        debug!("Opened {} ({} bytes)", path.display(), source.size());
        Ok(source)
    }
}

/// In-memory track data.
pub type MemoryDataSource = ReaderSource<Cursor<Bytes>>;

impl MemoryDataSource {
    /// Wrap bytes already in memory.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self {
            reader: Cursor::new(data),
            size,
        }
    }
}
