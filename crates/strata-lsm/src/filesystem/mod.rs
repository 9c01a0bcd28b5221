//! The environment abstraction performing raw file I/O.
//!
//! The engine is written against object-safe traits so that the backing store is chosen once
//! at open time: [`StdFilesystem`] for real databases, [`MemoryFilesystem`] for tests.

mod memory_fs;
mod std_fs;

pub use self::{memory_fs::MemoryFilesystem, std_fs::StdFilesystem};


use std::{io::Read, io::Result as IoResult, sync::Arc};
use std::fmt::Debug;
use std::path::{Path, PathBuf};


/// A file which can be read from sequentially.
pub type SequentialFile = Box<dyn Read + Send>;

/// A file which may be read at arbitrary positions, concurrently from several threads.
pub trait RandomAccessFile: Send + Sync + Debug {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> IoResult<usize>;

    fn read_exact_at(&self, offset: u64, dst: &mut [u8]) -> IoResult<()> {
        let mut filled = 0_usize;
        while filled < dst.len() {
            match self.read_at(offset + filled as u64, &mut dst[filled..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "reached end of file before filling the buffer",
                    ));
                }
                Ok(n) => filled += n,
                Err(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(io_err) => return Err(io_err),
            }
        }
        Ok(())
    }

    fn size(&self) -> IoResult<u64>;
}

/// A file which can be written to sequentially.
///
/// Writes are buffered; `sync_data` is the only durability point.
pub trait WritableFile: Send + Debug {
    fn append(&mut self, data: &[u8]) -> IoResult<()>;

    /// Append a buffer the caller promises not to mutate.
    ///
    /// An implementation fanning writes out asynchronously may alias the buffer instead of
    /// copying it; everything else just appends.
    fn append_shared(&mut self, data: &Arc<[u8]>) -> IoResult<()> {
        self.append(data)
    }

    fn flush(&mut self) -> IoResult<()>;

    /// Ensures that appended data is flushed to disk. Note that this can be quite expensive.
    fn sync_data(&mut self) -> IoResult<()>;

    /// Flush and release the underlying file. Further appends fail.
    fn close(&mut self) -> IoResult<()>;
}

impl WritableFile for Box<dyn WritableFile> {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        (**self).append(data)
    }

    fn append_shared(&mut self, data: &Arc<[u8]>) -> IoResult<()> {
        (**self).append_shared(data)
    }

    fn flush(&mut self) -> IoResult<()> {
        (**self).flush()
    }

    fn sync_data(&mut self) -> IoResult<()> {
        (**self).sync_data()
    }

    fn close(&mut self) -> IoResult<()> {
        (**self).close()
    }
}

/// A filesystem rooted wherever its paths say.
///
/// Every engine subsystem shares one `Arc<dyn Filesystem>`; the async op-queue consumer uses
/// the positional operations (`write_at`, `truncate`) so that a queued write never needs to
/// share a seekable handle with its producer.
pub trait Filesystem: Send + Sync + Debug {
    fn open_sequential(&self, path: &Path) -> IoResult<SequentialFile>;

    fn open_random_access(&self, path: &Path) -> IoResult<std::sync::Arc<dyn RandomAccessFile>>;

    /// Open a file for writing, truncating anything already there.
    fn open_writable(&self, path: &Path) -> IoResult<Box<dyn WritableFile>>;

    /// Open a file whose end is appended to, creating it if missing.
    fn open_appendable(&self, path: &Path) -> IoResult<Box<dyn WritableFile>>;

    fn exists(&self, path: &Path) -> bool;

    /// The names (relative, single-component) of entries directly under `path`.
    fn children(&self, path: &Path) -> IoResult<Vec<PathBuf>>;

    fn size_of(&self, path: &Path) -> IoResult<u64>;

    fn delete(&self, path: &Path) -> IoResult<()>;

    fn rename(&self, from: &Path, to: &Path) -> IoResult<()>;

    fn create_dir_all(&self, path: &Path) -> IoResult<()>;

    /// Copy a whole file, returning the number of bytes copied.
    fn copy(&self, from: &Path, to: &Path) -> IoResult<u64>;

    fn truncate(&self, path: &Path, size: u64) -> IoResult<()>;

    /// Positional write, growing the file if the range extends past its end.
    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> IoResult<()>;

    /// Take the advisory lock at `path`. Fails if the lock is already held.
    fn lock(&self, path: &Path) -> IoResult<()>;

    fn unlock(&self, path: &Path) -> IoResult<()>;

    fn read_to_vec(&self, path: &Path) -> IoResult<Vec<u8>> {
        let mut file = self.open_sequential(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(contents)
    }
}
