use std::{fs, sync::Arc};
use std::fs::{File, OpenOptions};
use std::io::{
    BufReader, BufWriter, Error as IoError, ErrorKind, Read as _, Result as IoResult,
    Seek as _, SeekFrom, Write as _,
};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{Filesystem, RandomAccessFile, SequentialFile, WritableFile};


/// The standard-library filesystem.
///
/// The advisory lock is a `LOCK` file created with `create_new`; a crash can leave it behind,
/// in which case the operator removes it before reopening. Positional reads go through an
/// internal seek guarded by a mutex, so one handle may serve concurrent readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFilesystem;

impl StdFilesystem {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
struct StdRandomAccessFile {
    file: Mutex<File>,
}

impl RandomAccessFile for StdRandomAccessFile {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> IoResult<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read(dst)
    }

    fn size(&self) -> IoResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

#[derive(Debug)]
struct StdWritableFile {
    writer: Option<BufWriter<File>>,
    path:   PathBuf,
}

impl StdWritableFile {
    fn writer(&mut self) -> IoResult<&mut BufWriter<File>> {
        let path = &self.path;
        self.writer.as_mut().ok_or_else(|| {
            IoError::new(
                ErrorKind::Other,
                format!("writable file {} was already closed", path.display()),
            )
        })
    }
}

impl WritableFile for StdWritableFile {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        self.writer()?.write_all(data)
    }

    fn flush(&mut self) -> IoResult<()> {
        self.writer()?.flush()
    }

    fn sync_data(&mut self) -> IoResult<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_data()
    }

    fn close(&mut self) -> IoResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for StdWritableFile {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            // Ignoring any potential errors; `close` is the checked path.
            let _ = writer.flush();
        }
    }
}

impl Filesystem for StdFilesystem {
    fn open_sequential(&self, path: &Path) -> IoResult<SequentialFile> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn open_random_access(&self, path: &Path) -> IoResult<Arc<dyn RandomAccessFile>> {
        Ok(Arc::new(StdRandomAccessFile {
            file: Mutex::new(File::open(path)?),
        }))
    }

    fn open_writable(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(StdWritableFile {
            writer: Some(BufWriter::new(file)),
            path:   path.to_owned(),
        }))
    }

    fn open_appendable(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Box::new(StdWritableFile {
            writer: Some(BufWriter::new(file)),
            path:   path.to_owned(),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        fs::exists(path).unwrap_or(false)
    }

    fn children(&self, path: &Path) -> IoResult<Vec<PathBuf>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(PathBuf::from(entry?.file_name()));
        }
        Ok(names)
    }

    fn size_of(&self, path: &Path) -> IoResult<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn delete(&self, path: &Path) -> IoResult<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> IoResult<()> {
        fs::rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> IoResult<()> {
        fs::create_dir_all(path)
    }

    fn copy(&self, from: &Path, to: &Path) -> IoResult<u64> {
        fs::copy(from, to)
    }

    fn truncate(&self, path: &Path, size: u64) -> IoResult<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(size)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> IoResult<()> {
        let mut file = OpenOptions::new().write(true).create(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn lock(&self, path: &Path) -> IoResult<()> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(()),
            Err(io_err) if io_err.kind() == ErrorKind::AlreadyExists => Err(IoError::new(
                ErrorKind::AlreadyExists,
                format!("lock file {} is held by another process", path.display()),
            )),
            Err(io_err) => Err(io_err),
        }
    }

    fn unlock(&self, path: &Path) -> IoResult<()> {
        fs::remove_file(path)
    }
}
