use std::{collections::HashMap, collections::HashSet, io::Cursor, sync::Arc};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{Filesystem, RandomAccessFile, SequentialFile, WritableFile};


/// An in-memory filesystem with shared state, for tests.
///
/// Clones share the same tree. Deleting a file unlinks it from the tree while open handles
/// keep their data alive, matching POSIX unlink semantics. Directories are implicit.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilesystem {
    state: Arc<Mutex<FsState>>,
}

#[derive(Debug, Default)]
struct FsState {
    files:  HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    locked: HashSet<PathBuf>,
}

impl MemoryFilesystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(path: &Path) -> IoError {
        IoError::new(
            ErrorKind::NotFound,
            format!("no such file: {}", path.display()),
        )
    }

    fn contents(&self, path: &Path) -> IoResult<Arc<Mutex<Vec<u8>>>> {
        self.state
            .lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }
}

#[derive(Debug)]
struct MemoryRandomAccessFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl RandomAccessFile for MemoryRandomAccessFile {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> IoResult<usize> {
        let data = self.data.lock();
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        if offset >= data.len() {
            return Ok(0);
        }
        let available = &data[offset..];
        let n = dst.len().min(available.len());
        dst[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn size(&self) -> IoResult<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

#[derive(Debug)]
struct MemoryWritableFile {
    data:   Arc<Mutex<Vec<u8>>>,
    closed: bool,
}

impl WritableFile for MemoryWritableFile {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        if self.closed {
            return Err(IoError::new(
                ErrorKind::Other,
                "writable file was already closed",
            ));
        }
        self.data.lock().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }

    fn sync_data(&mut self) -> IoResult<()> {
        Ok(())
    }

    fn close(&mut self) -> IoResult<()> {
        self.closed = true;
        Ok(())
    }
}

impl Filesystem for MemoryFilesystem {
    fn open_sequential(&self, path: &Path) -> IoResult<SequentialFile> {
        let snapshot = self.contents(path)?.lock().clone();
        Ok(Box::new(Cursor::new(snapshot)))
    }

    fn open_random_access(&self, path: &Path) -> IoResult<Arc<dyn RandomAccessFile>> {
        Ok(Arc::new(MemoryRandomAccessFile {
            data: self.contents(path)?,
        }))
    }

    fn open_writable(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        let data = Arc::new(Mutex::new(Vec::new()));
        self.state
            .lock()
            .files
            .insert(path.to_owned(), Arc::clone(&data));
        Ok(Box::new(MemoryWritableFile {
            data,
            closed: false,
        }))
    }

    fn open_appendable(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        let data = self
            .state
            .lock()
            .files
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(Box::new(MemoryWritableFile {
            data,
            closed: false,
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.files.contains_key(path)
            || state.files.keys().any(|existing| existing.starts_with(path))
    }

    fn children(&self, path: &Path) -> IoResult<Vec<PathBuf>> {
        let state = self.state.lock();
        let mut names = Vec::new();
        for existing in state.files.keys() {
            if existing.parent() == Some(path) {
                if let Some(name) = existing.file_name() {
                    names.push(PathBuf::from(name));
                }
            }
        }
        Ok(names)
    }

    fn size_of(&self, path: &Path) -> IoResult<u64> {
        Ok(self.contents(path)?.lock().len() as u64)
    }

    fn delete(&self, path: &Path) -> IoResult<()> {
        self.state
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> IoResult<()> {
        let mut state = self.state.lock();
        let data = state.files.remove(from).ok_or_else(|| Self::not_found(from))?;
        state.files.insert(to.to_owned(), data);
        Ok(())
    }

    fn create_dir_all(&self, _path: &Path) -> IoResult<()> {
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> IoResult<u64> {
        let snapshot = self.contents(from)?.lock().clone();
        let copied = snapshot.len() as u64;
        self.state
            .lock()
            .files
            .insert(to.to_owned(), Arc::new(Mutex::new(snapshot)));
        Ok(copied)
    }

    fn truncate(&self, path: &Path, size: u64) -> IoResult<()> {
        let contents = self.contents(path)?;
        let mut data = contents.lock();
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        data.resize(size, 0);
        Ok(())
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> IoResult<()> {
        let contents = self
            .state
            .lock()
            .files
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        let mut file_data = contents.lock();
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = offset + data.len();
        if file_data.len() < end {
            file_data.resize(end, 0);
        }
        file_data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn lock(&self, path: &Path) -> IoResult<()> {
        let mut state = self.state.lock();
        if state.locked.insert(path.to_owned()) {
            state
                .files
                .entry(path.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
            Ok(())
        } else {
            Err(IoError::new(
                ErrorKind::AlreadyExists,
                format!("lock file {} is held", path.display()),
            ))
        }
    }

    fn unlock(&self, path: &Path) -> IoResult<()> {
        self.state.lock().locked.remove(path);
        Ok(())
    }
}
