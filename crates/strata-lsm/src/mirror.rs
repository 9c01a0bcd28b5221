//! Mirrored writable files.
//!
//! A [`MirrorWriter`] fans one logical append into a direct write on the primary tier and a
//! queued write on the secondary tier. Per-file ordering on the secondary follows enqueue
//! order; there is no implicit cross-file barrier.

use std::{io::Result as IoResult, path::Path, path::PathBuf, sync::Arc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::fmt::{Debug, Formatter, Result as FmtResult};

use parking_lot::Mutex;

use crate::{
    filesystem::{Filesystem, WritableFile},
    pipeline::{Op, OpQueue, SharedWritable},
};


const NAME_HASH_SLOTS: usize = 4096;

/// Tracks which secondary files are currently being written.
///
/// Modulo-4096 counters without collision resolution: `in_use` is an imprecise hint used to
/// avoid opening a secondary table mid-write, never a correctness gate.
pub(crate) struct FileNameHash {
    slots: Vec<AtomicU32>,
}

impl FileNameHash {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..NAME_HASH_SLOTS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    fn slot(&self, path: &Path) -> &AtomicU32 {
        let hash = crc32c::crc32c(path.as_os_str().as_encoded_bytes());
        &self.slots[hash as usize % NAME_HASH_SLOTS]
    }

    pub fn add_mark(&self, path: &Path) {
        self.slot(path).fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_mark(&self, path: &Path) {
        self.slot(path).fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn in_use(&self, path: &Path) -> bool {
        self.slot(path).load(Ordering::Relaxed) > 0
    }
}

impl Default for FileNameHash {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for FileNameHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let marked = self.slots.iter().filter(|slot| slot.load(Ordering::Relaxed) > 0).count();
        f.debug_struct("FileNameHash").field("marked_slots", &marked).finish()
    }
}

/// The alignment and flush unit of [`BufferedSecondaryFile`].
const BUFFER_BLOCK_SIZE: usize = 4096;
/// How much data a buffered secondary file accumulates before queueing one positional write.
const BUFFER_CAPACITY: usize = 4 << 20;

/// A secondary-tier writer that batches appends into large aligned positional writes,
/// executed by the pipeline consumer. The slow device then sees a few big sequential writes
/// instead of a stream of small appends.
///
/// The final block is zero-padded to the alignment and the file truncated back to its true
/// length on close.
#[derive(Debug)]
pub(crate) struct BufferedSecondaryFile {
    path:   PathBuf,
    queue:  Arc<OpQueue>,
    buffer: Vec<u8>,
    /// File offset the start of `buffer` corresponds to.
    offset: u64,
    closed: bool,
}

impl BufferedSecondaryFile {
    #[must_use]
    pub fn new(path: PathBuf, queue: Arc<OpQueue>) -> Self {
        Self {
            path,
            queue,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            offset: 0,
            closed: false,
        }
    }

    fn queue_full_buffer(&mut self) {
        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(BUFFER_CAPACITY));
        let len = data.len() as u64;
        self.queue.push(Op::BufferedWrite {
            path:   self.path.clone(),
            offset: self.offset,
            data,
        });
        self.offset += len;
    }
}

impl WritableFile for BufferedSecondaryFile {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= BUFFER_CAPACITY {
            self.queue_full_buffer();
        }
        Ok(())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }

    fn sync_data(&mut self) -> IoResult<()> {
        // Durability on the secondary tier is best-effort by design; the primary tier is
        // the crash-consistent copy.
        Ok(())
    }

    fn close(&mut self) -> IoResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let true_len = self.offset + self.buffer.len() as u64;
        let padding = (BUFFER_BLOCK_SIZE - self.buffer.len() % BUFFER_BLOCK_SIZE)
            % BUFFER_BLOCK_SIZE;
        self.buffer.extend(std::iter::repeat_n(0_u8, padding));

        let data = std::mem::take(&mut self.buffer);
        self.queue.push(Op::BufferedWrite {
            path:   self.path.clone(),
            offset: self.offset,
            data,
        });
        self.queue.push(Op::Truncate {
            path: self.path.clone(),
            size: true_len,
        });
        Ok(())
    }
}

/// A writable file whose appends land on the primary tier directly and on the secondary tier
/// through the async pipeline.
///
/// Without a queue (modes that run no consumer thread), the secondary write happens inline.
pub(crate) struct MirrorWriter {
    primary:        Box<dyn WritableFile>,
    secondary:      SharedWritable,
    secondary_path: PathBuf,
    queue:          Option<Arc<OpQueue>>,
    name_hash:      Arc<FileNameHash>,
    /// Fold queued secondary syncs into the eventual close instead of issuing them eagerly.
    lazy_sync:      bool,
    closed:         bool,
}

impl MirrorWriter {
    pub fn create(
        fs:             &Arc<dyn Filesystem>,
        primary_path:   &Path,
        secondary_path: PathBuf,
        queue:          Option<Arc<OpQueue>>,
        name_hash:      Arc<FileNameHash>,
        lazy_sync:      bool,
        buffered:       bool,
    ) -> IoResult<Self> {
        let primary = fs.open_writable(primary_path)?;
        let secondary: Box<dyn WritableFile> = match &queue {
            Some(queue) if buffered => {
                // Truncate anything left over, then batch everything through the queue.
                fs.open_writable(&secondary_path)?.close()?;
                Box::new(BufferedSecondaryFile::new(
                    secondary_path.clone(),
                    Arc::clone(queue),
                ))
            }
            _ => fs.open_writable(&secondary_path)?,
        };
        name_hash.add_mark(&secondary_path);

        Ok(Self {
            primary,
            secondary: Arc::new(Mutex::new(secondary)),
            secondary_path,
            queue,
            name_hash,
            lazy_sync,
            closed: false,
        })
    }

}

impl WritableFile for MirrorWriter {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        if let Some(queue) = &self.queue {
            queue.push(Op::Append {
                file: Arc::clone(&self.secondary),
                data: data.to_vec(),
            });
        } else {
            self.secondary.lock().append(data)?;
        }
        self.primary.append(data)
    }

    /// The queued secondary append aliases the shared buffer instead of copying it.
    /// Callers that cannot guarantee the buffer stays unchanged use the plain
    /// [`WritableFile::append`], which copies.
    fn append_shared(&mut self, data: &Arc<[u8]>) -> IoResult<()> {
        if let Some(queue) = &self.queue {
            queue.push(Op::AppendShared {
                file: Arc::clone(&self.secondary),
                data: Arc::clone(data),
            });
        } else {
            self.secondary.lock().append(data)?;
        }
        self.primary.append(data)
    }

    fn flush(&mut self) -> IoResult<()> {
        self.primary.flush()
    }

    fn sync_data(&mut self) -> IoResult<()> {
        if let Some(queue) = &self.queue {
            if !self.lazy_sync {
                queue.push(Op::Sync {
                    file: Arc::clone(&self.secondary),
                });
            }
        } else {
            self.secondary.lock().sync_data()?;
        }
        self.primary.sync_data()
    }

    fn close(&mut self) -> IoResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(queue) = &self.queue {
            queue.push(Op::Close {
                file: Arc::clone(&self.secondary),
            });
            queue.push(Op::BufferedClose {
                path: self.secondary_path.clone(),
            });
        } else {
            self.secondary.lock().close()?;
            self.name_hash.drop_mark(&self.secondary_path);
        }
        self.primary.close()
    }
}

impl Debug for MirrorWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MirrorWriter")
            .field("secondary_path", &self.secondary_path)
            .field("queued",         &self.queue.is_some())
            .field("lazy_sync",      &self.lazy_sync)
            .field("closed",         &self.closed)
            .finish()
    }
}
