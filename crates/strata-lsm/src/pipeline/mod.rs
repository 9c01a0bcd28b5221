//! The asynchronous operation pipeline.
//!
//! Foreground threads enqueue deferred file operations; a single consumer thread drains them
//! in enqueue order. A companion high-priority queue is drained preferentially on every
//! scheduling decision. There is no backpressure: producers are assumed to outrun the
//! consumer only transiently.

use std::{collections::HashSet, collections::VecDeque, sync::Arc, thread};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::path::PathBuf;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{
    database_files::TierPaths,
    filesystem::{Filesystem, RandomAccessFile, WritableFile},
    format::FileNumber,
    mirror::FileNameHash,
};


/// A writable file shared between the producer that queued operations against it and the
/// consumer that executes them.
pub(crate) type SharedWritable = Arc<Mutex<Box<dyn WritableFile>>>;

/// An iterator driven to exhaustion purely for cache warming.
pub(crate) type PrefetchIter = Box<dyn Iterator<Item = ()> + Send>;

/// One deferred file operation.
pub(crate) enum Op {
    /// Append owned bytes to a writable file.
    Append {
        file: SharedWritable,
        data: Vec<u8>,
    },
    /// Append a shared buffer; the producer retains its handle on the data.
    AppendShared {
        file: SharedWritable,
        data: Arc<[u8]>,
    },
    Sync {
        file: SharedWritable,
    },
    /// Positional write of an owned buffer.
    BufferedWrite {
        path:   PathBuf,
        offset: u64,
        data:   Vec<u8>,
    },
    Truncate {
        path: PathBuf,
        size: u64,
    },
    /// Close a writable file and drop the wrapper.
    Close {
        file: SharedWritable,
    },
    /// Finish an unbuffered secondary file: drop its name-hash mark.
    BufferedClose {
        path: PathBuf,
    },
    Delete {
        path: PathBuf,
    },
    /// Copy a primary table file to its secondary twin. Skipped with a warning when the
    /// destination already exists. Completion clears the file number from the in-flight set.
    CopyFile {
        source:      PathBuf,
        file_number: FileNumber,
    },
    /// Drive an iterator to its end for cache warming, then destroy it.
    IterPrefetch {
        iter: PrefetchIter,
    },
    /// Read `[0, size)` of a file into a scratch buffer.
    RawPrefetch {
        file: Arc<dyn RandomAccessFile>,
        size: u64,
    },
    /// Terminate the consumer once the queue has fully drained.
    Halt,
}

impl Debug for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Append { .. }        => "Append",
            Self::AppendShared { .. }  => "AppendShared",
            Self::Sync { .. }          => "Sync",
            Self::BufferedWrite { .. } => "BufferedWrite",
            Self::Truncate { .. }      => "Truncate",
            Self::Close { .. }         => "Close",
            Self::BufferedClose { .. } => "BufferedClose",
            Self::Delete { .. }        => "Delete",
            Self::CopyFile { .. }      => "CopyFile",
            Self::IterPrefetch { .. }  => "IterPrefetch",
            Self::RawPrefetch { .. }   => "RawPrefetch",
            Self::Halt                 => "Halt",
        };
        f.write_str(name)
    }
}

/// The dual FIFO queue feeding the consumer thread.
#[derive(Debug, Default)]
pub(crate) struct OpQueue {
    queues:  Mutex<Queues>,
    condvar: Condvar,
}

#[derive(Debug, Default)]
struct Queues {
    normal: VecDeque<Op>,
    high:   VecDeque<Op>,
}

impl OpQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, op: Op) {
        self.queues.lock().normal.push_back(op);
        self.condvar.notify_one();
    }

    pub fn push_priority(&self, op: Op) {
        self.queues.lock().high.push_back(op);
        self.condvar.notify_one();
    }

    /// Pop without blocking; the high-priority queue wins.
    #[must_use]
    pub fn try_pop(&self) -> Option<Op> {
        let mut queues = self.queues.lock();
        queues.high.pop_front().or_else(|| queues.normal.pop_front())
    }

    /// Pop, parking the calling thread while both queues are empty.
    #[must_use]
    pub fn wait_pop(&self) -> Op {
        let mut queues = self.queues.lock();
        loop {
            if let Some(op) = queues.high.pop_front() {
                return op;
            }
            if let Some(op) = queues.normal.pop_front() {
                return op;
            }
            self.condvar.wait(&mut queues);
        }
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        let queues = self.queues.lock();
        queues.normal.len() + queues.high.len()
    }
}

/// Everything the consumer needs to execute operations.
#[derive(Debug, Clone)]
pub(crate) struct OpContext {
    pub fs:            Arc<dyn Filesystem>,
    pub paths:         Arc<TierPaths>,
    pub moving_tables: Arc<Mutex<HashSet<FileNumber>>>,
    pub name_hash:     Arc<FileNameHash>,
}

/// Mark the file as in flight and queue its cross-tier copy.
///
/// The mark keeps the obsolete-file sweeper from deleting the source while the copy has not
/// completed.
pub(crate) fn enqueue_copy_file(
    queue:         &OpQueue,
    moving_tables: &Mutex<HashSet<FileNumber>>,
    source:        PathBuf,
    file_number:   FileNumber,
) {
    moving_tables.lock().insert(file_number);
    queue.push(Op::CopyFile {
        source,
        file_number,
    });
}

/// Spawn the single consumer thread. It runs until a [`Op::Halt`] drains the queue.
pub(crate) fn spawn_consumer(queue: Arc<OpQueue>, context: OpContext) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("strata-opq".to_owned())
        .spawn(move || run_consumer(&queue, &context))
        .expect("failed to spawn the op-queue consumer thread")
}

fn run_consumer(queue: &OpQueue, context: &OpContext) {
    debug!("op-queue consumer started");

    loop {
        // Drain without parking while work is available; block only on a truly empty queue.
        let op = match queue.try_pop() {
            Some(op) => op,
            None => queue.wait_pop(),
        };
        match op {
            Op::Append { file, data } => {
                if let Err(io_err) = file.lock().append(&data) {
                    warn!("queued append failed: {io_err}");
                }
            }
            Op::AppendShared { file, data } => {
                if let Err(io_err) = file.lock().append(&data) {
                    warn!("queued shared append failed: {io_err}");
                }
            }
            Op::Sync { file } => {
                if let Err(io_err) = file.lock().sync_data() {
                    warn!("queued sync failed: {io_err}");
                }
            }
            Op::BufferedWrite { path, offset, data } => {
                if let Err(io_err) = context.fs.write_at(&path, offset, &data) {
                    warn!("queued positional write to {} failed: {io_err}", path.display());
                }
            }
            Op::Truncate { path, size } => {
                if let Err(io_err) = context.fs.truncate(&path, size) {
                    warn!("queued truncate of {} failed: {io_err}", path.display());
                }
            }
            Op::Close { file } => {
                if let Err(io_err) = file.lock().close() {
                    warn!("queued close failed: {io_err}");
                }
            }
            Op::BufferedClose { path } => {
                context.name_hash.drop_mark(&path);
            }
            Op::Delete { path } => {
                if let Err(io_err) = context.fs.delete(&path) {
                    warn!("queued delete of {} failed: {io_err}", path.display());
                }
            }
            Op::CopyFile { source, file_number } => {
                execute_copy_file(context, &source, file_number);
            }
            Op::IterPrefetch { iter } => {
                for () in iter {}
            }
            Op::RawPrefetch { file, size } => {
                let mut scratch = vec![0_u8; usize::try_from(size).unwrap_or(usize::MAX)];
                if let Err(io_err) = file.read_exact_at(0, &mut scratch) {
                    debug!("raw prefetch failed: {io_err}");
                }
            }
            Op::Halt => {
                if queue.queued() == 0 {
                    break;
                }
                // Other producers slipped more work in; drain it before terminating.
                queue.push(Op::Halt);
            }
        }
    }

    debug!("op-queue consumer stopped");
}

fn execute_copy_file(context: &OpContext, source: &std::path::Path, file_number: FileNumber) {
    let Some(destination) = context.paths.secondary_table_path(file_number) else {
        warn!("cross-tier copy of {file_number:?} requested without a secondary tier");
        context.moving_tables.lock().remove(&file_number);
        return;
    };

    if context.fs.exists(&destination) {
        warn!(
            "cross-tier copy target {} already exists, skipping",
            destination.display(),
        );
    } else if let Err(io_err) = context.fs.copy(source, &destination) {
        warn!("cross-tier copy to {} failed: {io_err}", destination.display());
    }

    context.moving_tables.lock().remove(&file_number);
}


#[cfg(test)]
mod tests {
    use crate::config::{DbMode, EngineOptions, TierPolicy};
    use crate::filesystem::MemoryFilesystem;

    use std::path::Path;

    use super::*;


    fn test_context(fs: &MemoryFilesystem) -> OpContext {
        let options = EngineOptions::new(DbMode::HLsm, "/pri").with_secondary("/sec");
        let policy = TierPolicy::from_options(&options);
        OpContext {
            fs:            Arc::new(fs.clone()),
            paths:         Arc::new(TierPaths::new(
                options.primary_path.clone(),
                options.secondary_path.clone(),
                &policy,
            )),
            moving_tables: Arc::new(Mutex::new(HashSet::new())),
            name_hash:     Arc::new(FileNameHash::new()),
        }
    }

    #[test]
    fn high_priority_queue_drains_first() {
        let queue = OpQueue::new();
        queue.push(Op::Delete { path: "/pri/a".into() });
        queue.push_priority(Op::Halt);

        assert!(matches!(queue.try_pop(), Some(Op::Halt)));
        assert!(matches!(queue.try_pop(), Some(Op::Delete { .. })));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn halt_drains_remaining_work() {
        let fs = MemoryFilesystem::new();
        fs.open_writable(Path::new("/pri/doomed")).unwrap();

        let queue = Arc::new(OpQueue::new());
        // Halt ahead of the work in the priority queue: the consumer pops it first, finds
        // the queue nonempty, and re-posts it behind the delete.
        queue.push_priority(Op::Halt);
        queue.push(Op::Delete { path: "/pri/doomed".into() });

        let consumer = spawn_consumer(Arc::clone(&queue), test_context(&fs));
        consumer.join().unwrap();
        assert!(!fs.exists(Path::new("/pri/doomed")));
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn copy_file_clears_the_in_flight_mark() {
        let fs = MemoryFilesystem::new();
        let mut table = fs.open_writable(Path::new("/pri/000009.ldb")).unwrap();
        table.append(b"contents").unwrap();
        table.close().unwrap();

        let queue = Arc::new(OpQueue::new());
        let context = test_context(&fs);
        let moving_tables = Arc::clone(&context.moving_tables);

        enqueue_copy_file(
            &queue,
            &moving_tables,
            PathBuf::from("/pri/000009.ldb"),
            FileNumber(9),
        );
        assert!(moving_tables.lock().contains(&FileNumber(9)));

        let consumer = spawn_consumer(Arc::clone(&queue), context);
        queue.push(Op::Halt);
        consumer.join().unwrap();

        assert!(fs.exists(Path::new("/sec/000009.ldb")));
        assert!(moving_tables.lock().is_empty());
        assert_eq!(
            fs.read_to_vec(Path::new("/sec/000009.ldb")).unwrap(),
            b"contents",
        );
    }

    #[test]
    fn copy_file_skips_existing_destination() {
        let fs = MemoryFilesystem::new();
        let mut table = fs.open_writable(Path::new("/pri/000003.ldb")).unwrap();
        table.append(b"new").unwrap();
        table.close().unwrap();
        let mut old = fs.open_writable(Path::new("/sec/000003.ldb")).unwrap();
        old.append(b"old").unwrap();
        old.close().unwrap();

        let queue = Arc::new(OpQueue::new());
        let context = test_context(&fs);
        let moving_tables = Arc::clone(&context.moving_tables);

        enqueue_copy_file(
            &queue,
            &moving_tables,
            PathBuf::from("/pri/000003.ldb"),
            FileNumber(3),
        );
        let consumer = spawn_consumer(Arc::clone(&queue), context);
        queue.push(Op::Halt);
        consumer.join().unwrap();

        // Skip-if-exists: the previous contents survive.
        assert_eq!(fs.read_to_vec(Path::new("/sec/000003.ldb")).unwrap(), b"old");
        assert!(moving_tables.lock().is_empty());
    }

    #[test]
    fn appends_execute_in_enqueue_order() {
        let fs = MemoryFilesystem::new();
        let file: SharedWritable = Arc::new(Mutex::new(
            fs.open_writable(Path::new("/pri/mirrored")).unwrap(),
        ));

        let queue = Arc::new(OpQueue::new());
        queue.push(Op::Append { file: Arc::clone(&file), data: b"one ".to_vec() });
        let shared: Arc<[u8]> = Arc::from(b"two".as_slice());
        queue.push(Op::AppendShared { file: Arc::clone(&file), data: shared });
        queue.push(Op::Sync { file: Arc::clone(&file) });
        queue.push(Op::Close { file });
        queue.push(Op::Halt);

        let consumer = spawn_consumer(Arc::clone(&queue), test_context(&fs));
        consumer.join().unwrap();

        assert_eq!(fs.read_to_vec(Path::new("/pri/mirrored")).unwrap(), b"one two");
    }
}
