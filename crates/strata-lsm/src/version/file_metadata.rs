use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::format::{FileNumber, InternalKey, InternalKeyBuf, UserKey};


pub(crate) type SharedFileMetadata = Arc<FileMetadata>;

pub(crate) const MAX_ALLOWED_SEEKS: u32 = (1 << 31) - 1;
const MIN_ALLOWED_SEEKS: u32 = 100;


#[derive(Debug, Clone, Copy)]
pub(crate) enum SeeksRemaining {
    Some,
    None,
}

/// Metadata of one immutable sorted table file.
///
/// Shared by every [`Version`](super::Version) that references the file; the file itself is
/// destroyed only once no live version and no in-flight async operation references it.
#[derive(Debug)]
pub(crate) struct FileMetadata {
    file_number:     FileNumber,
    file_size:       u64,
    smallest:        InternalKeyBuf,
    largest:         InternalKeyBuf,
    /// Seeks this file may absorb before it becomes a seek-compaction candidate.
    ///
    /// One seek costs about as much as compacting 16 KiB of data, so a file is allotted
    /// `file_size / min_bytes_per_seek` of them, with a floor so small files are not
    /// compacted over a handful of stray reads.
    remaining_seeks: AtomicU32,
}

impl FileMetadata {
    #[must_use]
    pub fn new(
        file_number:        FileNumber,
        file_size:          u64,
        smallest:           InternalKeyBuf,
        largest:            InternalKeyBuf,
        min_bytes_per_seek: u32,
    ) -> Self {
        let allowed_seeks = file_size / u64::from(min_bytes_per_seek.max(1));
        let allowed_seeks = u32::try_from(allowed_seeks)
            .unwrap_or(u32::MAX)
            .max(MIN_ALLOWED_SEEKS)
            .min(MAX_ALLOWED_SEEKS);

        Self {
            file_number,
            file_size,
            smallest,
            largest,
            remaining_seeks: AtomicU32::new(allowed_seeks),
        }
    }

    /// Charge one seek against this file's budget.
    ///
    /// `Ordering::Relaxed` everywhere: this is a compaction heuristic, and it does not matter
    /// exactly when the budget runs out.
    #[must_use]
    pub fn record_seek(&self) -> SeeksRemaining {
        let remaining_seeks = self.remaining_seeks.fetch_sub(1, Ordering::Relaxed);

        if remaining_seeks > MAX_ALLOWED_SEEKS {
            // A concurrent decrement wrapped past zero.
            self.remaining_seeks.store(0, Ordering::Relaxed);
            SeeksRemaining::None
        } else if remaining_seeks == 0 {
            SeeksRemaining::None
        } else {
            SeeksRemaining::Some
        }
    }

    #[must_use]
    pub const fn file_number(&self) -> FileNumber {
        self.file_number
    }

    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn smallest_key(&self) -> InternalKey<'_> {
        self.smallest.as_key()
    }

    #[must_use]
    pub fn largest_key(&self) -> InternalKey<'_> {
        self.largest.as_key()
    }

    #[must_use]
    pub fn smallest_user_key(&self) -> UserKey<'_> {
        self.smallest.user_key()
    }

    #[must_use]
    pub fn largest_user_key(&self) -> UserKey<'_> {
        self.largest.user_key()
    }
}
