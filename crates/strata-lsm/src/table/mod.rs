//! The sorted-table collaborator contract and a self-contained plain table format.
//!
//! The block/filter machinery of a full SST implementation is out of scope; what the engine
//! relies on is captured here: an immutable sorted file of internal-key/value entries with a
//! checksummed footer, opened through up to two random-access handles (one per tier), with
//! point lookup, ordered iteration, and prefetch.
//!
//! On-disk layout:
//!
//! ```text
//! entry*   := varint32 key_len | encoded internal key | varint32 value_len | value
//! index    := u64-le entry offset, one per entry
//! footer   := u64-le index offset | u64-le entry count | u32-le crc32c(index) | u64-le magic
//! ```

use std::{io::Result as IoResult, path::PathBuf, sync::Arc};
use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result as FmtResult};

use integer_encoding::VarInt as _;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::TierPolicy,
    database_files::TierPaths,
    error::{Error, Result},
    filesystem::{Filesystem, RandomAccessFile, WritableFile},
    format::{EncodedInternalKey, FileNumber, InternalComparator, InternalKey, InternalKeyBuf},
    mirror::FileNameHash,
};


const FOOTER_SIZE: u64 = 8 + 8 + 4 + 8;
const TABLE_MAGIC: u64 = 0x7461_626c_5f73_7472;

/// Shared handles every table needs for late tier opens.
#[derive(Debug, Clone)]
pub(crate) struct TableDeps {
    pub fs:        Arc<dyn Filesystem>,
    pub policy:    Arc<TierPolicy>,
    pub paths:     Arc<TierPaths>,
    pub name_hash: Arc<FileNameHash>,
}

// ================================================================
//  Builder
// ================================================================

/// Writes the plain table format. Keys must be added in increasing internal-key order.
#[derive(Debug)]
pub(crate) struct TableBuilder<File> {
    file:    File,
    offsets: Vec<u64>,
    offset:  u64,
    scratch: Vec<u8>,
}

impl<File: WritableFile> TableBuilder<File> {
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            file,
            offsets: Vec::new(),
            offset:  0,
            scratch: Vec::new(),
        }
    }

    pub fn add(&mut self, key: InternalKey<'_>, value: &[u8]) -> IoResult<()> {
        self.offsets.push(self.offset);

        self.scratch.clear();
        let mut varint_buf = [0_u8; 5];
        let len = (key.encoded_len() as u32).encode_var(&mut varint_buf);
        self.scratch.extend(&varint_buf[..len]);
        key.append_encoded(&mut self.scratch);
        let len = (value.len() as u32).encode_var(&mut varint_buf);
        self.scratch.extend(&varint_buf[..len]);
        self.scratch.extend(value);

        self.file.append(&self.scratch)?;
        self.offset += self.scratch.len() as u64;
        Ok(())
    }

    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// Bytes of entry data written so far; the caller cuts output files when this reaches
    /// the target file size.
    #[must_use]
    pub const fn data_size(&self) -> u64 {
        self.offset
    }

    /// Write the index and footer, sync, close, and return the final file size.
    pub fn finish(mut self) -> IoResult<u64> {
        let index_offset = self.offset;

        let mut index = Vec::with_capacity(self.offsets.len() * 8);
        for entry_offset in &self.offsets {
            index.extend(entry_offset.to_le_bytes());
        }
        let index_crc = crc32c::crc32c(&index);
        let index_len = index.len() as u64;

        // The index is the one large immutable buffer here; a mirroring file may alias it
        // for its queued secondary write instead of copying.
        let index: Arc<[u8]> = index.into();
        self.file.append_shared(&index)?;
        self.file.append(&index_offset.to_le_bytes())?;
        self.file.append(&(self.offsets.len() as u64).to_le_bytes())?;
        self.file.append(&index_crc.to_le_bytes())?;
        self.file.append(&TABLE_MAGIC.to_le_bytes())?;
        self.file.sync_data()?;
        self.file.close()?;

        Ok(index_offset + index_len + FOOTER_SIZE)
    }
}

// ================================================================
//  Reader
// ================================================================

/// An open table: the parsed index plus up to two random-access handles.
///
/// Either handle may be absent depending on band and tier state, but never both.
pub(crate) struct Table {
    file_number: FileNumber,
    index:       Vec<u64>,
    /// Offset one past the last data byte, bounding the final entry.
    data_end:    u64,
    primary:     Mutex<Option<Arc<dyn RandomAccessFile>>>,
    secondary:   Mutex<Option<Arc<dyn RandomAccessFile>>>,
    deps:        TableDeps,
}

impl Table {
    /// Parse the footer and index through whichever handle the cache opened first.
    pub fn open(
        deps:        TableDeps,
        file_number: FileNumber,
        file_size:   u64,
        primary:     Option<Arc<dyn RandomAccessFile>>,
        secondary:   Option<Arc<dyn RandomAccessFile>>,
    ) -> Result<Self> {
        let handle = primary
            .as_ref()
            .or(secondary.as_ref())
            .ok_or_else(|| Error::invalid_argument("table opened with no handle"))?;

        if file_size < FOOTER_SIZE {
            return Err(Error::corruption(format!(
                "table {file_number:?} is shorter than its footer",
            )));
        }

        let mut footer = [0_u8; FOOTER_SIZE as usize];
        handle.read_exact_at(file_size - FOOTER_SIZE, &mut footer)?;

        let index_offset = u64::from_le_bytes(footer[0..8].try_into().expect("8 bytes"));
        let entry_count = u64::from_le_bytes(footer[8..16].try_into().expect("8 bytes"));
        let index_crc = u32::from_le_bytes(footer[16..20].try_into().expect("4 bytes"));
        let magic = u64::from_le_bytes(footer[20..28].try_into().expect("8 bytes"));

        if magic != TABLE_MAGIC {
            return Err(Error::corruption(format!("table {file_number:?} has a bad magic")));
        }
        let index_len = entry_count
            .checked_mul(8)
            .filter(|len| {
                index_offset
                    .checked_add(*len)
                    .and_then(|end| end.checked_add(FOOTER_SIZE))
                    == Some(file_size)
            })
            .ok_or_else(|| Error::corruption(format!("table {file_number:?} has a bad index")))?;

        let mut index_bytes = vec![0_u8; index_len as usize];
        handle.read_exact_at(index_offset, &mut index_bytes)?;
        if crc32c::crc32c(&index_bytes) != index_crc {
            return Err(Error::corruption(format!(
                "table {file_number:?} index checksum mismatch",
            )));
        }

        let index = index_bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("8 bytes")))
            .collect();

        Ok(Self {
            file_number,
            index,
            data_end: index_offset,
            primary: Mutex::new(primary),
            secondary: Mutex::new(secondary),
            deps,
        })
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// The effective handle for a read, per the tier policy.
    ///
    /// A preferred-but-absent side is opened late when its file has materialised (for the
    /// primary, a file just copied up; for the secondary, one whose cross-tier write has
    /// finished, as hinted by the name hash). Falls back to the other side rather than
    /// returning nothing.
    pub fn pick_handle(&self, is_sequential: bool) -> Result<Arc<dyn RandomAccessFile>> {
        let prefer_primary = self.deps.policy.read_from_primary(is_sequential);

        if prefer_primary {
            let mut primary = self.primary.lock();
            if primary.is_none() {
                let path = self.deps.paths.table_path(self.file_number);
                if self.deps.fs.exists(&path) {
                    match self.deps.fs.open_random_access(&path) {
                        Ok(handle) => *primary = Some(handle),
                        Err(io_err) => {
                            debug!("primary table {} exists but cannot be opened: {io_err}",
                                path.display());
                        }
                    }
                }
            }
            if let Some(handle) = primary.as_ref() {
                return Ok(Arc::clone(handle));
            }
        } else {
            let mut secondary = self.secondary.lock();
            if secondary.is_none() {
                if let Some(path) = self.deps.paths.secondary_table_path(self.file_number) {
                    if self.deps.fs.exists(&path) && !self.deps.name_hash.in_use(&path) {
                        match self.deps.fs.open_random_access(&path) {
                            Ok(handle) => *secondary = Some(handle),
                            Err(io_err) => {
                                debug!("secondary table {} exists but cannot be opened: {io_err}",
                                    path.display());
                            }
                        }
                    }
                }
            }
            if let Some(handle) = secondary.as_ref() {
                return Ok(Arc::clone(handle));
            }
        }

        // Fall back to whichever side is present.
        if let Some(handle) = self.primary.lock().as_ref() {
            return Ok(Arc::clone(handle));
        }
        if let Some(handle) = self.secondary.lock().as_ref() {
            return Ok(Arc::clone(handle));
        }
        Err(Error::io_error(format!(
            "table {:?} has no usable handle on either tier",
            self.file_number,
        )))
    }

    fn entry_bounds(&self, index: usize) -> (u64, u64) {
        let start = self.index[index];
        let end = self.index.get(index + 1).copied().unwrap_or(self.data_end);
        (start, end)
    }

    fn read_entry(
        &self,
        handle: &Arc<dyn RandomAccessFile>,
        index:  usize,
    ) -> Result<(InternalKeyBuf, Vec<u8>)> {
        let (start, end) = self.entry_bounds(index);
        let mut raw = vec![0_u8; (end - start) as usize];
        handle.read_exact_at(start, &mut raw)?;

        let corrupt = || Error::corruption(format!("table {:?}: bad entry", self.file_number));

        let mut input: &[u8] = &raw;
        let (key_len, used) = u32::decode_var(input).ok_or_else(corrupt)?;
        input = &input[used..];
        if input.len() < key_len as usize {
            return Err(corrupt());
        }
        let (key_bytes, rest) = input.split_at(key_len as usize);
        let key = InternalKey::decode(EncodedInternalKey(key_bytes))
            .map_err(|()| corrupt())?
            .to_buf();

        let mut input = rest;
        let (value_len, used) = u32::decode_var(input).ok_or_else(corrupt)?;
        input = &input[used..];
        if input.len() < value_len as usize {
            return Err(corrupt());
        }
        Ok((key, input[..value_len as usize].to_vec()))
    }

    /// Point lookup: the newest entry at or below the probe key, if its user key matches.
    pub fn internal_get(
        &self,
        cmp: &InternalComparator,
        key: InternalKey<'_>,
    ) -> Result<Option<(InternalKeyBuf, Vec<u8>)>> {
        let handle = self.pick_handle(false)?;

        // Binary search for the first entry at or past the probe.
        let mut left = 0_usize;
        let mut right = self.entry_count();
        while left < right {
            let mid = (left + right) / 2;
            let (mid_key, _) = self.read_entry(&handle, mid)?;
            if cmp.cmp_internal(mid_key.as_key(), key) == Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        if left >= self.entry_count() {
            return Ok(None);
        }
        let (found_key, value) = self.read_entry(&handle, left)?;
        if cmp.cmp_user(found_key.user_key(), key.user_key) == Ordering::Equal {
            Ok(Some((found_key, value)))
        } else {
            Ok(None)
        }
    }

    /// Ordered iteration over every entry.
    pub fn iter(self: &Arc<Self>, is_sequential: bool) -> Result<TableIter> {
        let handle = self.pick_handle(is_sequential)?;
        Ok(TableIter {
            table: Arc::clone(self),
            handle,
            next: 0,
        })
    }
}

impl Debug for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Table")
            .field("file_number", &self.file_number)
            .field("entries",     &self.index.len())
            .field("primary",     &self.primary.lock().is_some())
            .field("secondary",   &self.secondary.lock().is_some())
            .finish()
    }
}

/// Iterates a table in internal-key order.
#[derive(Debug)]
pub(crate) struct TableIter {
    table:  Arc<Table>,
    handle: Arc<dyn RandomAccessFile>,
    next:   usize,
}

impl Iterator for TableIter {
    type Item = Result<(InternalKeyBuf, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.table.entry_count() {
            return None;
        }
        let entry = self.table.read_entry(&self.handle, self.next);
        self.next += 1;
        Some(entry)
    }
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::config::{DbMode, EngineOptions};
    use crate::filesystem::MemoryFilesystem;
    use crate::format::{EntryType, SequenceNumber};

    use super::*;


    fn deps(fs: &MemoryFilesystem, mode: DbMode) -> TableDeps {
        let mut options = EngineOptions::new(mode, "/pri");
        if mode != DbMode::Default {
            options = options.with_secondary("/sec");
        }
        let policy = TierPolicy::from_options(&options);
        TableDeps {
            fs:        Arc::new(fs.clone()),
            paths:     Arc::new(TierPaths::new(
                options.primary_path.clone(),
                options.secondary_path.clone(),
                &policy,
            )),
            policy:    Arc::new(policy),
            name_hash: Arc::new(FileNameHash::new()),
        }
    }

    fn internal_key(user_key: &[u8], sequence: u64) -> InternalKeyBuf {
        InternalKeyBuf::new(
            user_key.to_vec(),
            SequenceNumber::new(sequence).unwrap(),
            EntryType::Value,
        )
    }

    fn build_table(fs: &MemoryFilesystem, path: &str, entries: &[(&[u8], u64, &[u8])]) -> u64 {
        let file = fs.open_writable(Path::new(path)).unwrap();
        let mut builder = TableBuilder::new(file);
        for (user_key, sequence, value) in entries {
            builder.add(internal_key(user_key, *sequence).as_key(), value).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn build_then_read_back() {
        let fs = MemoryFilesystem::new();
        let size = build_table(&fs, "/pri/000005.ldb", &[
            (b"apple", 9, b"crisp"),
            (b"banana", 7, b"ripe"),
            (b"cherry", 3, b"tart"),
        ]);
        assert_eq!(fs.size_of(Path::new("/pri/000005.ldb")).unwrap(), size);

        let deps = deps(&fs, DbMode::Default);
        let handle = deps.fs.open_random_access(Path::new("/pri/000005.ldb")).unwrap();
        let table = Arc::new(
            Table::open(deps, FileNumber(5), size, Some(handle), None).unwrap(),
        );
        assert_eq!(table.entry_count(), 3);

        let cmp = InternalComparator;
        let probe = InternalKeyBuf::new(
            b"banana".to_vec(),
            SequenceNumber::MAX,
            EntryType::MAX_TYPE,
        );
        let (key, value) = table.internal_get(&cmp, probe.as_key()).unwrap().unwrap();
        assert_eq!(key.user_key().0, b"banana");
        assert_eq!(value, b"ripe");

        let missing = InternalKeyBuf::new(
            b"blueberry".to_vec(),
            SequenceNumber::MAX,
            EntryType::MAX_TYPE,
        );
        assert!(table.internal_get(&cmp, missing.as_key()).unwrap().is_none());

        let all: Vec<_> = table.iter(true).unwrap().map(|entry| entry.unwrap()).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0.user_key().0, b"apple");
        assert_eq!(all[2].1, b"tart");
    }

    #[test]
    fn corrupt_footer_is_rejected() {
        let fs = MemoryFilesystem::new();
        let size = build_table(&fs, "/pri/000006.ldb", &[(b"k", 1, b"v")]);

        // Damage the magic.
        fs.write_at(Path::new("/pri/000006.ldb"), size - 1, &[0x00]).unwrap();

        let deps = deps(&fs, DbMode::Default);
        let handle = deps.fs.open_random_access(Path::new("/pri/000006.ldb")).unwrap();
        let opened = Table::open(deps, FileNumber(6), size, Some(handle), None);
        assert!(opened.is_err());
    }

    #[test]
    fn late_secondary_open_respects_the_name_hash() {
        let fs = MemoryFilesystem::new();
        // hLSM: random reads prefer the secondary tier.
        let size = build_table(&fs, "/pri/000008.ldb", &[(b"k", 1, b"v")]);
        build_table(&fs, "/sec/000008.ldb", &[(b"k", 1, b"v")]);

        let deps = deps(&fs, DbMode::HLsm);
        let handle = deps.fs.open_random_access(Path::new("/pri/000008.ldb")).unwrap();
        let name_hash = Arc::clone(&deps.name_hash);
        let table = Arc::new(
            Table::open(deps, FileNumber(8), size, Some(handle), None).unwrap(),
        );

        // While the secondary file is being written, the primary handle serves reads.
        name_hash.add_mark(Path::new("/sec/000008.ldb"));
        let cmp = InternalComparator;
        let probe = InternalKeyBuf::new(b"k".to_vec(), SequenceNumber::MAX, EntryType::MAX_TYPE);
        assert!(table.internal_get(&cmp, probe.as_key()).unwrap().is_some());

        // Once the writer is done, the preferred secondary side opens lazily.
        name_hash.drop_mark(Path::new("/sec/000008.ldb"));
        assert!(table.internal_get(&cmp, probe.as_key()).unwrap().is_some());
        let picked = table.pick_handle(false).unwrap();
        let mut probe_bytes = [0_u8; 1];
        picked.read_at(0, &mut probe_bytes).unwrap();
    }

}
