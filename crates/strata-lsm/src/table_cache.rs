use std::sync::Arc;

use quick_cache::sync::Cache;
use tracing::debug;

use crate::{
    error::{Error, Result},
    filesystem::{Filesystem as _, RandomAccessFile},
    format::{FileNumber, InternalComparator, InternalKey, InternalKeyBuf},
    table::{Table, TableDeps, TableIter},
};


/// Maps file numbers to open tables, bounded by capacity.
///
/// Sequential and random callers are cached separately, since they may hold different
/// underlying file handles (a bulk compaction read and a point lookup can be routed to
/// different tiers). Open failures are not cached, so a transient error or a repaired file
/// recovers automatically.
#[derive(Debug)]
pub(crate) struct TableCache {
    random_cache:     Cache<u64, Arc<Table>>,
    sequential_cache: Cache<u64, Arc<Table>>,
    deps:             TableDeps,
}

impl TableCache {
    #[must_use]
    pub fn new(deps: TableDeps, capacity: u64) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            random_cache:     Cache::new(capacity),
            sequential_cache: Cache::new(capacity),
            deps,
        }
    }

    /// Find or open the table. On a miss the file is opened from whichever tier the read
    /// policy prefers, falling back to the other.
    pub fn find(
        &self,
        file_number:   FileNumber,
        file_size:     u64,
        is_sequential: bool,
    ) -> Result<Arc<Table>> {
        let cache = if is_sequential {
            &self.sequential_cache
        } else {
            &self.random_cache
        };

        if let Some(table) = cache.get(&file_number.0) {
            return Ok(table);
        }

        let (primary, secondary) = self.open_initial_handles(file_number, is_sequential)?;
        let table = Arc::new(Table::open(
            self.deps.clone(),
            file_number,
            file_size,
            primary,
            secondary,
        )?);

        cache.insert(file_number.0, Arc::clone(&table));
        Ok(table)
    }

    fn open_initial_handles(
        &self,
        file_number:   FileNumber,
        is_sequential: bool,
    ) -> Result<(Option<Arc<dyn RandomAccessFile>>, Option<Arc<dyn RandomAccessFile>>)> {
        let primary_path = self.deps.paths.table_path(file_number);
        let secondary_path = self.deps.paths.secondary_table_path(file_number);

        let open_secondary = || -> Option<Arc<dyn RandomAccessFile>> {
            let path = secondary_path.as_ref()?;
            if !self.deps.fs.exists(path) || self.deps.name_hash.in_use(path) {
                return None;
            }
            match self.deps.fs.open_random_access(path) {
                Ok(handle) => Some(handle),
                Err(io_err) => {
                    debug!("secondary table {} failed to open: {io_err}", path.display());
                    None
                }
            }
        };

        if self.deps.policy.read_from_primary(is_sequential) {
            match self.deps.fs.open_random_access(&primary_path) {
                Ok(handle) => Ok((Some(handle), None)),
                Err(primary_err) => {
                    if let Some(handle) = open_secondary() {
                        Ok((None, Some(handle)))
                    } else {
                        Err(Error::from(primary_err))
                    }
                }
            }
        } else if let Some(handle) = open_secondary() {
            Ok((None, Some(handle)))
        } else {
            let handle = self.deps.fs.open_random_access(&primary_path)?;
            Ok((Some(handle), None))
        }
    }

    /// Point lookup through the cache.
    pub fn get(
        &self,
        cmp:         &InternalComparator,
        file_number: FileNumber,
        file_size:   u64,
        key:         InternalKey<'_>,
    ) -> Result<Option<(InternalKeyBuf, Vec<u8>)>> {
        let table = self.find(file_number, file_size, false)?;
        table.internal_get(cmp, key)
    }

    /// An ordered iterator over one table.
    pub fn iter(
        &self,
        file_number:   FileNumber,
        file_size:     u64,
        is_sequential: bool,
    ) -> Result<TableIter> {
        let table = self.find(file_number, file_size, is_sequential)?;
        table.iter(is_sequential)
    }

    /// Drop the entry so a later open reacquires its file handles. Used after a file is
    /// renamed, copied across tiers, or deleted.
    pub fn evict(&self, file_number: FileNumber) {
        self.random_cache.remove(&file_number.0);
        self.sequential_cache.remove(&file_number.0);
    }
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::config::{DbMode, EngineOptions, TierPolicy};
    use crate::database_files::TierPaths;
    use crate::filesystem::{Filesystem, MemoryFilesystem};
    use crate::format::{EntryType, SequenceNumber};
    use crate::mirror::FileNameHash;
    use crate::table::TableBuilder;

    use super::*;


    fn deps(fs: &MemoryFilesystem) -> TableDeps {
        let options = EngineOptions::new(DbMode::Default, "/pri");
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

    fn build_table(fs: &MemoryFilesystem, path: &str) -> u64 {
        let file = fs.open_writable(Path::new(path)).unwrap();
        let mut builder = TableBuilder::new(file);
        let key = InternalKeyBuf::new(
            b"key".to_vec(),
            SequenceNumber::new(4).unwrap(),
            EntryType::Value,
        );
        builder.add(key.as_key(), b"value").unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn missing_file_error_is_not_cached() {
        let fs = MemoryFilesystem::new();
        let cache = TableCache::new(deps(&fs), 16);

        assert!(cache.find(FileNumber(31), 0, false).is_err());

        // Once the file appears, the same lookup succeeds.
        let size = build_table(&fs, "/pri/000031.ldb");
        assert!(cache.find(FileNumber(31), size, false).is_ok());
    }

    #[test]
    fn evict_forces_a_reopen() {
        let fs = MemoryFilesystem::new();
        let cache = TableCache::new(deps(&fs), 16);
        let size = build_table(&fs, "/pri/000032.ldb");

        let before = cache.find(FileNumber(32), size, false).unwrap();
        cache.evict(FileNumber(32));
        let after = cache.find(FileNumber(32), size, false).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn sequential_and_random_entries_are_distinct() {
        let fs = MemoryFilesystem::new();
        let cache = TableCache::new(deps(&fs), 16);
        let size = build_table(&fs, "/pri/000033.ldb");

        let random = cache.find(FileNumber(33), size, false).unwrap();
        let sequential = cache.find(FileNumber(33), size, true).unwrap();
        assert!(!Arc::ptr_eq(&random, &sequential));
    }
}
