//! The engine handle: open/recover, reads, the flush seam, compaction scheduling, the
//! obsolete-file sweeper, and shutdown.

use std::{collections::HashSet, sync::Arc, thread};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    compaction::{Compaction, CompactionPhase, DropFilter, MergingIter, pick_compaction},
    config::{EngineOptions, TierPolicy},
    database_files::{DbFileName, TierPaths},
    error::{Error, ErrorKind, Result},
    filesystem::{Filesystem, StdFilesystem, WritableFile},
    format::{
        EntryType, FileNumber, InternalComparator, InternalKeyBuf, SequenceNumber,
    },
    level_map::LevelMap,
    levels::{L0_SOFT_FILE_LIMIT, L0_STOP_WRITE_TRIGGER, Level},
    mirror::{FileNameHash, MirrorWriter},
    pipeline::{Op, OpContext, OpQueue, enqueue_copy_file, spawn_consumer},
    table::TableBuilder,
    table_cache::TableCache,
    version::{
        BasicVersionSet, LazyUpdate, LazyVersionSet, NewFileEntry, SeeksRemaining,
        SharedFileMetadata, Version, VersionEdit, VersionStore, VersionStoreDeps,
    },
};


/// A hybrid two-tier LSM storage engine.
///
/// Dropping the engine shuts it down: the background compaction finishes its current task,
/// the async pipeline drains, and the lock file is released.
#[derive(Debug)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

#[derive(Debug)]
struct EngineShared {
    fs:            Arc<dyn Filesystem>,
    paths:         Arc<TierPaths>,
    policy:        Arc<TierPolicy>,
    cmp:           InternalComparator,
    table_cache:   TableCache,
    level_map:     LevelMap,
    name_hash:     Arc<FileNameHash>,
    op_queue:      Option<Arc<OpQueue>>,
    moving_tables: Arc<Mutex<HashSet<FileNumber>>>,
    background_compaction: bool,
    shutting_down: AtomicBool,
    inner:         Mutex<EngineInner>,
    bg_done:       Condvar,
    /// Signalled when a manifest write finishes; later writers queue behind it.
    writer_gate:   Condvar,
}

#[derive(Debug)]
struct EngineInner {
    versions:                 Box<dyn VersionStore>,
    pending_outputs:          HashSet<FileNumber>,
    bg_error:                 Option<Error>,
    bg_compaction_scheduled:  bool,
    /// Exactly one compaction task may run at a time; a stalled writer helping out checks
    /// this instead of racing the background thread for the same inputs.
    compaction_in_progress:   bool,
    /// The engine lock is released across the manifest disk write; this keeps a second
    /// writer from starting its own apply in that window.
    manifest_write_in_progress: bool,
    seek_candidate:           Option<(Level, SharedFileMetadata)>,
    consumer:                 Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
struct CompactionOutput {
    file_number: FileNumber,
    file_size:   u64,
    smallest:    InternalKeyBuf,
    largest:     InternalKeyBuf,
}

impl CompactionOutput {
    fn as_entry(&self) -> NewFileEntry {
        NewFileEntry {
            file_number: self.file_number,
            file_size:   self.file_size,
            smallest:    self.smallest.clone(),
            largest:     self.largest.clone(),
        }
    }
}

fn metadata_entry(file: &SharedFileMetadata) -> NewFileEntry {
    NewFileEntry {
        file_number: file.file_number(),
        file_size:   file.file_size(),
        smallest:    file.smallest_key().to_buf(),
        largest:     file.largest_key().to_buf(),
    }
}

impl Engine {
    /// Open a database on the real filesystem.
    pub fn open(options: EngineOptions) -> Result<Self> {
        Self::open_with_fs(options, Arc::new(StdFilesystem::new()))
    }

    /// Open a database against any filesystem implementation.
    pub fn open_with_fs(options: EngineOptions, fs: Arc<dyn Filesystem>) -> Result<Self> {
        let policy = Arc::new(TierPolicy::from_options(&options));

        let needs_secondary = policy.full_mirror
            || policy.mirror_start_level.is_some()
            || policy.is_hybrid();
        if needs_secondary && options.secondary_path.is_none() {
            return Err(Error::invalid_argument(format!(
                "mode {} requires a secondary storage path",
                options.mode,
            )));
        }

        fs.create_dir_all(&options.primary_path)?;
        if let Some(secondary) = &options.secondary_path {
            fs.create_dir_all(secondary)?;
        }

        let paths = Arc::new(TierPaths::new(
            options.primary_path.clone(),
            options.secondary_path.clone(),
            &policy,
        ));
        fs.lock(&paths.lock_path())?;

        let name_hash = Arc::new(FileNameHash::new());
        let moving_tables = Arc::new(Mutex::new(HashSet::new()));

        let (op_queue, consumer) = if policy.use_op_queue {
            let queue = Arc::new(OpQueue::new());
            let consumer = spawn_consumer(Arc::clone(&queue), OpContext {
                fs:            Arc::clone(&fs),
                paths:         Arc::clone(&paths),
                moving_tables: Arc::clone(&moving_tables),
                name_hash:     Arc::clone(&name_hash),
            });
            (Some(queue), Some(consumer))
        } else {
            (None, None)
        };

        let deps = VersionStoreDeps {
            fs:                Arc::clone(&fs),
            paths:             Arc::clone(&paths),
            policy:            Arc::clone(&policy),
            op_queue:          op_queue.clone(),
            moving_tables:     Arc::clone(&moving_tables),
            create_if_missing: options.create_if_missing,
        };
        let bootstrapped: Result<Box<dyn VersionStore>> = if policy.is_hybrid() {
            LazyVersionSet::bootstrap(deps).map(|store| Box::new(store) as _)
        } else {
            BasicVersionSet::bootstrap(deps).map(|store| Box::new(store) as _)
        };
        let versions = match bootstrapped {
            Ok(versions) => versions,
            Err(error) => {
                let _ = fs.unlock(&paths.lock_path());
                return Err(error);
            }
        };

        let table_cache = TableCache::new(
            crate::table::TableDeps {
                fs:        Arc::clone(&fs),
                policy:    Arc::clone(&policy),
                paths:     Arc::clone(&paths),
                name_hash: Arc::clone(&name_hash),
            },
            options.table_cache_capacity,
        );

        let shared = Arc::new(EngineShared {
            fs,
            paths,
            policy,
            cmp: InternalComparator,
            table_cache,
            level_map: LevelMap::new(),
            name_hash,
            op_queue,
            moving_tables,
            background_compaction: options.background_compaction,
            shutting_down: AtomicBool::new(false),
            inner: Mutex::new(EngineInner {
                versions,
                pending_outputs: HashSet::new(),
                bg_error: None,
                bg_compaction_scheduled: false,
                compaction_in_progress: false,
                manifest_write_in_progress: false,
                seek_candidate: None,
                consumer,
            }),
            bg_done: Condvar::new(),
            writer_gate: Condvar::new(),
        });

        shared.preload_level_map();
        Ok(Self { shared })
    }

    /// The memtable-flush seam: write an ordered batch of entries (`None` value = deletion)
    /// as a new level-0 table. Sequences are assigned in batch order.
    pub fn flush_batch(&self, entries: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> Result<()> {
        self.shared.flush_batch(entries)
    }

    /// Point read at the newest sequence.
    pub fn get(&self, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.get(user_key)
    }

    /// Run at most one compaction step. Returns whether any work was done.
    pub fn compact_once(&self) -> Result<bool> {
        self.shared.compact_once()
    }

    /// Run compactions until the planner finds nothing more to do.
    pub fn compact_until_quiet(&self) -> Result<()> {
        while self.shared.compact_once()? {}
        Ok(())
    }

    /// Delete files no live version references.
    pub fn sweep_obsolete_files(&self) -> Result<()> {
        self.shared.sweep_obsolete_files()
    }

    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Block until the async pipeline has executed everything queued so far and no
    /// cross-tier copy is in flight.
    pub fn wait_pipeline_idle(&self) {
        let Some(queue) = &self.shared.op_queue else { return };
        while queue.queued() > 0 || !self.shared.moving_tables.lock().is_empty() {
            thread::yield_now();
        }
    }

    // ================================================================
    //  Introspection
    // ================================================================

    #[must_use]
    pub fn files_at_level(&self, level: u8) -> Vec<u64> {
        let Ok(level) = Level::try_from(level) else {
            return Vec::new();
        };
        let current = self.shared.inner.lock().versions.current();
        current
            .level_files(level)
            .iter()
            .map(|file| file.file_number().0)
            .collect()
    }

    #[must_use]
    pub fn lazy_files_at(&self, index: usize) -> Vec<u64> {
        let inner = self.shared.inner.lock();
        let Some(lazy) = inner.versions.current_lazy() else {
            return Vec::new();
        };
        if index >= lazy.num_levels() {
            return Vec::new();
        }
        lazy.files_at(index).iter().map(|file| file.file_number().0).collect()
    }

    #[must_use]
    pub fn level_of(&self, file_number: u64) -> Option<u8> {
        self.shared
            .level_map
            .get(FileNumber(file_number))
            .map(Level::inner)
    }

    #[must_use]
    pub fn in_flight_copies(&self) -> usize {
        self.shared.moving_tables.lock().len()
    }

    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.shared.inner.lock().versions.last_sequence().inner()
    }

    /// The most recently registered table file.
    #[must_use]
    pub fn latest_table(&self) -> Option<u64> {
        self.shared.level_map.latest().map(|file_number| file_number.0)
    }

    /// Where the write-ahead-log collaborator places its segments: the primary root, or the
    /// secondary root in modes that keep logs off the fast device.
    #[must_use]
    pub fn log_root(&self) -> std::path::PathBuf {
        self.shared.paths.log_root().to_owned()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl EngineShared {
    /// Rebuild the level map from the recovered version and warm the table cache.
    ///
    /// With a pipeline running, warming goes through prefetch operations on the priority
    /// queue: the consumer touches each table's data while the engine finishes opening.
    fn preload_level_map(&self) {
        let (current, lazy) = {
            let inner = self.inner.lock();
            (inner.versions.current(), inner.versions.current_lazy())
        };

        for level in Level::all_levels() {
            for file in current.level_files(level) {
                self.level_map.add(file.file_number(), level);

                let Ok(table) = self.table_cache.find(
                    file.file_number(),
                    file.file_size(),
                    false,
                ) else {
                    // A cold cache is not an error; reads will retry the open.
                    continue;
                };
                if let Some(queue) = &self.op_queue {
                    if let Ok(handle) = table.pick_handle(true) {
                        queue.push_priority(Op::RawPrefetch {
                            file: handle,
                            size: file.file_size(),
                        });
                    }
                }
            }
        }

        // Lazy-level tables warm by iteration: the staged secondary files have no index
        // resident yet, and a sequential pass loads it along with the data.
        if let (Some(lazy), Some(queue)) = (lazy, &self.op_queue) {
            for index in 0..lazy.num_levels() {
                for file in lazy.files_at(index) {
                    let Ok(table) = self.table_cache.find(
                        file.file_number(),
                        file.file_size(),
                        true,
                    ) else {
                        continue;
                    };
                    let Ok(iter) = table.iter(true) else { continue };
                    queue.push(Op::IterPrefetch {
                        iter: Box::new(iter.map(|entry| {
                            let _ = entry;
                        })),
                    });
                }
            }
        }
    }

    fn check_usable(&self, inner: &EngineInner) -> Result<()> {
        if self.shutting_down.load(AtomicOrdering::Relaxed) {
            return Err(Error::shutdown_in_progress("engine is shutting down"));
        }
        if let Some(bg_error) = &inner.bg_error {
            return Err(bg_error.clone());
        }
        Ok(())
    }

    // ================================================================
    //  Writes
    // ================================================================

    fn flush_batch(self: &Arc<Self>, entries: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        self.check_usable(&inner)?;
        self.wait_for_level0_room(&mut inner)?;

        let base_sequence = inner.versions.last_sequence();
        let mut last_sequence = base_sequence;
        let mut internal_entries: Vec<(InternalKeyBuf, Vec<u8>)> = entries
            .into_iter()
            .map(|(user_key, value)| {
                last_sequence = last_sequence.next();
                let entry_type = if value.is_some() {
                    EntryType::Value
                } else {
                    EntryType::Deletion
                };
                (
                    InternalKeyBuf::new(user_key, last_sequence, entry_type),
                    value.unwrap_or_default(),
                )
            })
            .collect();
        internal_entries.sort_by(|(lhs, _), (rhs, _)| {
            self.cmp.cmp_internal(lhs.as_key(), rhs.as_key())
        });

        let file_number = inner.versions.new_file_number();
        inner.pending_outputs.insert(file_number);

        let build_result = MutexGuard::unlocked(&mut inner, || {
            self.write_table(file_number, Level::ZERO, &internal_entries)
        });
        let file_size = match build_result {
            Ok(file_size) => file_size,
            Err(error) => {
                inner.pending_outputs.remove(&file_number);
                inner.versions.reuse_file_number(file_number);
                return Err(error);
            }
        };

        let smallest = internal_entries.first().expect("entries are nonempty").0.clone();
        let largest = internal_entries.last().expect("entries are nonempty").0.clone();

        inner.versions.set_last_sequence(last_sequence);
        let mut edit = inner.versions.new_edit();
        edit.add_file(Level::ZERO, file_number, file_size, smallest.clone(), largest.clone());

        if self.policy.is_hybrid() {
            let outputs = [NewFileEntry {
                file_number,
                file_size,
                smallest,
                largest,
            }];
            inner.versions.update_lazy_levels(LazyUpdate {
                level:         Level::ZERO,
                edit:          &mut edit,
                inputs_base:   &[],
                inputs_parent: &[],
                outputs:       &outputs,
            })?;
        }

        self.log_and_apply(&mut inner, &mut edit)?;
        inner.pending_outputs.remove(&file_number);
        self.level_map.add(file_number, Level::ZERO);
        drop(inner);

        self.sweep_obsolete_files()?;
        self.maybe_schedule_compaction();
        Ok(())
    }

    /// Writers slow down once level 0 passes its soft file limit and stop entirely at the
    /// hard limit, giving compactions a chance to catch up. Bounded so a wedged background
    /// state cannot hang a writer forever.
    fn wait_for_level0_room(self: &Arc<Self>, inner: &mut MutexGuard<'_, EngineInner>) -> Result<()> {
        for _ in 0..64 {
            let level0_files = inner.versions.current().level_files(Level::ZERO).len();
            if level0_files < L0_SOFT_FILE_LIMIT {
                return Ok(());
            }
            if level0_files < L0_STOP_WRITE_TRIGGER {
                // Soft limit: yield the write's timeslice once, then proceed.
                MutexGuard::unlocked(inner, thread::yield_now);
                return Ok(());
            }
            debug!("level 0 has {level0_files} files; stalling the write");
            let compacted = MutexGuard::unlocked(inner, || self.compact_once())?;
            if !compacted {
                break;
            }
        }
        Ok(())
    }

    fn write_table(
        &self,
        file_number: FileNumber,
        target:      Level,
        entries:     &[(InternalKeyBuf, Vec<u8>)],
    ) -> Result<u64> {
        let file = self.new_table_writer(file_number, target)?;
        let mut builder = TableBuilder::new(file);
        for (key, value) in entries {
            builder.add(key.as_key(), value)?;
        }
        Ok(builder.finish()?)
    }

    /// Whether a table landing on `target` is written to both tiers.
    fn is_mirrored_level(&self, target: Level) -> bool {
        if self.paths.secondary_root().is_none() {
            return false;
        }
        self.policy.full_mirror
            || self.policy.top_mirror_end_level.is_some_and(|end| target <= end)
            || self.policy.mirror_start_level.is_some_and(|start| target >= start)
    }

    fn new_table_writer(
        &self,
        file_number: FileNumber,
        target:      Level,
    ) -> Result<Box<dyn WritableFile>> {
        let primary_path = self.paths.table_path(file_number);
        if self.is_mirrored_level(target) {
            let secondary_path = self
                .paths
                .secondary_table_path(file_number)
                .expect("mirrored levels require a secondary tier");
            let writer = MirrorWriter::create(
                &self.fs,
                &primary_path,
                secondary_path,
                self.op_queue.clone(),
                Arc::clone(&self.name_hash),
                self.policy.lazy_sync_on_secondary,
                self.policy.secondary_use_buffer_file,
            )?;
            Ok(Box::new(writer))
        } else {
            Ok(self.fs.open_writable(&primary_path)?)
        }
    }

    fn log_and_apply(
        &self,
        inner: &mut MutexGuard<'_, EngineInner>,
        edit:  &mut VersionEdit,
    ) -> Result<()> {
        // Queue behind any writer currently flushing the manifest with the lock released.
        while inner.manifest_write_in_progress {
            self.writer_gate.wait(inner);
        }

        let mut pending = match inner.versions.prepare(edit) {
            Ok(pending) => pending,
            Err(error) => return Err(error),
        };
        inner.manifest_write_in_progress = true;

        let fs = Arc::clone(&self.fs);
        let paths = Arc::clone(&self.paths);
        let write_result =
            MutexGuard::unlocked(inner, || pending.write_to_manifest(&fs, &paths));

        inner.manifest_write_in_progress = false;
        self.writer_gate.notify_all();

        match write_result {
            Ok(()) => {
                inner.versions.install(pending);
                Ok(())
            }
            Err(error) => {
                warn!("manifest write failed: {error}");
                inner.versions.abort(pending);
                Err(error)
            }
        }
    }

    // ================================================================
    //  Reads
    // ================================================================

    fn get(self: &Arc<Self>, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (version, snapshot) = {
            let inner = self.inner.lock();
            self.check_usable(&inner)?;
            (inner.versions.current(), inner.versions.last_sequence())
        };

        let probe = InternalKeyBuf::new(user_key.to_vec(), snapshot, EntryType::MAX_TYPE);
        let probe_key = probe.as_key();

        let mut first_read: Option<(Level, SharedFileMetadata)> = None;
        let mut files_read = 0_usize;
        let mut found: Option<Option<Vec<u8>>> = None;

        // Level 0 files may overlap: check them newest-first.
        let mut level0: Vec<&SharedFileMetadata> = version
            .level_files(Level::ZERO)
            .iter()
            .filter(|file| {
                self.cmp.cmp_user(file.smallest_user_key(), probe_key.user_key).is_le()
                    && self.cmp
                        .cmp_user(probe_key.user_key, file.largest_user_key())
                        .is_le()
            })
            .collect();
        level0.sort_by_key(|file| std::cmp::Reverse(file.file_number()));

        'search: for file in level0 {
            files_read += 1;
            if first_read.is_none() {
                first_read = Some((Level::ZERO, Arc::clone(file)));
            }
            if let Some(result) = self.read_one_file(file, probe_key)? {
                found = Some(result);
                break 'search;
            }
        }

        if found.is_none() {
            for level in Level::nonzero_levels() {
                let files = version.level_files(level);
                let Some(index) = Version::find_file(&self.cmp, files, probe_key) else {
                    continue;
                };
                let file = &files[index];
                if self.cmp.cmp_user(file.smallest_user_key(), probe_key.user_key)
                    == Ordering::Greater
                {
                    continue;
                }

                files_read += 1;
                if first_read.is_none() {
                    first_read = Some((level, Arc::clone(file)));
                }
                if let Some(result) = self.read_one_file(file, probe_key)? {
                    found = Some(result);
                    break;
                }
            }
        }

        // Reading more than one file to answer a single lookup charges the first file's
        // seek budget; exhausting it makes the file a seek-compaction candidate.
        if files_read > 1 {
            if let Some((level, file)) = first_read {
                if matches!(file.record_seek(), SeeksRemaining::None) {
                    let mut inner = self.inner.lock();
                    if inner.seek_candidate.is_none() {
                        inner.seek_candidate = Some((level, file));
                    }
                    drop(inner);
                    self.maybe_schedule_compaction();
                }
            }
        }

        Ok(found.flatten())
    }

    /// `Ok(Some(None))` is a tombstone: the search stops with "not found".
    fn read_one_file(
        &self,
        file:  &SharedFileMetadata,
        probe: crate::format::InternalKey<'_>,
    ) -> Result<Option<Option<Vec<u8>>>> {
        let entry = self.table_cache.get(
            &self.cmp,
            file.file_number(),
            file.file_size(),
            probe,
        )?;
        Ok(entry.map(|(key, value)| match key.as_key().entry_type {
            EntryType::Value    => Some(value),
            EntryType::Deletion => None,
        }))
    }

    // ================================================================
    //  Compaction
    // ================================================================

    fn maybe_schedule_compaction(self: &Arc<Self>) {
        if !self.background_compaction {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.bg_compaction_scheduled
            || inner.bg_error.is_some()
            || self.shutting_down.load(AtomicOrdering::Relaxed)
        {
            return;
        }

        let needs_work = inner.versions.current().compaction_score() >= 1.0
            || inner.seek_candidate.is_some();
        if !needs_work {
            return;
        }

        inner.bg_compaction_scheduled = true;
        drop(inner);

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("strata-compact".to_owned())
            .spawn(move || {
                loop {
                    match shared.compact_once() {
                        Ok(true) => {}
                        Ok(false) | Err(_) => break,
                    }
                }
                let mut inner = shared.inner.lock();
                inner.bg_compaction_scheduled = false;
                shared.bg_done.notify_all();
            });
        if let Err(spawn_error) = spawned {
            warn!("failed to spawn the compaction thread: {spawn_error}");
            self.inner.lock().bg_compaction_scheduled = false;
        }
    }

    fn compact_once(self: &Arc<Self>) -> Result<bool> {
        let mut inner = self.inner.lock();
        self.check_usable(&inner)?;
        if inner.compaction_in_progress {
            return Ok(false);
        }

        let seek_candidate = inner.seek_candidate.clone();
        let Some(compaction) =
            pick_compaction(inner.versions.as_ref(), &self.cmp, seek_candidate)
        else {
            return Ok(false);
        };
        if compaction.seek_driven {
            inner.seek_candidate = None;
        }

        inner.compaction_in_progress = true;
        debug!(
            phase = ?CompactionPhase::Picked,
            level = compaction.level.inner(),
            inputs = compaction.inputs[0].len() + compaction.inputs[1].len(),
            seek_driven = compaction.seek_driven,
            "compaction picked"
        );
        let result = if compaction.is_whole_level_move(&self.policy) {
            // The cursor's half-swap: the whole right half becomes the next left half.
            let files = compaction.input_version.level_files(compaction.level).to_vec();
            self.apply_move(&mut inner, &compaction, files)
        } else if compaction.is_trivial_move(&self.policy) {
            let files = compaction.inputs[0].clone();
            self.apply_move(&mut inner, &compaction, files)
        } else {
            self.do_compaction_work(&mut inner, &compaction)
        };
        inner.compaction_in_progress = false;

        match result {
            Ok(()) => {
                debug!(phase = ?CompactionPhase::Committed, "compaction committed");
                drop(inner);
                self.sweep_obsolete_files()?;
                Ok(true)
            }
            Err(error) => {
                let phase = if error.kind() == ErrorKind::ShutdownInProgress {
                    CompactionPhase::Aborted
                } else {
                    if !error.is_retryable() {
                        inner.bg_error = Some(error.clone());
                    }
                    CompactionPhase::Failed
                };
                warn!(phase = ?phase, "compaction did not commit: {error}");
                Err(error)
            }
        }
    }

    /// A move compaction: relabel the files' level membership without reading data. Covers
    /// both the single-file trivial move and the cursor's whole-half move.
    fn apply_move(
        self:       &Arc<Self>,
        inner:      &mut MutexGuard<'_, EngineInner>,
        compaction: &Compaction,
        files:      Vec<SharedFileMetadata>,
    ) -> Result<()> {
        let level = compaction.level;
        let target = compaction.target_level();

        let mut edit = inner.versions.new_edit();
        let mut outputs = Vec::with_capacity(files.len());
        for file in &files {
            edit.delete_file(level, file.file_number());
            let entry = metadata_entry(file);
            edit.add_file(
                target,
                entry.file_number,
                entry.file_size,
                entry.smallest.clone(),
                entry.largest.clone(),
            );
            outputs.push(entry);
        }

        if self.policy.is_hybrid() {
            inner.versions.update_lazy_levels(LazyUpdate {
                level,
                edit:          &mut edit,
                inputs_base:   &files,
                inputs_parent: &[],
                outputs:       &outputs,
            })?;
        } else if self.policy.mirror_start_level == Some(target) {
            // The files just crossed into the mirrored band: replicate them.
            if let Some(queue) = &self.op_queue {
                for file in &files {
                    enqueue_copy_file(
                        queue,
                        &self.moving_tables,
                        self.paths.table_path(file.file_number()),
                        file.file_number(),
                    );
                }
            }
        }

        self.log_and_apply(inner, &mut edit)?;
        for file in &files {
            self.level_map.add(file.file_number(), target);
            self.table_cache.evict(file.file_number());
        }
        info!(
            "moved {} file(s) from level {} to level {}",
            files.len(),
            level.inner(),
            target.inner(),
        );
        Ok(())
    }

    fn do_compaction_work(
        self:       &Arc<Self>,
        inner:      &mut MutexGuard<'_, EngineInner>,
        compaction: &Compaction,
    ) -> Result<()> {
        let level = compaction.level;
        let target = compaction.target_level();
        // With no open snapshots, everything up to the current sequence may be collapsed.
        let smallest_snapshot = inner.versions.last_sequence();

        debug!(
            phase = ?CompactionPhase::Running,
            "compacting {}@{} + {}@{} files",
            compaction.inputs[0].len(),
            level.inner(),
            compaction.inputs[1].len(),
            target.inner(),
        );

        let outputs = MutexGuard::unlocked(inner, || {
            self.run_merge(compaction, target, smallest_snapshot)
        })?;

        let mut edit = inner.versions.new_edit();
        for file in &compaction.inputs[0] {
            edit.delete_file(level, file.file_number());
        }
        for file in &compaction.inputs[1] {
            edit.delete_file(target, file.file_number());
        }
        for output in &outputs {
            edit.add_file(
                target,
                output.file_number,
                output.file_size,
                output.smallest.clone(),
                output.largest.clone(),
            );
        }
        if !compaction.seek_driven {
            if let Some(last_input) = compaction.inputs[0].last() {
                edit.set_compact_pointer(level, last_input.largest_key().to_buf());
            }
        }

        let output_entries: Vec<NewFileEntry> =
            outputs.iter().map(CompactionOutput::as_entry).collect();
        if self.policy.is_hybrid() {
            inner.versions.update_lazy_levels(LazyUpdate {
                level,
                edit:          &mut edit,
                inputs_base:   &compaction.inputs[0],
                inputs_parent: &compaction.inputs[1],
                outputs:       &output_entries,
            })?;
        }

        self.log_and_apply(inner, &mut edit)?;

        for output in &outputs {
            self.level_map.add(output.file_number, target);
            inner.pending_outputs.remove(&output.file_number);
        }
        info!(
            "compacted level {} into {} file(s) at level {}",
            level.inner(),
            outputs.len(),
            target.inner(),
        );
        Ok(())
    }

    /// The merge loop: read both input sets in key order, drop shadowed entries and dead
    /// tombstones, and cut output tables at the target file size.
    fn run_merge(
        &self,
        compaction:        &Compaction,
        target:            Level,
        smallest_snapshot: SequenceNumber,
    ) -> Result<Vec<CompactionOutput>> {
        let mut iters = Vec::new();
        for file in compaction.inputs.iter().flatten() {
            iters.push(self.table_cache.iter(
                file.file_number(),
                file.file_size(),
                true,
            )?);
        }

        let mut merged = MergingIter::new(iters);
        let mut filter = DropFilter::new();
        let mut allocated: Vec<FileNumber> = Vec::new();
        let mut outputs: Vec<CompactionOutput> = Vec::new();
        let mut builder: Option<OutputInProgress> = None;

        let result = (|| -> Result<()> {
            while let Some(entry) = merged.next() {
                if self.shutting_down.load(AtomicOrdering::Relaxed) {
                    return Err(Error::shutdown_in_progress("compaction aborted"));
                }
                let (key, value) = entry?;

                if filter.should_drop(
                    &compaction.input_version,
                    &self.cmp,
                    compaction.level,
                    &key,
                    smallest_snapshot,
                ) {
                    continue;
                }

                let output = match builder.as_mut() {
                    Some(output) => output,
                    None => {
                        let file_number = {
                            let mut inner = self.inner.lock();
                            let file_number = inner.versions.new_file_number();
                            inner.pending_outputs.insert(file_number);
                            file_number
                        };
                        allocated.push(file_number);
                        let file = self.new_table_writer(file_number, target)?;
                        builder.insert(OutputInProgress {
                            file_number,
                            builder:  TableBuilder::new(file),
                            smallest: key.clone(),
                            largest:  key.clone(),
                        })
                    }
                };

                output.builder.add(key.as_key(), &value)?;
                output.largest = key;

                if output.builder.data_size() >= self.policy.target_file_size {
                    let finished = builder.take().expect("an output is in progress");
                    outputs.push(finished.finish()?);
                }
            }

            // A builder is only ever opened for an entry, so a trailing one is nonempty.
            if let Some(last) = builder.take() {
                outputs.push(last.finish()?);
            }
            Ok(())
        })();

        if let Err(error) = result {
            // Failed or aborted: the just-written outputs are garbage. Unregister every
            // allocated number so the sweeper reclaims the files.
            let mut inner = self.inner.lock();
            for file_number in &allocated {
                inner.pending_outputs.remove(file_number);
            }
            drop(inner);
            return Err(error);
        }

        Ok(outputs)
    }

    // ================================================================
    //  Obsolete-file sweep
    // ================================================================

    fn sweep_obsolete_files(&self) -> Result<()> {
        let (live, lazy_live, on_the_fly, log_number, prev_log_number, manifest_number) = {
            let inner = self.inner.lock();
            if inner.bg_error.is_some() {
                // A failed background task may or may not have committed a version; nothing
                // can be garbage collected safely.
                return Ok(());
            }

            let mut live = inner.versions.live_files();
            live.extend(inner.pending_outputs.iter().copied());

            let on_the_fly: HashSet<FileNumber> =
                self.moving_tables.lock().iter().copied().collect();
            let mut lazy_live = inner.versions.live_lazy_files();
            lazy_live.extend(on_the_fly.iter().copied());

            (
                live,
                lazy_live,
                on_the_fly,
                inner.versions.log_number(),
                inner.versions.prev_log_number(),
                inner.versions.manifest_file_number(),
            )
        };

        let primary_root = self.paths.primary_root().to_owned();
        let entries = self.fs.children(&primary_root).unwrap_or_default();
        for name in entries {
            let Some(parsed) = DbFileName::parse(&name) else {
                continue;
            };

            let (keep, table_number) = match parsed {
                DbFileName::Log { file_number } => {
                    (file_number >= log_number || file_number == prev_log_number, None)
                }
                DbFileName::Manifest { file_number } => {
                    // Keep this manifest, and any newer incarnation's.
                    (file_number >= manifest_number, None)
                }
                DbFileName::Table { file_number } => {
                    (live.contains(&file_number), Some(file_number))
                }
                DbFileName::Temp { file_number } => {
                    // Temp files being written are registered in pending outputs.
                    (live.contains(&file_number), None)
                }
                DbFileName::Current
                | DbFileName::Lockfile
                | DbFileName::InfoLog
                | DbFileName::OldInfoLog => (true, None),
            };
            if keep {
                continue;
            }

            if let Some(file_number) = table_number {
                // A copy still in flight defers deletion to a later sweep.
                if on_the_fly.contains(&file_number) {
                    continue;
                }
                if !lazy_live.contains(&file_number) {
                    self.table_cache.evict(file_number);
                }
                if !self.policy.is_hybrid()
                    && !self.level_map.within_mirrored(&self.policy, file_number)
                {
                    if let Some(secondary) = self.paths.secondary_table_path(file_number) {
                        if self.fs.exists(&secondary) {
                            let _ = self.fs.delete(&secondary);
                        }
                    }
                }
                self.level_map.remove(file_number);
            }

            debug!("deleting obsolete file {}", name.display());
            let _ = self.fs.delete(&primary_root.join(&name));
        }

        if self.policy.is_hybrid() {
            if let Some(secondary_root) = self.paths.secondary_root() {
                let secondary_root = secondary_root.to_owned();
                let entries = self.fs.children(&secondary_root).unwrap_or_default();
                for name in entries {
                    let Some(DbFileName::Table { file_number }) = DbFileName::parse(&name)
                    else {
                        continue;
                    };
                    if lazy_live.contains(&file_number) {
                        continue;
                    }
                    if !live.contains(&file_number) {
                        // Not mirrored anywhere: close out the cached handles too.
                        self.table_cache.evict(file_number);
                        debug!("deleting obsolete secondary file {}", name.display());
                        let path = secondary_root.join(&name);
                        // Unlinking on the slow device is deferred to the consumer thread.
                        if let Some(queue) = &self.op_queue {
                            queue.push(Op::Delete { path });
                        } else {
                            let _ = self.fs.delete(&path);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    // ================================================================
    //  Shutdown
    // ================================================================

    fn shutdown(&self) {
        if self.shutting_down.swap(true, AtomicOrdering::SeqCst) {
            return;
        }

        let mut inner = self.inner.lock();
        while inner.bg_compaction_scheduled {
            self.bg_done.wait(&mut inner);
        }

        let consumer = inner.consumer.take();
        drop(inner);

        if let Some(queue) = &self.op_queue {
            queue.push(Op::Halt);
        }
        if let Some(consumer) = consumer {
            if consumer.join().is_err() {
                warn!("the op-queue consumer panicked during shutdown");
            }
        }

        if let Err(io_err) = self.fs.unlock(&self.paths.lock_path()) {
            warn!("failed to release the lock file: {io_err}");
        }
    }
}

#[derive(Debug)]
struct OutputInProgress {
    file_number: FileNumber,
    builder:     TableBuilder<Box<dyn WritableFile>>,
    smallest:    InternalKeyBuf,
    largest:     InternalKeyBuf,
}

impl OutputInProgress {
    fn finish(self) -> Result<CompactionOutput> {
        let entries = self.builder.entry_count();
        let file_size = self.builder.finish()?;
        debug!(entries, file_size, "finished compaction output {:?}", self.file_number);
        Ok(CompactionOutput {
            file_number: self.file_number,
            file_size,
            smallest: self.smallest,
            largest: self.largest,
        })
    }
}
