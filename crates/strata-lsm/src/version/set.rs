use std::{collections::HashSet, sync::Arc, sync::Weak};
use std::fmt::Debug;

use parking_lot::Mutex;

use crate::{
    config::TierPolicy,
    database_files::TierPaths,
    error::{Error, ErrorKind, Result},
    filesystem::{Filesystem, WritableFile},
    format::{FileNumber, InternalComparator, InternalKeyBuf, SequenceNumber},
    levels::{DeltaRing, Level, LogicalLevel, NUM_LEVELS_USIZE},
    pipeline::OpQueue,
    write_log::{WriteLogReader, WriteLogWriter},
};

use super::{
    builder::VersionBuilder,
    edit::{NewFileEntry, VersionEdit},
    file_metadata::SharedFileMetadata,
    version_struct::Version,
};


/// Everything a version set needs from its surroundings.
#[derive(Debug, Clone)]
pub(crate) struct VersionStoreDeps {
    pub fs:                Arc<dyn Filesystem>,
    pub paths:             Arc<TierPaths>,
    pub policy:            Arc<TierPolicy>,
    pub op_queue:          Option<Arc<OpQueue>>,
    pub moving_tables:     Arc<Mutex<HashSet<FileNumber>>>,
    pub create_if_missing: bool,
}

/// Arguments of a hybrid lazy-level update, bundled so the trait stays readable.
#[derive(Debug)]
pub(crate) struct LazyUpdate<'a> {
    /// The compaction's input level.
    pub level:         Level,
    pub edit:          &'a mut VersionEdit,
    /// Input files taken from `level`.
    pub inputs_base:   &'a [SharedFileMetadata],
    /// Companion input files taken from `level + 1`.
    pub inputs_parent: &'a [SharedFileMetadata],
    /// The files the compaction produced (for a trivial move, the moved file itself).
    pub outputs:       &'a [NewFileEntry],
}

/// The version-set interface. Two implementations exist: [`BasicVersionSet`] for the plain
/// tiers and [`LazyVersionSet`](super::LazyVersionSet) for the hybrid mode. The choice is
/// made once at open time; hybrid-specific operations are part of the interface, gated by
/// [`VersionStore::is_hybrid`], so no implementation ever needs downcasting.
pub(crate) trait VersionStore: Send + Debug {
    fn is_hybrid(&self) -> bool;

    fn current(&self) -> Arc<Version>;

    fn current_lazy(&self) -> Option<Arc<Version>>;

    /// A fresh edit, pre-populated with whatever bookkeeping the implementation persists in
    /// every record (the hybrid set snapshots its delta-ring offsets).
    fn new_edit(&self) -> VersionEdit;

    /// Step one of apply→log→install: fold the edit onto the current version under the
    /// engine lock. The returned token carries the manifest writer, so exactly one apply may
    /// be in flight; [`PendingApply::write_to_manifest`] runs without the lock, and
    /// [`VersionStore::install`] or [`VersionStore::abort`] completes the protocol.
    fn prepare(&mut self, edit: &mut VersionEdit) -> Result<PendingApply>;

    fn install(&mut self, pending: PendingApply);

    fn abort(&mut self, pending: PendingApply);

    fn log_number(&self) -> FileNumber;

    fn prev_log_number(&self) -> FileNumber;

    fn manifest_file_number(&self) -> FileNumber;

    fn new_file_number(&mut self) -> FileNumber;

    /// Hand back the most recently allocated file number if nothing used it.
    fn reuse_file_number(&mut self, file_number: FileNumber);

    fn mark_file_number_used(&mut self, file_number: FileNumber);

    fn last_sequence(&self) -> SequenceNumber;

    fn set_last_sequence(&mut self, sequence: SequenceNumber);

    fn compact_pointer(&self, level: Level) -> Option<&InternalKeyBuf>;

    /// Every file number referenced by the current or any still-live version.
    fn live_files(&self) -> HashSet<FileNumber>;

    fn live_lazy_files(&self) -> HashSet<FileNumber> {
        HashSet::new()
    }

    fn num_lazy_levels(&self) -> usize {
        0
    }

    fn delta_ring(&self, _logical: LogicalLevel) -> Option<DeltaRing> {
        None
    }

    /// Bump the active delta slot of a logical level, promoting the ring first if it is
    /// full. Never overwrites pending work.
    fn advance_active_delta_level(&mut self, _logical: LogicalLevel) {}

    /// Mirror a compaction's level transitions into the lazy level space (hybrid only).
    fn update_lazy_levels(&mut self, _update: LazyUpdate<'_>) -> Result<()> {
        Ok(())
    }
}

// ================================================================
//  Pending apply token
// ================================================================

/// The in-flight state between [`VersionStore::prepare`] and
/// [`VersionStore::install`]/[`VersionStore::abort`].
#[derive(Debug)]
pub(crate) struct PendingApply {
    pub(super) new_version:      Version,
    pub(super) new_lazy_version: Option<Version>,
    pub(super) encoded_record:   Vec<u8>,
    pub(super) manifest_writer:  WriteLogWriter<Box<dyn WritableFile>>,
    /// Set when this apply created the manifest: on success `CURRENT` is pointed at it, on
    /// failure it is deleted so no dangling `CURRENT` can arise.
    pub(super) created_manifest: Option<FileNumber>,
    pub(super) log_number:       FileNumber,
    pub(super) prev_log_number:  FileNumber,
}

impl PendingApply {
    /// Step two of apply→log→install: write the encoded edit as one manifest record and
    /// fsync it. No lock needs to be held. On success of a first-time manifest, `CURRENT`
    /// is rewritten atomically via write-temp-then-rename.
    pub fn write_to_manifest(&mut self, fs: &Arc<dyn Filesystem>, paths: &TierPaths) -> Result<()> {
        self.manifest_writer
            .add_record(&self.encoded_record)
            .map_err(|log_err| Error::io_error(log_err.to_string()))?;
        self.manifest_writer
            .sync_log_data()
            .map_err(|io_err| Error::io_error(io_err.to_string()))?;

        if let Some(manifest_number) = self.created_manifest {
            set_current_file(fs, paths, manifest_number)?;
        }
        Ok(())
    }
}

/// Point `CURRENT` at the given manifest, atomically.
fn set_current_file(
    fs:              &Arc<dyn Filesystem>,
    paths:           &TierPaths,
    manifest_number: FileNumber,
) -> Result<()> {
    let contents = format!("MANIFEST-{:06}\n", manifest_number.0);
    let temp_path = paths.temp_path(manifest_number);

    let mut temp = fs.open_writable(&temp_path)?;
    temp.append(contents.as_bytes())?;
    temp.sync_data()?;
    temp.close()?;

    fs.rename(&temp_path, &paths.current_path())?;
    Ok(())
}

// ================================================================
//  Shared core
// ================================================================

/// State common to both version-set flavours.
#[derive(Debug)]
pub(super) struct VersionSetCore {
    pub(super) deps:                 VersionStoreDeps,
    pub(super) log_number:           FileNumber,
    /// No longer written with a meaningful value, but still tracked for older manifests.
    pub(super) prev_log_number:      FileNumber,
    pub(super) next_file_number:     FileNumber,
    pub(super) manifest_file_number: FileNumber,
    pub(super) last_sequence:        SequenceNumber,
    pub(super) current:              Arc<Version>,
    pub(super) old_versions:         Vec<Weak<Version>>,
    /// `Some` except while a [`PendingApply`] is in flight.
    pub(super) manifest_writer:      Option<WriteLogWriter<Box<dyn WritableFile>>>,
    pub(super) compact_pointers:     Vec<Option<InternalKeyBuf>>,
}

/// What recovery reconstructed beyond the eager state.
pub(super) struct RecoveredLazyState {
    pub lazy_version: Version,
    pub delta_rings:  Vec<DeltaRing>,
}

impl VersionSetCore {
    pub fn new(deps: VersionStoreDeps) -> Self {
        Self {
            deps,
            log_number:           FileNumber::ZERO,
            prev_log_number:      FileNumber::ZERO,
            next_file_number:     FileNumber(2),
            manifest_file_number: FileNumber(1),
            last_sequence:        SequenceNumber::ZERO,
            current:              Arc::new(Version::new_empty(NUM_LEVELS_USIZE)),
            old_versions:         Vec::new(),
            manifest_writer:      None,
            compact_pointers:     (0..NUM_LEVELS_USIZE).map(|_| None).collect(),
        }
    }

    /// Create the on-disk skeleton of a fresh database: a manifest with one bootstrap
    /// record, and `CURRENT` pointing at it.
    pub fn create_db(&self) -> Result<()> {
        let mut edit = VersionEdit::new_empty();
        edit.comparator_name = Some(InternalComparator::NAME.to_owned());
        edit.log_number = Some(FileNumber::ZERO);
        edit.next_file_number = Some(FileNumber(2));
        edit.last_sequence = Some(SequenceNumber::ZERO);

        let manifest_number = FileNumber(1);
        let manifest_path = self.deps.paths.manifest_path(manifest_number);
        let file = self.deps.fs.open_writable(&manifest_path)?;
        let mut writer = WriteLogWriter::new_empty(file);

        let mut record = Vec::new();
        edit.encode(&mut record);
        let write_result = writer
            .add_record(&record)
            .map_err(|log_err| Error::io_error(log_err.to_string()))
            .and_then(|()| writer.sync_log_data().map_err(Error::from));

        match write_result {
            Ok(()) => set_current_file(&self.deps.fs, &self.deps.paths, manifest_number),
            Err(error) => {
                let _ = self.deps.fs.delete(&manifest_path);
                Err(error)
            }
        }
    }

    /// Replay the manifest named by `CURRENT`.
    ///
    /// `num_lazy_levels` of zero replays a basic database; otherwise lazy files and
    /// delta-ring offsets are reconstructed as well.
    pub fn recover(&mut self, num_lazy_levels: usize) -> Result<Option<RecoveredLazyState>> {
        let current_path = self.deps.paths.current_path();
        let contents = self.deps.fs.read_to_vec(&current_path).map_err(|io_err| {
            Error::new(ErrorKind::NotFound, format!("CURRENT unreadable: {io_err}"))
        })?;

        if contents.last() != Some(&b'\n') {
            return Err(Error::corruption("CURRENT file does not end with newline"));
        }
        let manifest_name = std::str::from_utf8(&contents[..contents.len() - 1])
            .map_err(|_| Error::corruption("CURRENT file is not valid UTF-8"))?;
        let manifest_path = self.deps.paths.meta_root().join(manifest_name);

        let manifest_file = self.deps.fs.open_sequential(&manifest_path)?;
        let mut reader = WriteLogReader::new(manifest_file);

        let eager_base = Arc::clone(&self.current);
        let mut eager_builder = VersionBuilder::new(&eager_base, true);
        let lazy_base = Version::new_empty(num_lazy_levels);
        let mut lazy_builder =
            (num_lazy_levels > 0).then(|| VersionBuilder::new(&lazy_base, false));
        let mut delta_rings =
            vec![DeltaRing::new(); usize::from(crate::levels::NUM_LEVELS / 2)];

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record() {
            let edit = VersionEdit::decode(&record, num_lazy_levels)?;

            if let Some(name) = &edit.comparator_name {
                if name != InternalComparator::NAME {
                    return Err(Error::invalid_argument(format!(
                        "{name} does not match existing comparator {}",
                        InternalComparator::NAME,
                    )));
                }
            }

            for (level, key) in &edit.compact_pointers {
                self.compact_pointers[level.index()] = Some(key.clone());
            }
            for (logical, ring) in &edit.delta_offsets {
                delta_rings[usize::from(logical.inner())] = *ring;
            }

            eager_builder.apply(
                edit.deleted_files.iter().map(|(level, num)| (level.index(), *num)),
                edit.new_files.iter().map(|(level, entry)| (level.index(), entry)),
                self.deps.policy.min_bytes_per_seek,
            );
            if let Some(lazy_builder) = lazy_builder.as_mut() {
                lazy_builder.apply(
                    edit.deleted_lazy_files.iter().map(|(level, num)| (level.index(), *num)),
                    edit.new_lazy_files.iter().map(|(level, entry)| (level.index(), entry)),
                    self.deps.policy.min_bytes_per_seek,
                );
            }

            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        if let Some(log_err) = reader.errors().first() {
            return Err(Error::corruption(format!("manifest replay: {log_err}")));
        }

        let Some(next_file_number) = next_file_number else {
            return Err(Error::corruption("no meta-nextfile entry in descriptor"));
        };
        let Some(log_number) = log_number else {
            return Err(Error::corruption("no meta-lognumber entry in descriptor"));
        };
        let Some(last_sequence) = last_sequence else {
            return Err(Error::corruption("no last-sequence-number entry in descriptor"));
        };
        let prev_log_number = prev_log_number.unwrap_or(FileNumber::ZERO);

        let mut recovered = eager_builder.save();
        recovered.finalize(&self.deps.policy);
        self.current = Arc::new(recovered);

        self.manifest_file_number = next_file_number;
        self.next_file_number = next_file_number.next();
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.last_sequence = last_sequence;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        Ok(lazy_builder.map(|lazy_builder| RecoveredLazyState {
            lazy_version: lazy_builder.save(),
            delta_rings,
        }))
    }

    pub fn prepare(
        &mut self,
        edit:      &mut VersionEdit,
        lazy_base: Option<&Arc<Version>>,
    ) -> Result<PendingApply> {
        edit.log_number.get_or_insert(self.log_number);
        edit.prev_log_number.get_or_insert(self.prev_log_number);
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[level.index()] = Some(key.clone());
        }

        let base = Arc::clone(&self.current);
        let mut builder = VersionBuilder::new(&base, true);
        builder.apply(
            edit.deleted_files.iter().map(|(level, num)| (level.index(), *num)),
            edit.new_files.iter().map(|(level, entry)| (level.index(), entry)),
            self.deps.policy.min_bytes_per_seek,
        );
        let mut new_version = builder.save();
        new_version.finalize(&self.deps.policy);

        let new_lazy_version = lazy_base.map(|lazy_base| {
            let mut lazy_builder = VersionBuilder::new(lazy_base, false);
            lazy_builder.apply(
                edit.deleted_lazy_files.iter().map(|(level, num)| (level.index(), *num)),
                edit.new_lazy_files.iter().map(|(level, entry)| (level.index(), entry)),
                self.deps.policy.min_bytes_per_seek,
            );
            lazy_builder.save()
        });

        // Create the descriptor on first use, seeding it with a full snapshot.
        let mut created_manifest = None;
        if self.manifest_writer.is_none() {
            let manifest_number = self.manifest_file_number;
            let manifest_path = self.deps.paths.manifest_path(manifest_number);
            let file = self.deps.fs.open_writable(&manifest_path)?;
            let mut writer = WriteLogWriter::new_empty(file);

            let snapshot = self.snapshot_edit(lazy_base.map(Arc::as_ref));
            let mut record = Vec::new();
            snapshot.encode(&mut record);
            if let Err(log_err) = writer.add_record(&record) {
                let _ = self.deps.fs.delete(&manifest_path);
                return Err(Error::io_error(log_err.to_string()));
            }

            self.manifest_writer = Some(writer);
            created_manifest = Some(manifest_number);
        }

        let manifest_writer = self.manifest_writer.take()
            .expect("apply->log->install must be strictly serialized");

        let mut encoded_record = Vec::new();
        edit.encode(&mut encoded_record);

        Ok(PendingApply {
            new_version,
            new_lazy_version,
            encoded_record,
            manifest_writer,
            created_manifest,
            log_number: edit.log_number.expect("set above"),
            prev_log_number: edit.prev_log_number.expect("set above"),
        })
    }

    /// Install the new current version; returns the new lazy version for the hybrid caller
    /// to chain in lock-step.
    pub fn install(&mut self, pending: PendingApply) -> Option<Version> {
        self.manifest_writer = Some(pending.manifest_writer);

        let old = std::mem::replace(&mut self.current, Arc::new(pending.new_version));
        self.old_versions.push(Arc::downgrade(&old));
        drop(old);
        self.collect_dead_versions();

        self.log_number = pending.log_number;
        self.prev_log_number = pending.prev_log_number;

        pending.new_lazy_version
    }

    pub fn abort(&mut self, pending: PendingApply) {
        if let Some(manifest_number) = pending.created_manifest {
            // The just-created manifest cannot be trusted; remove it so `CURRENT` never
            // points at a half-written descriptor. The previous version stays installed.
            drop(pending.manifest_writer);
            let manifest_path = self.deps.paths.manifest_path(manifest_number);
            let _ = self.deps.fs.delete(&manifest_path);
            self.manifest_writer = None;
        } else {
            self.manifest_writer = Some(pending.manifest_writer);
        }
    }

    fn snapshot_edit(&self, lazy: Option<&Version>) -> VersionEdit {
        let mut snapshot = VersionEdit::new_empty();
        snapshot.comparator_name = Some(InternalComparator::NAME.to_owned());

        for (index, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = pointer {
                let level = Level::try_from(index as u32).expect("pointer index is a level");
                snapshot.set_compact_pointer(level, key.clone());
            }
        }

        for level in Level::all_levels() {
            for file in self.current.level_files(level) {
                snapshot.add_file(
                    level,
                    file.file_number(),
                    file.file_size(),
                    file.smallest_key().to_buf(),
                    file.largest_key().to_buf(),
                );
            }
        }

        if let Some(lazy) = lazy {
            for index in 0..lazy.num_levels() {
                let lazy_level = crate::levels::LazyLevel::new(index, lazy.num_levels())
                    .expect("index is in range");
                for file in lazy.files_at(index) {
                    snapshot.add_lazy_file(
                        lazy_level,
                        file.file_number(),
                        file.file_size(),
                        file.smallest_key().to_buf(),
                        file.largest_key().to_buf(),
                    );
                }
            }
        }

        snapshot
    }

    pub fn new_file_number(&mut self) -> FileNumber {
        let file_number = self.next_file_number;
        self.next_file_number = self.next_file_number.next();
        file_number
    }

    pub fn reuse_file_number(&mut self, file_number: FileNumber) {
        if self.next_file_number.0.saturating_sub(1) == file_number.0 {
            self.next_file_number = file_number;
        }
    }

    pub fn mark_file_number_used(&mut self, file_number: FileNumber) {
        if self.next_file_number <= file_number {
            self.next_file_number = file_number.next();
        }
    }

    pub fn live_files_in(current: &Arc<Version>, old: &[Weak<Version>]) -> HashSet<FileNumber> {
        let mut live = HashSet::new();
        for index in 0..current.num_levels() {
            live.extend(current.files_at(index).iter().map(|file| file.file_number()));
        }
        for version in old.iter().filter_map(Weak::upgrade) {
            for index in 0..version.num_levels() {
                live.extend(version.files_at(index).iter().map(|file| file.file_number()));
            }
        }
        live
    }

    fn collect_dead_versions(&mut self) {
        if self.old_versions.len() > 8 {
            self.old_versions.retain(|version| version.strong_count() > 0);
        }
    }
}

// ================================================================
//  Basic flavour
// ================================================================

/// The version set of the non-hybrid modes: no lazy level space.
#[derive(Debug)]
pub(crate) struct BasicVersionSet {
    core: VersionSetCore,
}

impl BasicVersionSet {
    #[must_use]
    pub fn deps(&self) -> &VersionStoreDeps {
        &self.core.deps
    }

    pub fn bootstrap(deps: VersionStoreDeps) -> Result<Self> {
        let mut core = VersionSetCore::new(deps);

        if !core.deps.fs.exists(&core.deps.paths.current_path()) {
            if !core.deps.create_if_missing {
                return Err(Error::invalid_argument("database does not exist"));
            }
            core.create_db()?;
        }
        let recovered_lazy = core.recover(0)?;
        debug_assert!(recovered_lazy.is_none());

        Ok(Self { core })
    }
}

impl VersionStore for BasicVersionSet {
    fn is_hybrid(&self) -> bool {
        false
    }

    fn current(&self) -> Arc<Version> {
        Arc::clone(&self.core.current)
    }

    fn current_lazy(&self) -> Option<Arc<Version>> {
        None
    }

    fn new_edit(&self) -> VersionEdit {
        VersionEdit::new_empty()
    }

    fn prepare(&mut self, edit: &mut VersionEdit) -> Result<PendingApply> {
        self.core.prepare(edit, None)
    }

    fn install(&mut self, pending: PendingApply) {
        let lazy = self.core.install(pending);
        debug_assert!(lazy.is_none());
    }

    fn abort(&mut self, pending: PendingApply) {
        self.core.abort(pending);
    }

    fn log_number(&self) -> FileNumber {
        self.core.log_number
    }

    fn prev_log_number(&self) -> FileNumber {
        self.core.prev_log_number
    }

    fn manifest_file_number(&self) -> FileNumber {
        self.core.manifest_file_number
    }

    fn new_file_number(&mut self) -> FileNumber {
        self.core.new_file_number()
    }

    fn reuse_file_number(&mut self, file_number: FileNumber) {
        self.core.reuse_file_number(file_number);
    }

    fn mark_file_number_used(&mut self, file_number: FileNumber) {
        self.core.mark_file_number_used(file_number);
    }

    fn last_sequence(&self) -> SequenceNumber {
        self.core.last_sequence
    }

    fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(self.core.last_sequence <= sequence);
        self.core.last_sequence = sequence;
    }

    fn compact_pointer(&self, level: Level) -> Option<&InternalKeyBuf> {
        self.core.compact_pointers[level.index()].as_ref()
    }

    fn live_files(&self) -> HashSet<FileNumber> {
        VersionSetCore::live_files_in(&self.core.current, &self.core.old_versions)
    }
}


#[cfg(test)]
mod tests {
    use crate::config::{DbMode, EngineOptions};
    use crate::filesystem::MemoryFilesystem;
    use crate::format::EntryType;

    use super::*;


    fn test_deps() -> VersionStoreDeps {
        let options = EngineOptions::new(DbMode::Default, "/pri");
        let policy = TierPolicy::from_options(&options);
        VersionStoreDeps {
            fs:                Arc::new(MemoryFilesystem::new()),
            paths:             Arc::new(TierPaths::new(
                options.primary_path.clone(),
                options.secondary_path.clone(),
                &policy,
            )),
            policy:            Arc::new(policy),
            op_queue:          None,
            moving_tables:     Arc::new(Mutex::new(HashSet::new())),
            create_if_missing: true,
        }
    }

    fn key(user_key: &str, sequence: u64) -> InternalKeyBuf {
        InternalKeyBuf::new(
            user_key.as_bytes().to_vec(),
            SequenceNumber::new(sequence).unwrap(),
            EntryType::Value,
        )
    }

    fn log_and_apply(store: &mut BasicVersionSet, edit: &mut VersionEdit) {
        let mut pending = store.prepare(edit).unwrap();
        pending
            .write_to_manifest(&store.core.deps.fs.clone(), &store.core.deps.paths.clone())
            .unwrap();
        store.install(pending);
    }

    #[test]
    fn empty_database_reopens_empty() {
        let deps = test_deps();
        let store = BasicVersionSet::bootstrap(deps.clone()).unwrap();
        let current = store.current();
        for level in Level::all_levels() {
            assert!(current.level_files(level).is_empty());
        }
        drop(store);

        let store = BasicVersionSet::bootstrap(deps).unwrap();
        let current = store.current();
        for level in Level::all_levels() {
            assert!(current.level_files(level).is_empty());
        }
    }

    #[test]
    fn edits_survive_recovery() {
        let deps = test_deps();
        let mut store = BasicVersionSet::bootstrap(deps.clone()).unwrap();
        let level2 = Level::try_from(2_u8).unwrap();

        let file_number = store.new_file_number();
        let mut edit = store.new_edit();
        edit.add_file(level2, file_number, 4096, key("aa", 7), key("bb", 3));
        edit.set_compact_pointer(level2, key("bb", 3));
        log_and_apply(&mut store, &mut edit);

        store.set_last_sequence(SequenceNumber::new(99).unwrap());
        let mut second = store.new_edit();
        let second_file = store.new_file_number();
        second.add_file(level2, second_file, 4096, key("cc", 9), key("dd", 2));
        log_and_apply(&mut store, &mut second);

        drop(store);
        let store = BasicVersionSet::bootstrap(deps).unwrap();
        let current = store.current();

        let numbers: Vec<FileNumber> = current
            .level_files(level2)
            .iter()
            .map(|file| file.file_number())
            .collect();
        assert_eq!(numbers, vec![file_number, second_file]);
        assert_eq!(store.last_sequence(), SequenceNumber::new(99).unwrap());
        assert!(store.compact_pointer(level2).is_some());

        // File numbers keep counting past everything recovered.
        let live = store.live_files();
        assert!(live.contains(&file_number) && live.contains(&second_file));
    }

    #[test]
    fn failed_manifest_write_keeps_previous_version(){
        let deps = test_deps();
        let mut store = BasicVersionSet::bootstrap(deps).unwrap();
        let level1 = Level::ONE;

        let file_number = store.new_file_number();
        let mut edit = store.new_edit();
        edit.add_file(level1, file_number, 512, key("k", 1), key("l", 1));

        let pending = store.prepare(&mut edit).unwrap();
        // Pretend the disk write failed.
        store.abort(pending);

        assert!(store.current().level_files(level1).is_empty());
        assert!(store.live_files().is_empty());
    }
}
