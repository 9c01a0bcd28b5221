use std::{collections::HashSet, sync::Arc, sync::Weak};

use tracing::debug;

use crate::{
    error::{Error, Result},
    filesystem::Filesystem as _,
    format::{FileNumber, InternalKeyBuf, SequenceNumber},
    levels::{DeltaRing, LazyLevel, Level, LogicalLevel},
    pipeline::enqueue_copy_file,
};

use super::{
    edit::{NewFileEntry, VersionEdit},
    set::{LazyUpdate, PendingApply, VersionSetCore, VersionStore, VersionStoreDeps},
    version_struct::Version,
};


/// The hybrid version set: the eager chain of [`BasicVersionSet`](super::BasicVersionSet)
/// semantics plus a parallel chain of lazy versions modelling the secondary tier, advanced
/// in lock-step by every installed edit.
#[derive(Debug)]
pub(crate) struct LazyVersionSet {
    core:            VersionSetCore,
    current_lazy:    Arc<Version>,
    old_lazy:        Vec<Weak<Version>>,
    /// One delta ring per logical level.
    delta_rings:     Vec<DeltaRing>,
    num_lazy_levels: usize,
}

impl LazyVersionSet {
    pub fn bootstrap(deps: VersionStoreDeps) -> Result<Self> {
        let num_lazy_levels = deps.policy.num_lazy_levels();
        debug_assert!(num_lazy_levels > 0, "the lazy version set requires hybrid mode");

        let mut core = VersionSetCore::new(deps);
        if !core.deps.fs.exists(&core.deps.paths.current_path()) {
            if !core.deps.create_if_missing {
                return Err(Error::invalid_argument("database does not exist"));
            }
            core.create_db()?;
        }

        let recovered = core
            .recover(num_lazy_levels)?
            .expect("recover reconstructs lazy state when lazy levels are requested");

        let ring_size = core.deps.policy.delta_ring_size;
        if recovered.delta_rings.iter().any(|ring| !ring.is_valid(ring_size)) {
            return Err(Error::corruption("recovered delta-ring offsets out of range"));
        }

        Ok(Self {
            core,
            current_lazy: Arc::new(recovered.lazy_version),
            old_lazy: Vec::new(),
            delta_rings: recovered.delta_rings,
            num_lazy_levels,
        })
    }

    fn ring_size(&self) -> u32 {
        self.core.deps.policy.delta_ring_size
    }

    fn two_phase_end(&self) -> u8 {
        self.core.deps.policy.two_phase_end_level
            .expect("hybrid mode always sets a two-phase end level")
    }

    fn lazy_level(&self, index: usize) -> LazyLevel {
        LazyLevel::new(index, self.num_lazy_levels)
            .expect("computed lazy index is within the configured bound")
    }

    /// The lazy index of a logical level's active delta slot, where freshly arrived files
    /// from above are staged.
    fn active_slot_index(&self, logical: LogicalLevel) -> usize {
        let ring = &self.delta_rings[usize::from(logical.inner())];
        self.core.deps.policy.lazy_index_for_slot(logical, ring.active_slot())
    }

    fn add_entry_lazy(&self, edit: &mut VersionEdit, index: usize, entry: &NewFileEntry) {
        edit.add_lazy_file(
            self.lazy_level(index),
            entry.file_number,
            entry.file_size,
            entry.smallest.clone(),
            entry.largest.clone(),
        );
    }

    /// Queue the asynchronous cross-tier copy of one table file, marking it in flight so
    /// the sweeper defers deletion until the copy lands.
    fn enqueue_roll(&self, file_number: FileNumber) {
        let Some(queue) = &self.core.deps.op_queue else {
            debug!("no op queue; {file_number:?} roll skipped");
            return;
        };
        enqueue_copy_file(
            queue,
            &self.core.deps.moving_tables,
            self.core.deps.paths.table_path(file_number),
            file_number,
        );
    }
}

impl VersionStore for LazyVersionSet {
    fn is_hybrid(&self) -> bool {
        true
    }

    fn current(&self) -> Arc<Version> {
        Arc::clone(&self.core.current)
    }

    fn current_lazy(&self) -> Option<Arc<Version>> {
        Some(Arc::clone(&self.current_lazy))
    }

    fn new_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new_empty();
        for logical in LogicalLevel::all_logical_levels() {
            edit.delta_offsets.push((logical, self.delta_rings[usize::from(logical.inner())]));
        }
        edit
    }

    fn prepare(&mut self, edit: &mut VersionEdit) -> Result<PendingApply> {
        // Re-snapshot the ring offsets: lazy-level updates since `new_edit` may have
        // advanced them, and the persisted record must match the state being installed.
        edit.delta_offsets.clear();
        for logical in LogicalLevel::all_logical_levels() {
            edit.delta_offsets.push((logical, self.delta_rings[usize::from(logical.inner())]));
        }
        self.core.prepare(edit, Some(&self.current_lazy))
    }

    fn install(&mut self, pending: PendingApply) {
        let lazy = self.core.install(pending)
            .expect("a hybrid prepare always builds a lazy version");
        let old = std::mem::replace(&mut self.current_lazy, Arc::new(lazy));
        self.old_lazy.push(Arc::downgrade(&old));
        drop(old);
        if self.old_lazy.len() > 8 {
            self.old_lazy.retain(|version| version.strong_count() > 0);
        }
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

    fn live_lazy_files(&self) -> HashSet<FileNumber> {
        VersionSetCore::live_files_in(&self.current_lazy, &self.old_lazy)
    }

    fn num_lazy_levels(&self) -> usize {
        self.num_lazy_levels
    }

    fn delta_ring(&self, logical: LogicalLevel) -> Option<DeltaRing> {
        self.delta_rings.get(usize::from(logical.inner())).copied()
    }

    fn advance_active_delta_level(&mut self, logical: LogicalLevel) {
        let ring_size = self.ring_size();
        let ring = &mut self.delta_rings[usize::from(logical.inner())];

        // Never overwrite pending work: promote until the advance fits. Each promotion
        // reclaims the slots up to `clear`, so this terminates within one lap of the ring.
        for _ in 0..=ring_size {
            if ring.advance_active(ring_size).is_ok() {
                debug_assert!(ring.offsets().2 != ring.offsets().0);
                return;
            }
            ring.roll_forward(ring_size);
        }
    }

    /// Mirror a compaction's level transitions into the lazy space (the secondary tier's
    /// view), per band:
    ///
    /// - Out of level 0, outputs land in logical level 1's active delta slot.
    /// - Within the top logical level, a left-to-right move swaps the file between the lazy
    ///   image of physical level 1 and the active delta slot.
    /// - Through the middle band, a moved file is queued for its cross-tier copy and staged
    ///   in the target's "new" pseudo-slot until merged.
    /// - At the two-phase boundary and below, the secondary tier is authoritative: inputs
    ///   and outputs rewrite the pure-mirror levels directly.
    fn update_lazy_levels(&mut self, update: LazyUpdate<'_>) -> Result<()> {
        let LazyUpdate {
            level,
            edit,
            inputs_base,
            inputs_parent,
            outputs,
        } = update;

        let logical = level.logical().inner();
        let two_phase_end = self.two_phase_end();
        let logical_one = LogicalLevel::new(1);

        if level == Level::ZERO {
            let active = self.active_slot_index(logical_one);
            for entry in outputs {
                self.add_entry_lazy(edit, active, entry);
            }
            if !outputs.is_empty() {
                self.advance_active_delta_level(logical_one);
            }
        } else if logical == 0 {
            // A single-file move from the left half of the top logical level.
            let lazy_level_one = self.lazy_level(Level::ONE.index());
            for file in inputs_base {
                edit.delete_lazy_file(lazy_level_one, file.file_number());
            }
            let active = self.active_slot_index(logical_one);
            for entry in outputs {
                self.add_entry_lazy(edit, active, entry);
            }
        } else if logical < two_phase_end {
            let target = level.next_level().ok_or_else(|| {
                Error::invalid_argument(format!("compaction at the top level {level:?}"))
            })?;
            let staging = self.core.deps.policy.new_pseudo_slot_index(target.logical());
            for entry in outputs {
                self.enqueue_roll(entry.file_number);
                self.add_entry_lazy(edit, staging, entry);
            }
        } else if logical == two_phase_end {
            let target = level.next_level().ok_or_else(|| {
                Error::invalid_argument(format!("compaction at the top level {level:?}"))
            })?;
            let mirror = self.core.deps.policy.pure_mirror_index(target);
            let mirror_level = self.lazy_level(mirror);
            for file in inputs_base.iter().chain(inputs_parent) {
                edit.delete_lazy_file(mirror_level, file.file_number());
            }
            for entry in outputs {
                self.add_entry_lazy(edit, mirror, entry);
            }
        } else {
            let target = level.next_level().ok_or_else(|| {
                Error::invalid_argument(format!("compaction at the top level {level:?}"))
            })?;
            let base_mirror = self.lazy_level(self.core.deps.policy.pure_mirror_index(level));
            let parent_mirror = self.lazy_level(self.core.deps.policy.pure_mirror_index(target));
            for file in inputs_base {
                edit.delete_lazy_file(base_mirror, file.file_number());
            }
            for file in inputs_parent {
                edit.delete_lazy_file(parent_mirror, file.file_number());
            }
            let parent_index = parent_mirror.index();
            for entry in outputs {
                self.add_entry_lazy(edit, parent_index, entry);
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use crate::config::{DbMode, EngineOptions, TierPolicy};
    use crate::database_files::TierPaths;
    use crate::filesystem::{Filesystem, MemoryFilesystem};
    use crate::format::EntryType;
    use crate::pipeline::OpQueue;

    use super::*;


    fn test_deps() -> VersionStoreDeps {
        let options = EngineOptions::new(DbMode::HLsm, "/pri").with_secondary("/sec");
        let policy = TierPolicy::from_options(&options);
        let fs = MemoryFilesystem::new();
        fs.create_dir_all(std::path::Path::new("/pri")).unwrap();
        VersionStoreDeps {
            fs:                Arc::new(fs),
            paths:             Arc::new(TierPaths::new(
                options.primary_path.clone(),
                options.secondary_path.clone(),
                &policy,
            )),
            policy:            Arc::new(policy),
            op_queue:          Some(Arc::new(OpQueue::new())),
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

    fn entry(number: u64) -> NewFileEntry {
        NewFileEntry {
            file_number: FileNumber(number),
            file_size:   4096,
            smallest:    key("a", 2),
            largest:     key("b", 1),
        }
    }

    fn apply(store: &mut LazyVersionSet, edit: &mut VersionEdit) {
        let fs = Arc::clone(&store.core.deps.fs);
        let paths = Arc::clone(&store.core.deps.paths);
        let mut pending = store.prepare(edit).unwrap();
        pending.write_to_manifest(&fs, &paths).unwrap();
        store.install(pending);
    }

    #[test]
    fn flush_stages_into_the_active_delta_slot() {
        let mut store = LazyVersionSet::bootstrap(test_deps()).unwrap();
        let before = store.delta_ring(LogicalLevel::new(1)).unwrap();
        let staged_index = store.active_slot_index(LogicalLevel::new(1));

        let mut edit = store.new_edit();
        edit.add_file(Level::ZERO, FileNumber(11), 4096, key("a", 2), key("b", 1));
        store
            .update_lazy_levels(LazyUpdate {
                level:         Level::ZERO,
                edit:          &mut edit,
                inputs_base:   &[],
                inputs_parent: &[],
                outputs:       &[entry(11)],
            })
            .unwrap();
        apply(&mut store, &mut edit);

        // The file landed in what was the active slot, and the ring advanced past it.
        let lazy = store.current_lazy().unwrap();
        assert_eq!(lazy.files_at(staged_index).len(), 1);
        let after = store.delta_ring(LogicalLevel::new(1)).unwrap();
        assert_ne!(before.active_slot(), after.active_slot());
        assert_ne!(after.offsets().2, after.offsets().0);
    }

    #[test]
    fn middle_band_move_queues_a_cross_tier_copy() {
        let mut store = LazyVersionSet::bootstrap(test_deps()).unwrap();
        let queue = Arc::clone(store.core.deps.op_queue.as_ref().unwrap());
        let moving = Arc::clone(&store.core.deps.moving_tables);

        // A trivial move out of physical level 3 (logical 1, inside the two-phase band).
        let level3 = Level::try_from(3_u8).unwrap();
        let mut edit = store.new_edit();
        store
            .update_lazy_levels(LazyUpdate {
                level:         level3,
                edit:          &mut edit,
                inputs_base:   &[],
                inputs_parent: &[],
                outputs:       &[entry(21)],
            })
            .unwrap();

        assert_eq!(queue.queued(), 1);
        assert!(moving.lock().contains(&FileNumber(21)));

        // The staged file sits in the target logical level's "new" pseudo-slot.
        let staging = store.core.deps.policy.new_pseudo_slot_index(LogicalLevel::new(2));
        assert!(edit.new_lazy_files.iter().any(|(lazy, entry)| {
            lazy.index() == staging && entry.file_number == FileNumber(21)
        }));
    }

    #[test]
    fn bottom_band_rewrites_pure_mirror_levels() {
        let mut store = LazyVersionSet::bootstrap(test_deps()).unwrap();

        // Physical level 11 is past the two-phase boundary (logical 5 > 4).
        let level11 = Level::try_from(11_u8).unwrap();
        let mut edit = store.new_edit();
        store
            .update_lazy_levels(LazyUpdate {
                level:         level11,
                edit:          &mut edit,
                inputs_base:   &[],
                inputs_parent: &[],
                outputs:       &[entry(31)],
            })
            .unwrap();

        let mirror = store.core.deps.policy.pure_mirror_index(
            Level::try_from(12_u8).unwrap(),
        );
        assert!(edit.new_lazy_files.iter().any(|(lazy, entry)| {
            lazy.index() == mirror && entry.file_number == FileNumber(31)
        }));
        // No cross-tier copy: the data already lives on the secondary.
        assert_eq!(store.core.deps.op_queue.as_ref().unwrap().queued(), 0);
    }

    #[test]
    fn lazy_state_survives_recovery() {
        let deps = test_deps();
        let mut store = LazyVersionSet::bootstrap(deps.clone()).unwrap();

        let mut edit = store.new_edit();
        edit.add_file(Level::ZERO, FileNumber(41), 4096, key("a", 2), key("b", 1));
        store
            .update_lazy_levels(LazyUpdate {
                level:         Level::ZERO,
                edit:          &mut edit,
                inputs_base:   &[],
                inputs_parent: &[],
                outputs:       &[entry(41)],
            })
            .unwrap();
        apply(&mut store, &mut edit);

        let ring_before = store.delta_ring(LogicalLevel::new(1)).unwrap();
        let lazy_live_before = store.live_lazy_files();
        drop(store);

        let store = LazyVersionSet::bootstrap(deps).unwrap();
        assert_eq!(store.delta_ring(LogicalLevel::new(1)).unwrap(), ring_before);
        assert_eq!(store.live_lazy_files(), lazy_live_before);
    }
}
