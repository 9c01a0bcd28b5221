use std::sync::Arc;
use std::cmp::Ordering;

use crate::{
    config::TierPolicy,
    format::{InternalComparator, UserKey},
    levels::Level,
    version::{SharedFileMetadata, Version, VersionStore},
};


/// A picked compaction task: the target level, the input file sets of `level` and
/// `level + 1`, and a reference to the version the inputs were chosen from (which keeps
/// every input file alive for the duration).
#[derive(Debug)]
pub(crate) struct Compaction {
    pub level:         Level,
    pub inputs:        [Vec<SharedFileMetadata>; 2],
    pub input_version: Arc<Version>,
    /// Whether this task came from an exhausted seek budget rather than a size trigger.
    pub seek_driven:   bool,
}

impl Compaction {
    /// The level compaction outputs land on.
    #[must_use]
    pub fn target_level(&self) -> Level {
        self.level.next_level().expect("the planner never picks the greatest level")
    }

    /// A move that relabels a single file without reading it: the source is a left half
    /// (or the cursor is off entirely) and nothing in the target level overlaps.
    #[must_use]
    pub fn is_trivial_move(&self, policy: &TierPolicy) -> bool {
        let cursor_allows = !policy.use_cursor_compaction || self.level.is_left_half();
        cursor_allows && self.inputs[0].len() == 1 && self.inputs[1].is_empty()
    }

    /// A cursor move of an entire right half into the empty left half below it.
    #[must_use]
    pub fn is_whole_level_move(&self, policy: &TierPolicy) -> bool {
        policy.use_cursor_compaction
            && !self.seek_driven
            && self.level > Level::ZERO
            && !self.level.is_left_half()
            && self.input_version.level_files(self.target_level()).is_empty()
    }

    /// The union of both input sets' user-key range.
    #[must_use]
    pub fn user_key_range(&self, cmp: &InternalComparator) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut smallest: Option<&[u8]> = None;
        let mut largest: Option<&[u8]> = None;

        for file in self.inputs.iter().flatten() {
            let file_smallest = file.smallest_user_key().0;
            let file_largest = file.largest_user_key().0;
            if smallest.is_none_or(|current| {
                cmp.cmp_user(UserKey(file_smallest), UserKey(current)) == Ordering::Less
            }) {
                smallest = Some(file_smallest);
            }
            if largest.is_none_or(|current| {
                cmp.cmp_user(UserKey(file_largest), UserKey(current)) == Ordering::Greater
            }) {
                largest = Some(file_largest);
            }
        }

        Some((smallest?.to_vec(), largest?.to_vec()))
    }
}

/// Pick the next compaction, preferring size triggers over seek triggers.
///
/// Returns `None` when no work is needed.
pub(crate) fn pick_compaction(
    store:          &dyn VersionStore,
    cmp:            &InternalComparator,
    seek_candidate: Option<(Level, SharedFileMetadata)>,
) -> Option<Compaction> {
    let version = store.current();

    let size_compaction = version.compaction_score() >= 1.0;
    let mut compaction = if size_compaction {
        let level = version.compaction_level()?;
        let files = version.level_files(level);
        if files.is_empty() {
            return None;
        }

        // Round-robin: the first file past the level's compaction pointer, wrapping to the
        // start of the key space when nothing is past it.
        let picked = store
            .compact_pointer(level)
            .and_then(|pointer| {
                files.iter().find(|file| {
                    cmp.cmp_internal(file.largest_key(), pointer.as_key()) == Ordering::Greater
                })
            })
            .unwrap_or(&files[0]);

        Compaction {
            level,
            inputs: [vec![Arc::clone(picked)], Vec::new()],
            input_version: Arc::clone(&version),
            seek_driven: false,
        }
    } else if let Some((level, file)) = seek_candidate {
        if level.next_level().is_none() {
            return None;
        }
        Compaction {
            level,
            inputs: [vec![file], Vec::new()],
            input_version: Arc::clone(&version),
            seek_driven: true,
        }
    } else {
        return None;
    };

    // Level-0 files may overlap: every one of them is an input.
    if compaction.level == Level::ZERO {
        compaction.inputs[0] = version.level_files(Level::ZERO).to_vec();
        debug_assert!(!compaction.inputs[0].is_empty());
    }

    setup_other_inputs(&mut compaction, cmp);
    Some(compaction)
}

/// Grow the selected input set to a closed key range, then include every file in the next
/// level that overlaps that range.
pub(crate) fn setup_other_inputs(compaction: &mut Compaction, cmp: &InternalComparator) {
    let Some((smallest, largest)) = compaction.user_key_range(cmp) else {
        return;
    };

    // Close the range within the source level first: a neighbour sharing a boundary user
    // key must compact together with the picked file.
    let closed = compaction.input_version.overlapping_inputs(
        cmp,
        compaction.level,
        UserKey(&smallest),
        UserKey(&largest),
    );
    if closed.len() > compaction.inputs[0].len() {
        compaction.inputs[0] = closed;
    }

    let Some((smallest, largest)) = compaction.user_key_range(cmp) else {
        return;
    };
    compaction.inputs[1] = compaction.input_version.overlapping_inputs(
        cmp,
        compaction.target_level(),
        UserKey(&smallest),
        UserKey(&largest),
    );
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;

    use crate::config::{DbMode, EngineOptions, TierPolicy};
    use crate::database_files::TierPaths;
    use crate::filesystem::MemoryFilesystem;
    use crate::format::{EntryType, FileNumber, InternalKeyBuf, SequenceNumber};
    use crate::version::{BasicVersionSet, VersionStoreDeps};

    use super::*;


    fn bootstrap(mode: DbMode) -> BasicVersionSet {
        let mut options = EngineOptions::new(mode, "/pri");
        if mode != DbMode::Default && mode != DbMode::BLsm {
            options = options.with_secondary("/sec");
        }
        let policy = TierPolicy::from_options(&options);
        let deps = VersionStoreDeps {
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
        };
        BasicVersionSet::bootstrap(deps).unwrap()
    }

    fn key(user_key: &str, sequence: u64) -> InternalKeyBuf {
        InternalKeyBuf::new(
            user_key.as_bytes().to_vec(),
            SequenceNumber::new(sequence).unwrap(),
            EntryType::Value,
        )
    }

    fn apply_edit(store: &mut BasicVersionSet, edit: &mut crate::version::VersionEdit) {
        let mut pending = store.prepare(edit).unwrap();
        // The version machinery is exercised elsewhere; commit straight to the manifest.
        pending
            .write_to_manifest(&test_fs(store), &test_paths(store))
            .unwrap();
        store.install(pending);
    }

    fn test_fs(store: &BasicVersionSet) -> Arc<dyn crate::filesystem::Filesystem> {
        Arc::clone(&deps_of(store).fs)
    }

    fn test_paths(store: &BasicVersionSet) -> Arc<TierPaths> {
        Arc::clone(&deps_of(store).paths)
    }

    fn deps_of(store: &BasicVersionSet) -> &VersionStoreDeps {
        store.deps()
    }

    #[test]
    fn level0_compaction_takes_every_file() {
        let mut store = bootstrap(DbMode::Default);
        let cmp = InternalComparator;

        let mut edit = store.new_edit();
        for number in 0..4_u64 {
            edit.add_file(
                Level::ZERO,
                FileNumber(10 + number),
                1 << 20,
                key("aaa", 40 + number),
                key("zzz", 4 + number),
            );
        }
        apply_edit(&mut store, &mut edit);

        let compaction = pick_compaction(&store, &cmp, None).unwrap();
        assert_eq!(compaction.level, Level::ZERO);
        assert_eq!(compaction.inputs[0].len(), 4);
        assert!(!compaction.seek_driven);
    }

    #[test]
    fn round_robin_follows_the_compaction_pointer() {
        let mut store = bootstrap(DbMode::Default);
        let cmp = InternalComparator;

        // Fill level 1 past its byte budget with disjoint files.
        let mut edit = store.new_edit();
        edit.add_file(Level::ONE, FileNumber(21), 6 << 20, key("a", 9), key("b", 1));
        edit.add_file(Level::ONE, FileNumber(22), 6 << 20, key("c", 9), key("d", 1));
        edit.set_compact_pointer(Level::ONE, key("b", 1));
        apply_edit(&mut store, &mut edit);

        let compaction = pick_compaction(&store, &cmp, None).unwrap();
        assert_eq!(compaction.level, Level::ONE);
        // The pointer sits at "b": the next file past it is 22.
        assert_eq!(compaction.inputs[0][0].file_number(), FileNumber(22));
    }

    #[test]
    fn seek_candidate_is_picked_when_sizes_are_fine() {
        let mut store = bootstrap(DbMode::Default);
        let cmp = InternalComparator;

        let mut edit = store.new_edit();
        edit.add_file(Level::ONE, FileNumber(31), 1024, key("a", 9), key("b", 1));
        apply_edit(&mut store, &mut edit);

        let candidate = Arc::clone(&store.current().level_files(Level::ONE)[0]);
        let compaction = pick_compaction(&store, &cmp, Some((Level::ONE, candidate))).unwrap();
        assert!(compaction.seek_driven);
        assert_eq!(compaction.inputs[0].len(), 1);
    }

    #[test]
    fn cursor_move_predicates() {
        let options = EngineOptions::new(DbMode::BLsm, "/pri");
        let policy = TierPolicy::from_options(&options);
        let version = Arc::new(Version::new_empty(crate::levels::NUM_LEVELS_USIZE));

        let level2 = Level::try_from(2_u8).unwrap();
        let level3 = Level::try_from(3_u8).unwrap();

        let whole_level = Compaction {
            level:         level2,
            inputs:        [Vec::new(), Vec::new()],
            input_version: Arc::clone(&version),
            seek_driven:   false,
        };
        assert!(whole_level.is_whole_level_move(&policy));
        assert!(!whole_level.is_trivial_move(&policy));

        let file = Arc::new(crate::version::FileMetadata::new(
            FileNumber(7),
            1024,
            key("a", 2),
            key("b", 1),
            16 * 1024,
        ));
        let trivial = Compaction {
            level:         level3,
            inputs:        [vec![file], Vec::new()],
            input_version: version,
            seek_driven:   false,
        };
        assert!(trivial.is_trivial_move(&policy));
        assert!(!trivial.is_whole_level_move(&policy));
    }
}
