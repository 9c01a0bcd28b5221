use std::cmp::Ordering;

use crate::{
    config::TierPolicy,
    format::{InternalComparator, InternalKey, UserKey},
    levels::{L0_COMPACTION_TRIGGER, L0_STOP_WRITE_TRIGGER, Level, NUM_LEVELS_USIZE},
};

use super::file_metadata::SharedFileMetadata;


#[must_use]
pub(crate) fn total_file_size(files: &[SharedFileMetadata]) -> u64 {
    files.iter().map(|file| file.file_size()).sum()
}

/// An immutable snapshot of the set of live files per level.
///
/// Eager versions always have [`NUM_LEVELS_USIZE`] levels; the parallel lazy versions of the
/// hybrid mode size their level vector by the configured lazy-level count.
#[derive(Debug)]
pub(crate) struct Version {
    files:            Vec<Vec<SharedFileMetadata>>,
    /// Best size-compaction score across all levels, computed by [`Version::finalize`].
    compaction_score: f64,
    compaction_level: Option<Level>,
}

impl Version {
    #[must_use]
    pub fn new_empty(num_levels: usize) -> Self {
        Self {
            files:            (0..num_levels).map(|_| Vec::new()).collect(),
            compaction_score: 0.0,
            compaction_level: None,
        }
    }

    #[must_use]
    pub(super) fn new(files: Vec<Vec<SharedFileMetadata>>) -> Self {
        Self {
            files,
            compaction_score: 0.0,
            compaction_level: None,
        }
    }

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn files_at(&self, index: usize) -> &[SharedFileMetadata] {
        &self.files[index]
    }

    #[must_use]
    pub fn level_files(&self, level: Level) -> &[SharedFileMetadata] {
        &self.files[level.index()]
    }

    #[must_use]
    pub const fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    #[must_use]
    pub const fn compaction_level(&self) -> Option<Level> {
        self.compaction_level
    }

    /// Compute the compaction score for every level and remember the best.
    ///
    /// A score of one or more means the level is due for a size-triggered compaction. The
    /// greatest level never scores: it has nowhere to push data.
    pub fn finalize(&mut self, policy: &TierPolicy) {
        debug_assert_eq!(self.files.len(), NUM_LEVELS_USIZE);

        let mut best_level = None;
        let mut best_score = -1.0_f64;

        for level in Level::all_levels().take(NUM_LEVELS_USIZE - 1) {
            let score = if policy.use_cursor_compaction {
                self.cursor_score(level, policy)
            } else {
                self.classic_score(level, policy)
            };

            if score > best_score {
                best_level = Some(level);
                best_score = score;
            }
        }

        self.compaction_score = best_score;
        self.compaction_level = best_level;
    }

    fn classic_score(&self, level: Level, policy: &TierPolicy) -> f64 {
        if level == Level::ZERO {
            // Level 0 is bounded by file count instead of size in bytes: its files may
            // overlap, so every extra file taxes every read.
            self.level_files(Level::ZERO).len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            total_file_size(self.level_files(level)) as f64 / policy.max_bytes_for_level(level)
        }
    }

    /// The cursor variant. Let `L` be the physical level of logical level `k`:
    ///
    /// - Level 0 scores only while level 1 (its left half) is empty, enforcing a whole-level
    ///   move out of level 0.
    /// - Level 1 pairs its byte budget with level 0's stop-write file count.
    /// - An odd `L > 1` (a left half) takes the worse of itself and its right half, so a
    ///   full right half drives the left half down first.
    /// - An even `L > 0` (a right half) is suppressed entirely while its left half holds
    ///   data, and scores alone otherwise.
    fn cursor_score(&self, level: Level, policy: &TierPolicy) -> f64 {
        let bytes_score = |level: Level| {
            total_file_size(self.level_files(level)) as f64 / policy.max_bytes_for_level(level)
        };

        if level == Level::ZERO {
            let level0_len = self.level_files(Level::ZERO).len();
            if level0_len >= L0_COMPACTION_TRIGGER && self.level_files(Level::ONE).is_empty() {
                level0_len as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                0.0
            }
        } else if self.level_files(level).is_empty() {
            0.0
        } else if level == Level::ONE {
            let level0_len = self.level_files(Level::ZERO).len();
            bytes_score(level).max(level0_len as f64 / L0_STOP_WRITE_TRIGGER as f64)
        } else if level.is_left_half() {
            let right_half = Level::try_from(level.inner() - 1).expect("level - 1 is valid");
            bytes_score(level).max(bytes_score(right_half))
        } else {
            let left_half = level.next_level().expect("even level below the top has a next");
            if self.level_files(left_half).is_empty() {
                bytes_score(level)
            } else {
                // The left half compacts first; suppress the right half until it is empty.
                0.0
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn push_file_for_tests(&mut self, index: usize, file: SharedFileMetadata) {
        self.files[index].push(file);
    }

    // ================================================================
    //  Key-range queries
    // ================================================================

    /// Binary search for the first file whose largest key is at or past `key`.
    ///
    /// Only meaningful for levels whose files are disjoint and sorted.
    #[must_use]
    pub fn find_file(
        cmp:   &InternalComparator,
        files: &[SharedFileMetadata],
        key:   InternalKey<'_>,
    ) -> Option<usize> {
        let mut left = 0_usize;
        let mut right = files.len();
        while left < right {
            let mid = (left + right) / 2;
            if cmp.cmp_internal(files[mid].largest_key(), key) == Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        (left < files.len()).then_some(left)
    }

    /// Every file in `level` whose user-key range touches `[smallest, largest]`.
    ///
    /// For level 0 the search range grows to cover overlapping files, since level-0 files
    /// may overlap each other; a compaction there must absorb every transitive overlap.
    #[must_use]
    pub fn overlapping_inputs(
        &self,
        cmp:      &InternalComparator,
        level:    Level,
        smallest: UserKey<'_>,
        largest:  UserKey<'_>,
    ) -> Vec<SharedFileMetadata> {
        let mut begin = smallest.0.to_vec();
        let mut end = largest.0.to_vec();
        let files = self.level_files(level);
        let mut inputs: Vec<SharedFileMetadata> = Vec::new();

        let mut index = 0_usize;
        while index < files.len() {
            let file = &files[index];
            index += 1;

            if cmp.cmp_user(file.largest_user_key(), UserKey(&begin)) == Ordering::Less
                || cmp.cmp_user(file.smallest_user_key(), UserKey(&end)) == Ordering::Greater
            {
                continue;
            }

            if level == Level::ZERO {
                // Level-0 files may overlap each other: restart with a widened range.
                let mut restart = false;
                if cmp.cmp_user(file.smallest_user_key(), UserKey(&begin)) == Ordering::Less {
                    begin = file.smallest_user_key().0.to_vec();
                    restart = true;
                }
                if cmp.cmp_user(file.largest_user_key(), UserKey(&end)) == Ordering::Greater {
                    end = file.largest_user_key().0.to_vec();
                    restart = true;
                }
                if restart {
                    inputs.clear();
                    index = 0;
                    continue;
                }
            }

            inputs.push(SharedFileMetadata::clone(file));
        }

        inputs
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{DbMode, EngineOptions};
    use crate::format::{EntryType, FileNumber, InternalKeyBuf, SequenceNumber};

    use super::super::file_metadata::FileMetadata;
    use super::*;


    fn file(number: u64, size: u64, smallest: &str, largest: &str) -> SharedFileMetadata {
        Arc::new(FileMetadata::new(
            FileNumber(number),
            size,
            InternalKeyBuf::new(
                smallest.as_bytes().to_vec(),
                SequenceNumber::new(10).unwrap(),
                EntryType::Value,
            ),
            InternalKeyBuf::new(
                largest.as_bytes().to_vec(),
                SequenceNumber::new(5).unwrap(),
                EntryType::Value,
            ),
            16 * 1024,
        ))
    }

    fn cursor_policy() -> TierPolicy {
        // level0_size of 10 MB gives every low level a 10 MiB budget in cursor mode.
        TierPolicy::from_options(
            &EngineOptions::new(DbMode::HLsm, "/pri").with_secondary("/sec"),
        )
    }

    const MIB: u64 = 1 << 20;

    #[test]
    fn cursor_score_parity() {
        // Level 2 holds 5 MiB, level 3 holds 6 MiB, both with a 10 MiB budget.
        let mut version = Version::new_empty(NUM_LEVELS_USIZE);
        version.files[2].push(file(1, 5 * MIB, "a", "b"));
        version.files[3].push(file(2, 6 * MIB, "c", "d"));

        let policy = cursor_policy();

        // Level 3 is a left half: max(6/10, 5/10) = 0.6.
        let score3 = version.cursor_score(Level::try_from(3_u8).unwrap(), &policy);
        assert!((score3 - 0.6).abs() < 1e-9);

        // Level 2 is a right half with a nonempty left half above: suppressed.
        let score2 = version.cursor_score(Level::try_from(2_u8).unwrap(), &policy);
        assert!(score2.abs() < 1e-9);

        version.finalize(&policy);
        assert_eq!(version.compaction_level(), Some(Level::try_from(3_u8).unwrap()));
        assert!((version.compaction_score() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn cursor_level0_waits_for_empty_level1() {
        let policy = cursor_policy();
        let mut version = Version::new_empty(NUM_LEVELS_USIZE);
        for number in 0..4 {
            version.files[0].push(file(number, MIB, "a", "z"));
        }

        assert!((version.cursor_score(Level::ZERO, &policy) - 1.0).abs() < 1e-9);

        version.files[1].push(file(10, MIB, "a", "z"));
        assert!(version.cursor_score(Level::ZERO, &policy).abs() < 1e-9);
    }

    #[test]
    fn level0_overlaps_widen_transitively() {
        let cmp = InternalComparator;
        let mut version = Version::new_empty(NUM_LEVELS_USIZE);
        version.files[0].push(file(1, MIB, "a", "c"));
        version.files[0].push(file(2, MIB, "b", "f"));
        version.files[0].push(file(3, MIB, "e", "h"));
        version.files[0].push(file(4, MIB, "x", "z"));

        let inputs = version.overlapping_inputs(
            &cmp,
            Level::ZERO,
            UserKey(b"a"),
            UserKey(b"b"),
        );
        let numbers: Vec<u64> = inputs.iter().map(|f| f.file_number().0).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn find_file_returns_first_candidate() {
        let cmp = InternalComparator;
        let files = vec![
            file(1, MIB, "a", "c"),
            file(2, MIB, "e", "g"),
            file(3, MIB, "i", "k"),
        ];

        let probe = InternalKeyBuf::new(
            b"f".to_vec(),
            SequenceNumber::MAX,
            EntryType::MAX_TYPE,
        );
        assert_eq!(Version::find_file(&cmp, &files, probe.as_key()), Some(1));

        let past_end = InternalKeyBuf::new(
            b"zzz".to_vec(),
            SequenceNumber::MAX,
            EntryType::MAX_TYPE,
        );
        assert_eq!(Version::find_file(&cmp, &files, past_end.as_key()), None);
    }
}
