use std::collections::HashSet;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::format::{FileNumber, InternalComparator};

use super::{
    edit::NewFileEntry,
    file_metadata::{FileMetadata, SharedFileMetadata},
    version_struct::Version,
};


/// Applies a sequence of edits to a base version without materialising the intermediate
/// versions. One builder handles one index space (eager or lazy); the hybrid set runs two
/// in lock-step.
#[derive(Debug)]
pub(crate) struct VersionBuilder<'a> {
    cmp:    InternalComparator,
    base:   &'a Version,
    levels: Vec<LevelState>,
    /// Overlap checking applies to the eager space, where every level above zero holds
    /// pairwise disjoint files. Lazy delta slots accumulate files from independent moves
    /// and may overlap freely.
    check_disjoint: bool,
}

#[derive(Debug, Default)]
struct LevelState {
    deleted: HashSet<FileNumber>,
    added:   Vec<SharedFileMetadata>,
}

impl<'a> VersionBuilder<'a> {
    #[must_use]
    pub fn new(base: &'a Version, check_disjoint: bool) -> Self {
        Self {
            cmp: InternalComparator,
            base,
            levels: (0..base.num_levels()).map(|_| LevelState::default()).collect(),
            check_disjoint,
        }
    }

    /// Record the deletions and additions of one edit.
    ///
    /// Levels out of range are rejected by the edit codec, so `index` is trusted here.
    pub fn apply<'e>(
        &mut self,
        deleted:            impl Iterator<Item = (usize, FileNumber)>,
        added:              impl Iterator<Item = (usize, &'e NewFileEntry)>,
        min_bytes_per_seek: u32,
    ) {
        for (index, file_number) in deleted {
            self.levels[index].deleted.insert(file_number);
        }

        for (index, entry) in added {
            let metadata = Arc::new(FileMetadata::new(
                entry.file_number,
                entry.file_size,
                entry.smallest.clone(),
                entry.largest.clone(),
                min_bytes_per_seek,
            ));
            self.levels[index].deleted.remove(&entry.file_number);
            self.levels[index].added.retain(|file| file.file_number() != entry.file_number);
            self.levels[index].added.push(metadata);
        }
    }

    /// Merge the accumulated state with the base version into a new version.
    ///
    /// Files in every level are ordered by smallest key (ties by file number), except the
    /// overlapping level 0 of the eager space, which stays in file-number order so that the
    /// newest data is identifiable.
    #[must_use]
    pub fn save(mut self) -> Version {
        let mut merged_levels = Vec::with_capacity(self.base.num_levels());

        for (index, state) in self.levels.iter_mut().enumerate() {
            let base_files = self.base.files_at(index);
            let mut merged: Vec<SharedFileMetadata> =
                Vec::with_capacity(base_files.len() + state.added.len());

            merged.extend(
                base_files
                    .iter()
                    .filter(|file| !state.deleted.contains(&file.file_number()))
                    .cloned(),
            );
            // A file added by one edit may be deleted again by a later edit in the same
            // replay; the deletion wins.
            let deleted = &state.deleted;
            merged.extend(
                state.added
                    .drain(..)
                    .filter(|file| !deleted.contains(&file.file_number())),
            );

            if index == 0 {
                merged.sort_by_key(|file| file.file_number());
            } else {
                let cmp = &self.cmp;
                merged.sort_by(|lhs, rhs| {
                    cmp.cmp_internal(lhs.smallest_key(), rhs.smallest_key())
                        .then_with(|| lhs.file_number().cmp(&rhs.file_number()))
                });

                if self.check_disjoint {
                    debug_assert!(
                        Self::is_disjoint(cmp, &merged),
                        "overlapping ranges in level {index}",
                    );
                }
            }

            merged_levels.push(merged);
        }

        Version::new(merged_levels)
    }

    fn is_disjoint(cmp: &InternalComparator, files: &[SharedFileMetadata]) -> bool {
        files.windows(2).all(|pair| {
            cmp.cmp_internal(pair[0].largest_key(), pair[1].smallest_key()) == Ordering::Less
        })
    }
}


#[cfg(test)]
mod tests {
    use crate::format::{EntryType, InternalKeyBuf, SequenceNumber};
    use crate::levels::{Level, NUM_LEVELS_USIZE};

    use super::super::edit::VersionEdit;
    use super::*;


    fn key(user_key: &str) -> InternalKeyBuf {
        InternalKeyBuf::new(
            user_key.as_bytes().to_vec(),
            SequenceNumber::new(1).unwrap(),
            EntryType::Value,
        )
    }

    fn apply_eager(base: &Version, edit: &VersionEdit) -> Version {
        let mut builder = VersionBuilder::new(base, true);
        builder.apply(
            edit.deleted_files.iter().map(|(level, num)| (level.index(), *num)),
            edit.new_files.iter().map(|(level, entry)| (level.index(), entry)),
            16 * 1024,
        );
        builder.save()
    }

    #[test]
    fn add_then_delete_across_edits() {
        let base = Version::new_empty(NUM_LEVELS_USIZE);
        let level2 = Level::try_from(2_u8).unwrap();

        let mut edit = VersionEdit::new_empty();
        edit.add_file(level2, FileNumber(5), 100, key("d"), key("f"));
        edit.add_file(level2, FileNumber(4), 100, key("a"), key("c"));
        let version = apply_eager(&base, &edit);

        let numbers: Vec<u64> = version
            .level_files(level2)
            .iter()
            .map(|file| file.file_number().0)
            .collect();
        // Sorted by smallest key, not by insertion or file number.
        assert_eq!(numbers, vec![4, 5]);

        let mut second = VersionEdit::new_empty();
        second.delete_file(level2, FileNumber(4));
        let version = apply_eager(&version, &second);
        assert_eq!(version.level_files(level2).len(), 1);
        assert_eq!(version.level_files(level2)[0].file_number(), FileNumber(5));
    }

    #[test]
    fn delete_then_re_add_in_one_edit_keeps_the_file() {
        let base = Version::new_empty(NUM_LEVELS_USIZE);
        let level3 = Level::try_from(3_u8).unwrap();

        let mut edit = VersionEdit::new_empty();
        edit.delete_file(level3, FileNumber(9));
        edit.add_file(level3, FileNumber(9), 100, key("m"), key("n"));
        let version = apply_eager(&base, &edit);

        assert_eq!(version.level_files(level3).len(), 1);
    }

    #[test]
    fn level0_keeps_file_number_order() {
        let base = Version::new_empty(NUM_LEVELS_USIZE);

        let mut edit = VersionEdit::new_empty();
        edit.add_file(Level::ZERO, FileNumber(8), 100, key("a"), key("z"));
        edit.add_file(Level::ZERO, FileNumber(6), 100, key("b"), key("y"));
        let version = apply_eager(&base, &edit);

        let numbers: Vec<u64> = version
            .level_files(Level::ZERO)
            .iter()
            .map(|file| file.file_number().0)
            .collect();
        assert_eq!(numbers, vec![6, 8]);
    }
}
