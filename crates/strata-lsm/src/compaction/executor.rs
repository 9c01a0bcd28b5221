use crate::{
    error::Result,
    format::{EntryType, InternalComparator, InternalKeyBuf, SequenceNumber, UserKey},
    levels::Level,
    table::TableIter,
    version::Version,
};


/// The lifecycle of one compaction task.
///
/// ```text
/// Picked  ─►  Running  ─►  {Committed | Failed}
///                 │
///                 └─►  Aborted (on shutdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompactionPhase {
    Picked,
    Running,
    Committed,
    Failed,
    Aborted,
}

/// A k-way merge over table iterators, in internal-key order.
///
/// Ties on the full internal key cannot occur between live tables; ties on user key are
/// resolved by the sequence ordering baked into the comparator, so the newest entry for
/// each user key is yielded first.
#[derive(Debug)]
pub(crate) struct MergingIter {
    cmp:   InternalComparator,
    iters: Vec<TableIter>,
    heads: Vec<Option<(InternalKeyBuf, Vec<u8>)>>,
    primed: bool,
}

impl MergingIter {
    #[must_use]
    pub fn new(iters: Vec<TableIter>) -> Self {
        let heads = (0..iters.len()).map(|_| None).collect();
        Self {
            cmp: InternalComparator,
            iters,
            heads,
            primed: false,
        }
    }

    fn refill(&mut self, index: usize) -> Result<()> {
        self.heads[index] = match self.iters[index].next() {
            Some(entry) => Some(entry?),
            None => None,
        };
        Ok(())
    }

    fn prime(&mut self) -> Result<()> {
        if !self.primed {
            for index in 0..self.iters.len() {
                self.refill(index)?;
            }
            self.primed = true;
        }
        Ok(())
    }

    fn pop_min(&mut self) -> Result<Option<(InternalKeyBuf, Vec<u8>)>> {
        self.prime()?;

        let mut min_index: Option<usize> = None;
        for (index, head) in self.heads.iter().enumerate() {
            let Some((key, _)) = head else { continue };
            let smaller = match min_index {
                None => true,
                Some(current) => {
                    let (current_key, _) = self.heads[current]
                        .as_ref()
                        .expect("min head is present");
                    self.cmp
                        .cmp_internal(key.as_key(), current_key.as_key())
                        .is_lt()
                }
            };
            if smaller {
                min_index = Some(index);
            }
        }

        let Some(min_index) = min_index else {
            return Ok(None);
        };
        let entry = self.heads[min_index].take();
        self.refill(min_index)?;
        Ok(entry)
    }
}

impl Iterator for MergingIter {
    type Item = Result<(InternalKeyBuf, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop_min().transpose()
    }
}

/// Whether a deletion tombstone may be dropped during a compaction out of `level`.
///
/// Safe only when the tombstone is older than the smallest sequence any reader may still
/// request, and no level beneath the compaction's output could hold an older entry for the
/// same user key, which the tombstone still needs to shadow.
#[must_use]
pub(crate) fn should_drop_deletion(
    version:           &Version,
    cmp:               &InternalComparator,
    level:             Level,
    user_key:          UserKey<'_>,
    sequence:          SequenceNumber,
    smallest_snapshot: SequenceNumber,
) -> bool {
    if sequence > smallest_snapshot {
        return false;
    }

    let mut below = level.next_level().and_then(Level::next_level);
    while let Some(check) = below {
        if check.index() >= version.num_levels() {
            break;
        }
        for file in version.level_files(check) {
            if cmp.cmp_user(user_key, file.smallest_user_key()).is_ge()
                && cmp.cmp_user(user_key, file.largest_user_key()).is_le()
            {
                return false;
            }
        }
        below = check.next_level();
    }
    true
}

/// Merge-loop filter state: decides, entry by entry, what survives into the outputs.
#[derive(Debug, Default)]
pub(crate) struct DropFilter {
    last_user_key: Option<Vec<u8>>,
}

impl DropFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the entry must be dropped.
    ///
    /// The first occurrence of a user key in merge order is its newest entry; every later
    /// occurrence is shadowed. A newest-occurrence deletion is additionally dropped when
    /// [`should_drop_deletion`] proves nothing beneath still needs it.
    pub fn should_drop(
        &mut self,
        version:           &Version,
        cmp:               &InternalComparator,
        level:             Level,
        key:               &InternalKeyBuf,
        smallest_snapshot: SequenceNumber,
    ) -> bool {
        let first_occurrence = self
            .last_user_key
            .as_deref()
            .is_none_or(|last| cmp.cmp_user(UserKey(last), key.user_key()).is_ne());

        if first_occurrence {
            self.last_user_key = Some(key.user_key().0.to_vec());

            let internal_key = key.as_key();
            if internal_key.entry_type == EntryType::Deletion
                && internal_key.sequence <= smallest_snapshot
                && should_drop_deletion(
                    version,
                    cmp,
                    level,
                    internal_key.user_key,
                    internal_key.sequence,
                    smallest_snapshot,
                )
            {
                return true;
            }
            false
        } else {
            // An older entry for a user key we already emitted (or dropped): shadowed.
            true
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::format::FileNumber;
    use crate::levels::NUM_LEVELS_USIZE;
    use crate::version::FileMetadata;

    use super::*;


    fn key(user_key: &str, sequence: u64, entry_type: EntryType) -> InternalKeyBuf {
        InternalKeyBuf::new(
            user_key.as_bytes().to_vec(),
            SequenceNumber::new(sequence).unwrap(),
            entry_type,
        )
    }

    #[test]
    fn shadowed_entries_are_dropped() {
        let version = Version::new_empty(NUM_LEVELS_USIZE);
        let cmp = InternalComparator;
        let mut filter = DropFilter::new();
        let snapshot = SequenceNumber::new(100).unwrap();

        let newest = key("k", 9, EntryType::Value);
        let older = key("k", 4, EntryType::Value);
        let other = key("l", 2, EntryType::Value);

        assert!(!filter.should_drop(&version, &cmp, Level::ZERO, &newest, snapshot));
        assert!(filter.should_drop(&version, &cmp, Level::ZERO, &older, snapshot));
        assert!(!filter.should_drop(&version, &cmp, Level::ZERO, &other, snapshot));
    }

    #[test]
    fn deletions_survive_while_deeper_levels_overlap() {
        let mut version = Version::new_empty(NUM_LEVELS_USIZE);
        let cmp = InternalComparator;
        let snapshot = SequenceNumber::new(100).unwrap();

        // A file at level 3 whose range covers the tombstone's user key.
        let covering = Arc::new(FileMetadata::new(
            FileNumber(5),
            1024,
            key("a", 2, EntryType::Value),
            key("z", 1, EntryType::Value),
            16 * 1024,
        ));

        let tombstone = key("mm", 8, EntryType::Deletion);

        let mut filter = DropFilter::new();
        assert!(filter.should_drop(&version, &cmp, Level::ONE, &tombstone, snapshot));

        version.push_file_for_tests(3, covering);
        let mut filter = DropFilter::new();
        assert!(!filter.should_drop(&version, &cmp, Level::ONE, &tombstone, snapshot));
    }

    #[test]
    fn newer_than_snapshot_deletions_survive() {
        let version = Version::new_empty(NUM_LEVELS_USIZE);
        let cmp = InternalComparator;
        let mut filter = DropFilter::new();

        let tombstone = key("k", 50, EntryType::Deletion);
        let snapshot = SequenceNumber::new(10).unwrap();
        assert!(!filter.should_drop(&version, &cmp, Level::ZERO, &tombstone, snapshot));
    }
}
