use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{config::TierPolicy, format::FileNumber, levels::Level};


/// Remembers which physical level every table file currently belongs to.
///
/// Consulted before file I/O to decide tier placement, without needing a version handle.
/// Updated whenever a version edit moves a file.
#[derive(Debug, Default)]
pub(crate) struct LevelMap {
    inner: Mutex<LevelMapInner>,
}

#[derive(Debug, Default)]
struct LevelMapInner {
    mapping: HashMap<FileNumber, Level>,
    /// The most recently added file.
    latest:  Option<FileNumber>,
}

impl LevelMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, file_number: FileNumber, level: Level) {
        let mut inner = self.inner.lock();
        inner.mapping.insert(file_number, level);
        inner.latest = Some(file_number);
    }

    #[must_use]
    pub fn get(&self, file_number: FileNumber) -> Option<Level> {
        self.inner.lock().mapping.get(&file_number).copied()
    }

    #[must_use]
    pub fn latest(&self) -> Option<FileNumber> {
        self.inner.lock().latest
    }

    pub fn remove(&self, file_number: FileNumber) {
        self.inner.lock().mapping.remove(&file_number);
    }

    /// Whether the file's level falls in the mirrored range: at or past `mirror_start_level`,
    /// or within the top mirror band.
    #[must_use]
    pub fn within_mirrored(&self, policy: &TierPolicy, file_number: FileNumber) -> bool {
        let Some(level) = self.get(file_number) else {
            return false;
        };
        Self::level_in_band(level, policy.mirror_start_level, policy.top_mirror_end_level)
    }

    /// The stricter predicate: excludes the part of the top band that is staged through the
    /// two-phase scheme rather than purely mirrored.
    #[must_use]
    pub fn within_pure_mirrored(&self, policy: &TierPolicy, file_number: FileNumber) -> bool {
        let Some(level) = self.get(file_number) else {
            return false;
        };
        Self::level_in_band(level, policy.mirror_start_level, policy.top_pure_mirror_end_level)
    }

    fn level_in_band(level: Level, start: Option<Level>, top_end: Option<Level>) -> bool {
        start.is_some_and(|start| level >= start) || top_end.is_some_and(|end| level <= end)
    }
}


#[cfg(test)]
mod tests {
    use crate::config::{DbMode, EngineOptions};

    use super::*;


    #[test]
    fn mirrored_bands_in_hybrid_mode() {
        let options = EngineOptions::new(DbMode::HLsm, "/pri").with_secondary("/sec");
        let policy = TierPolicy::from_options(&options);
        let map = LevelMap::new();

        // mirror_start_level is 8; the top mirror band ends at physical level 1.
        map.add(FileNumber(1), Level::ZERO);
        map.add(FileNumber(2), Level::ONE);
        map.add(FileNumber(3), Level::try_from(5_u8).unwrap());
        map.add(FileNumber(4), Level::try_from(9_u8).unwrap());

        assert!(map.within_mirrored(&policy, FileNumber(1)));
        assert!(map.within_mirrored(&policy, FileNumber(2)));
        assert!(!map.within_mirrored(&policy, FileNumber(3)));
        assert!(map.within_mirrored(&policy, FileNumber(4)));

        // The pure band cuts off after physical level 0 at the top.
        assert!(map.within_pure_mirrored(&policy, FileNumber(1)));
        assert!(!map.within_pure_mirrored(&policy, FileNumber(2)));
        assert!(map.within_pure_mirrored(&policy, FileNumber(4)));

        // Unknown files are never mirrored.
        assert!(!map.within_mirrored(&policy, FileNumber(99)));

        assert_eq!(map.latest(), Some(FileNumber(4)));
        map.remove(FileNumber(4));
        assert_eq!(map.get(FileNumber(4)), None);
    }
}
