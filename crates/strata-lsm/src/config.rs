use std::{path::PathBuf, str::FromStr};
use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::levels::{Level, LogicalLevel, NUM_LEVELS};


/// How the engine lays data out across the two storage tiers.
///
/// The variant names follow the benchmark front-end's `--hlsm_mode` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbMode {
    /// A plain single-tier leveled LSM.
    #[default]
    Default,
    /// Every file is written to both tiers; reads pick a tier by access pattern.
    FullMirror,
    /// Files at or below `mirror_start_level` are mirrored onto the secondary tier.
    PartialMirror,
    /// Single-tier, but with cursor compaction (left/right level halves).
    BLsm,
    /// Cursor compaction plus partial mirroring.
    PartialBLsm,
    /// The hybrid two-tier mode: cursor compaction, a fully mirrored top band, a two-phase
    /// middle band staged through lazy delta levels, and a secondary-resident bottom band.
    HLsm,
}

impl DbMode {
    #[inline]
    #[must_use]
    pub const fn is_hlsm(self) -> bool {
        matches!(self, Self::HLsm)
    }
}

impl FromStr for DbMode {
    type Err = ();

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "Default"       => Ok(Self::Default),
            "FullMirror"    => Ok(Self::FullMirror),
            "PartialMirror" => Ok(Self::PartialMirror),
            "bLSM"          => Ok(Self::BLsm),
            "PartialbLSM"   => Ok(Self::PartialBLsm),
            "hLSM"          => Ok(Self::HLsm),
            _               => Err(()),
        }
    }
}

impl Display for DbMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            Self::Default       => "Default",
            Self::FullMirror    => "FullMirror",
            Self::PartialMirror => "PartialMirror",
            Self::BLsm          => "bLSM",
            Self::PartialBLsm   => "PartialbLSM",
            Self::HLsm          => "hLSM",
        })
    }
}

/// Options for opening an engine. Immutable once the engine is open; every knob of the
/// front-end maps onto a named field here.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub mode:                     DbMode,
    /// Root directory of the primary (fast) tier.
    pub primary_path:             PathBuf,
    /// Root directory of the secondary (slow, large) tier. Required for every mode other
    /// than `Default` and `bLSM`.
    pub secondary_path:           Option<PathBuf>,
    /// Target size of a compaction output file, in bytes.
    pub target_file_size:         u64,
    /// Base byte budget of the lowest levels, in MiB.
    pub level0_size_mb:           u64,
    /// Growth factor of the per-level byte budget.
    pub level_ratio:              u64,
    /// Capacity of the table cache, in open tables.
    pub table_cache_capacity:     u64,
    /// A file is allotted one seek per this many KiB before a seek-triggered compaction.
    pub min_kb_per_seek:          u32,
    /// Number of delta slots in each logical level's lazy ring (hybrid mode).
    pub delta_ring_size:          u32,
    /// The last logical level of the two-phase band (hybrid mode).
    pub two_phase_end_level:      u8,
    /// Skip the queued secondary `Sync` when mirroring, letting the consumer thread fold
    /// syncs into the eventual close.
    pub lazy_sync_on_secondary:   bool,
    /// Batch mirrored writes into large aligned positional writes on the secondary device.
    pub secondary_use_buffer_file: bool,
    pub create_if_missing:        bool,
    /// Run compactions on a background thread. Disabled, the engine compacts only when the
    /// caller drives it, which deterministic tests and offline loads rely on.
    pub background_compaction:    bool,
}

impl EngineOptions {
    #[must_use]
    pub fn new(mode: DbMode, primary_path: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            primary_path:           primary_path.into(),
            secondary_path:         None,
            target_file_size:       2 << 20,
            level0_size_mb:         10,
            level_ratio:            10,
            table_cache_capacity:   1000,
            min_kb_per_seek:        16,
            delta_ring_size:        3,
            two_phase_end_level:    4,
            lazy_sync_on_secondary: false,
            secondary_use_buffer_file: false,
            create_if_missing:      true,
            background_compaction:  true,
        }
    }

    #[must_use]
    pub fn with_secondary(mut self, secondary_path: impl Into<PathBuf>) -> Self {
        self.secondary_path = Some(secondary_path.into());
        self
    }
}

/// The runtime tier context derived from [`EngineOptions`] at open time.
///
/// This replaces per-process mutable globals: one `TierPolicy` is owned by the engine handle
/// and shared read-only with every subsystem that needs a placement or read-routing decision.
#[derive(Debug, Clone)]
pub(crate) struct TierPolicy {
    pub mode:                         DbMode,
    pub use_cursor_compaction:        bool,
    pub full_mirror:                  bool,
    /// Physical level at which files start being mirrored onto the secondary tier.
    pub mirror_start_level:           Option<Level>,
    /// Last physical level of the fully mirrored top band (hybrid mode).
    pub top_mirror_end_level:         Option<Level>,
    /// Last physical level of the top band that is mirrored without two-phase staging.
    pub top_pure_mirror_end_level:    Option<Level>,
    /// Last logical level of the two-phase band (hybrid mode).
    pub two_phase_end_level:          Option<u8>,
    pub sequential_read_from_primary: bool,
    pub random_read_from_primary:     bool,
    /// Whether `CURRENT`, manifests and info logs live on the primary tier.
    pub meta_on_primary:              bool,
    /// Whether write-ahead log segments live on the primary tier.
    pub log_on_primary:               bool,
    /// Whether the asynchronous op-queue consumer thread runs.
    pub use_op_queue:                 bool,
    pub delta_ring_size:              u32,
    pub target_file_size:             u64,
    pub level0_size_mb:               u64,
    pub level_ratio:                  u64,
    pub min_bytes_per_seek:           u32,
    pub lazy_sync_on_secondary:       bool,
    pub secondary_use_buffer_file:    bool,
}

impl TierPolicy {
    pub fn from_options(options: &EngineOptions) -> Self {
        let mut policy = Self {
            mode:                         options.mode,
            use_cursor_compaction:        false,
            full_mirror:                  false,
            mirror_start_level:           None,
            top_mirror_end_level:         None,
            top_pure_mirror_end_level:    None,
            two_phase_end_level:          None,
            sequential_read_from_primary: true,
            random_read_from_primary:     true,
            meta_on_primary:              true,
            log_on_primary:               true,
            use_op_queue:                 false,
            delta_ring_size:              options.delta_ring_size,
            target_file_size:             options.target_file_size,
            level0_size_mb:               options.level0_size_mb,
            level_ratio:                  options.level_ratio,
            min_bytes_per_seek:           options.min_kb_per_seek.saturating_mul(1024),
            lazy_sync_on_secondary:       options.lazy_sync_on_secondary,
            secondary_use_buffer_file:    options.secondary_use_buffer_file,
        };

        match options.mode {
            DbMode::Default => {}
            DbMode::FullMirror => {
                policy.full_mirror = true;
                policy.mirror_start_level = Some(Level::ZERO);
                // The primary is the fast device; route bulk sequential reads at the slower
                // mirror to keep the primary free for random lookups.
                policy.sequential_read_from_primary = false;
                policy.use_op_queue = true;
            }
            DbMode::PartialMirror => {
                policy.mirror_start_level = Level::try_from(3_u8).ok();
                policy.meta_on_primary = false;
                policy.log_on_primary = false;
                policy.use_op_queue = true;
            }
            DbMode::BLsm => {
                policy.use_cursor_compaction = true;
            }
            DbMode::PartialBLsm => {
                policy.use_cursor_compaction = true;
                policy.mirror_start_level = Level::try_from(3_u8).ok();
                policy.meta_on_primary = false;
                policy.log_on_primary = false;
                policy.use_op_queue = true;
            }
            DbMode::HLsm => {
                policy.use_cursor_compaction = true;
                policy.top_mirror_end_level = Some(Level::ONE);
                policy.top_pure_mirror_end_level = Some(Level::ZERO);
                policy.two_phase_end_level = Some(options.two_phase_end_level);
                policy.mirror_start_level =
                    Level::try_from(options.two_phase_end_level * 2).ok();
                policy.sequential_read_from_primary = true;
                policy.random_read_from_primary = false;
                policy.meta_on_primary = false;
                policy.log_on_primary = false;
                policy.use_op_queue = true;
            }
        }

        policy
    }

    #[inline]
    #[must_use]
    pub const fn is_hybrid(&self) -> bool {
        self.mode.is_hlsm()
    }

    /// Which tier a read should prefer, by access pattern.
    #[inline]
    #[must_use]
    pub const fn read_from_primary(&self, is_sequential: bool) -> bool {
        if is_sequential {
            self.sequential_read_from_primary
        } else {
            self.random_read_from_primary
        }
    }

    /// The byte budget of a physical level.
    ///
    /// With cursor compaction, the two halves of a logical level share one budget: the four
    /// lowest physical levels get the base budget, and each further pair multiplies it by
    /// `level_ratio`. Without the cursor, the classic geometric progression applies.
    ///
    /// The result for level zero is not really used, since the level-0 trigger is based on
    /// file count.
    #[must_use]
    pub fn max_bytes_for_level(&self, level: Level) -> f64 {
        let mut result = (self.level0_size_mb as f64) * f64::from(1_u32 << 20);

        if self.use_cursor_compaction {
            let mut level = level.inner();
            while level > 3 {
                result *= self.level_ratio as f64;
                level -= 2;
            }
        } else {
            let mut level = level.inner();
            while level > 1 {
                result *= self.level_ratio as f64;
                level -= 1;
            }
        }

        result
    }

    // ================================================================
    //  Lazy level arithmetic (hybrid mode)
    // ================================================================
    //
    // The lazy space mirrors the secondary tier. Logical level 0 occupies lazy indices 0
    // and 1 (the fully mirrored top band). Each later logical level `k` owns a block of
    // `ring + 1` indices ending at `k * (ring + 1) + 1`: the delta slots `1..=ring` count
    // downward from that bound, and the bound itself is the "new" pseudo-slot that receives
    // files still being copied across. Past the two-phase band, pure-mirror indices continue
    // one per physical level.

    /// The lazy index bound of logical level `logical`'s block, which doubles as its "new"
    /// pseudo-slot.
    #[must_use]
    pub fn new_pseudo_slot_index(&self, logical: LogicalLevel) -> usize {
        debug_assert!(self.is_hybrid());
        (logical.inner() as usize) * (self.delta_ring_size as usize + 1) + 1
    }

    /// The lazy index of delta slot `slot` (in `1..=ring`) of logical level `logical`.
    #[must_use]
    pub fn lazy_index_for_slot(&self, logical: LogicalLevel, slot: u32) -> usize {
        debug_assert!(slot >= 1 && slot <= self.delta_ring_size);
        self.new_pseudo_slot_index(logical) - slot as usize
    }

    /// The lazy index of the pure-mirror image of `level`.
    ///
    /// Defined for the two-phase boundary and everything below it; the boundary logical
    /// level's pure mirror coincides with its "new" pseudo-slot, where the secondary tier
    /// merges the staged band into the resident one.
    #[must_use]
    pub fn pure_mirror_index(&self, level: Level) -> usize {
        let two_phase_end = self.two_phase_end_level
            .expect("pure_mirror_index requires hybrid mode");
        let boundary = LogicalLevel::new(two_phase_end);
        debug_assert!(level.inner() >= two_phase_end * 2);

        let bound = self.new_pseudo_slot_index(boundary);
        let first_pure = (two_phase_end as usize + 1) * 2;
        if (level.inner() as usize) < first_pure {
            bound
        } else {
            bound + level.inner() as usize - first_pure
        }
    }

    /// Total number of lazy levels the hybrid mode tracks.
    #[must_use]
    pub fn num_lazy_levels(&self) -> usize {
        if !self.is_hybrid() {
            return 0;
        }
        let last = Level::try_from(NUM_LEVELS - 1).expect("NUM_LEVELS is nonzero");
        self.pure_mirror_index(last) + 1
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    fn hlsm_policy() -> TierPolicy {
        TierPolicy::from_options(
            &EngineOptions::new(DbMode::HLsm, "/primary").with_secondary("/secondary"),
        )
    }

    #[test]
    fn mode_strings_round_trip() {
        for mode in [
            DbMode::Default,
            DbMode::FullMirror,
            DbMode::PartialMirror,
            DbMode::BLsm,
            DbMode::PartialBLsm,
            DbMode::HLsm,
        ] {
            assert_eq!(mode.to_string().parse::<DbMode>(), Ok(mode));
        }
        assert!("NoSuchMode".parse::<DbMode>().is_err());
    }

    #[test]
    fn hlsm_mode_table() {
        let policy = hlsm_policy();
        assert!(policy.use_cursor_compaction);
        assert!(policy.is_hybrid());
        assert_eq!(policy.mirror_start_level, Level::try_from(8_u8).ok());
        assert_eq!(policy.top_mirror_end_level, Some(Level::ONE));
        assert_eq!(policy.top_pure_mirror_end_level, Some(Level::ZERO));
        assert!(policy.read_from_primary(true));
        assert!(!policy.read_from_primary(false));
        assert!(!policy.meta_on_primary);
    }

    #[test]
    fn cursor_budget_pairs_levels() {
        let policy = hlsm_policy();
        let base = 10.0 * f64::from(1_u32 << 20);

        for level in 0..=3_u8 {
            let level = Level::try_from(level).unwrap();
            assert!((policy.max_bytes_for_level(level) - base).abs() < f64::EPSILON);
        }
        let level4 = Level::try_from(4_u8).unwrap();
        let level5 = Level::try_from(5_u8).unwrap();
        assert!((policy.max_bytes_for_level(level4) - base * 10.0).abs() < f64::EPSILON);
        assert!((policy.max_bytes_for_level(level5) - base * 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn lazy_index_layout() {
        let policy = hlsm_policy();
        let ring = policy.delta_ring_size as usize;
        assert_eq!(ring, 3);

        // Logical level 1 owns the block ending at index 5 with ring = 3.
        let logical1 = LogicalLevel::new(1);
        assert_eq!(policy.new_pseudo_slot_index(logical1), 5);
        assert_eq!(policy.lazy_index_for_slot(logical1, 1), 4);
        assert_eq!(policy.lazy_index_for_slot(logical1, 3), 2);

        // The two-phase boundary (logical 4) merges into its own pseudo-slot.
        let boundary_right = Level::try_from(8_u8).unwrap();
        let first_pure = Level::try_from(10_u8).unwrap();
        assert_eq!(
            policy.pure_mirror_index(boundary_right),
            policy.pure_mirror_index(first_pure),
        );

        let last = Level::try_from(13_u8).unwrap();
        assert_eq!(policy.num_lazy_levels(), policy.pure_mirror_index(last) + 1);
    }
}
