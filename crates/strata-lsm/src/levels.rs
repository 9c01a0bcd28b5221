//! Level index spaces.
//!
//! Physical levels come in adjacent pairs: for cursor compaction, physical levels `2k` and
//! `2k + 1` are the *right* and *left* halves of logical level `k`. The hybrid mode adds a
//! third, "lazy" index space modelling the secondary tier, including a small ring of delta
//! sub-levels per logical level for files that have arrived from above but have not yet been
//! merged downward.

/// The number of physical levels. Must be even, so that every physical level has a cursor
/// partner.
pub(crate) const NUM_LEVELS: u8 = 14;
pub(crate) const NUM_LEVELS_USIZE: usize = NUM_LEVELS as usize;

/// Once there are [`L0_COMPACTION_TRIGGER`]-many level-0 files, size compactions may target
/// level 0.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;
/// Once there are [`L0_SOFT_FILE_LIMIT`]-many level-0 files, writes are slowed down
/// in order to let compactions catch up.
pub(crate) const L0_SOFT_FILE_LIMIT: usize = 8;
/// Once there are [`L0_STOP_WRITE_TRIGGER`]-many level-0 files, writes are entirely stopped
/// in order to let compactions catch up.
pub(crate) const L0_STOP_WRITE_TRIGGER: usize = 12;


/// Invariant: the inner value of a `Level` is strictly less than [`NUM_LEVELS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Level(u8);

impl Level {
    pub const ZERO: Self = Self(0);
    pub const ONE:  Self = Self(1);

    #[inline]
    #[must_use]
    pub const fn inner(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn next_level(self) -> Option<Self> {
        if self.0 + 1 < NUM_LEVELS {
            Some(Self(self.0 + 1))
        } else {
            None
        }
    }

    /// The logical level this physical level belongs to.
    #[inline]
    #[must_use]
    pub const fn logical(self) -> LogicalLevel {
        LogicalLevel(self.0 / 2)
    }

    /// Whether this physical level is the left half of its logical level.
    #[inline]
    #[must_use]
    pub const fn is_left_half(self) -> bool {
        self.0 % 2 == 1
    }

    /// Get all the levels in increasing order.
    #[inline]
    pub fn all_levels() -> impl ExactSizeIterator<Item = Self> + DoubleEndedIterator {
        (0..NUM_LEVELS).map(Self)
    }

    /// Get all the nonzero levels in increasing order.
    #[inline]
    pub fn nonzero_levels() -> impl ExactSizeIterator<Item = Self> + DoubleEndedIterator {
        (1..NUM_LEVELS).map(Self)
    }
}

impl TryFrom<u8> for Level {
    type Error = ();

    #[inline]
    fn try_from(level: u8) -> Result<Self, Self::Error> {
        if level < NUM_LEVELS {
            Ok(Self(level))
        } else {
            Err(())
        }
    }
}

impl TryFrom<u32> for Level {
    type Error = ();

    #[inline]
    fn try_from(level: u32) -> Result<Self, Self::Error> {
        if level < u32::from(NUM_LEVELS) {
            Ok(Self(level as u8))
        } else {
            Err(())
        }
    }
}

/// A logical level index: physical level / 2. Used by the compaction planner and by the
/// mirror policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LogicalLevel(u8);

impl LogicalLevel {
    #[inline]
    #[must_use]
    pub const fn new(logical: u8) -> Self {
        debug_assert!(logical < NUM_LEVELS / 2);
        Self(logical)
    }

    #[inline]
    #[must_use]
    pub const fn inner(self) -> u8 {
        self.0
    }

    /// Get all the logical levels in increasing order.
    #[inline]
    pub(crate) fn all_logical_levels() -> impl ExactSizeIterator<Item = Self> {
        (0..NUM_LEVELS / 2).map(Self)
    }
}

/// An index into the lazy level space of the hybrid mode. The bound depends on the delta ring
/// size and two-phase band, so it is validated at construction against the configured count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LazyLevel(u16);

impl LazyLevel {
    #[inline]
    #[must_use]
    pub(crate) fn new(index: usize, num_lazy_levels: usize) -> Option<Self> {
        if index < num_lazy_levels {
            u16::try_from(index).ok().map(Self)
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub(crate) const fn raw(self) -> u32 {
        self.0 as u32
    }
}

// ================================================================
//  Delta ring
// ================================================================

/// The delta-slot ring of one logical level.
///
/// Slots are numbered `1..=ring`; offsets take values `0..=ring` where `0` means "none yet".
/// `start` marks the last fully cleared slot, `clear` the inclusive upper bound of slots being
/// reclaimed, and `active` the slot accepting new incoming files. The invariant is
/// `start ≤ clear ≤ active`, all modulo the ring size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaRing {
    start:  u32,
    clear:  u32,
    active: u32,
}

/// Advancing the active offset would land on `start`, overwriting slots that still hold
/// pending work. The caller must promote the ring with [`DeltaRing::roll_forward`] first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl DeltaRing {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start:  0,
            clear:  0,
            active: 1,
        }
    }

    #[inline]
    #[must_use]
    pub const fn offsets(self) -> (u32, u32, u32) {
        (self.start, self.clear, self.active)
    }

    #[inline]
    pub const fn set_offsets(&mut self, start: u32, clear: u32, active: u32) {
        self.start  = start;
        self.clear  = clear;
        self.active = active;
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self, ring: u32) -> bool {
        self.start <= ring && self.clear <= ring && self.active <= ring
    }

    #[inline]
    #[must_use]
    pub const fn active_slot(self) -> u32 {
        self.active
    }

    /// The next offset after `offset`, wrapping within `1..=ring`.
    #[inline]
    #[must_use]
    const fn next_offset(offset: u32, ring: u32) -> u32 {
        if offset >= ring {
            1
        } else {
            offset + 1
        }
    }

    /// Bump `active` forward one slot.
    ///
    /// Fails with [`RingFull`] when the next slot is `start`: the ring never silently
    /// overwrites slots that have not been reclaimed.
    pub fn advance_active(&mut self, ring: u32) -> Result<(), RingFull> {
        let next = Self::next_offset(self.active, ring);
        if next == self.start {
            return Err(RingFull);
        }
        self.active = next;
        debug_assert!(self.active != self.start);
        Ok(())
    }

    /// Promote the ring one step: everything up to the previous `clear` is now reclaimed, the
    /// previously active slot enters reclamation, and a fresh slot becomes active.
    pub fn roll_forward(&mut self, ring: u32) {
        self.start  = self.clear;
        self.clear  = self.active;
        self.active = Self::next_offset(self.active, ring);
    }

    /// The slots between `start` (exclusive) and `clear` (inclusive), wrapping: these hold
    /// files whose downward merge has completed and which may be reclaimed.
    #[must_use]
    pub fn obsolete_slots(self, ring: u32) -> Vec<u32> {
        let mut slots = Vec::new();
        let mut cursor = self.start;
        while cursor != self.clear {
            cursor = Self::next_offset(cursor, ring);
            slots.push(cursor);
        }
        slots
    }
}

impl Default for DeltaRing {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn cursor_halves() {
        assert!(!Level::ZERO.is_left_half());
        assert!(Level::ONE.is_left_half());
        assert_eq!(Level::ZERO.logical(), Level::ONE.logical());
        assert_eq!(Level::try_from(5_u8).unwrap().logical().inner(), 2);
        assert!(Level::try_from(NUM_LEVELS).is_err());
    }

    #[test]
    fn advance_never_reaches_start() {
        let ring = 3;
        let mut delta = DeltaRing::new();
        assert_eq!(delta.offsets(), (0, 0, 1));

        // start == 0 is never a slot number, so a fresh ring can cycle freely.
        for _ in 0..10 {
            delta.advance_active(ring).unwrap();
            let (start, _, active) = delta.offsets();
            assert_ne!(active, start);
        }
    }

    #[test]
    fn full_ring_requires_roll_forward() {
        let ring = 3;
        let mut delta = DeltaRing::new();
        delta.set_offsets(1, 1, 1);

        delta.advance_active(ring).unwrap();
        delta.advance_active(ring).unwrap();
        assert_eq!(delta.offsets(), (1, 1, 3));

        // The slot after `active` is `start`; advancing would overwrite pending work.
        assert_eq!(delta.advance_active(ring), Err(RingFull));

        // Promotion reclaims everything up to the old `clear` and rotates the offsets.
        delta.roll_forward(ring);
        assert_eq!(delta.offsets(), (1, 3, 1));
        assert_eq!(delta.obsolete_slots(ring), vec![2, 3]);
    }

    #[test]
    fn obsolete_slots_wrap() {
        let ring = 3;
        let mut delta = DeltaRing::new();
        delta.set_offsets(2, 1, 3);
        assert_eq!(delta.obsolete_slots(ring), vec![3, 1]);

        delta.set_offsets(0, 0, 1);
        assert!(delta.obsolete_slots(ring).is_empty());
    }
}
