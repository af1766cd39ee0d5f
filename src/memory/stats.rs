//! Point-in-time accounting snapshot.
//!
//! All figures are taken from the tiers' own bookkeeping at the moment
//! `TieredAllocator::stats` is called; nothing is tracked separately.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Address space reserved up front.
    pub reserved: usize,
    /// Bytes of the reservation backed by physical pages.
    pub committed: usize,

    /// Pages committed to size-class pools.
    pub size_class_committed: usize,
    /// Slots handed out, counted at their class size.
    pub size_class_in_use: usize,

    /// Arena capacity committed.
    pub coalescing_committed: usize,
    /// Arena bytes handed out, headers and alignment slack included.
    pub coalescing_in_use: usize,
    pub arena_count: usize,

    /// Bytes of live large objects (outside the reservation).
    pub large_in_use: usize,
    pub large_count: usize,

    /// Sum of the three `*_in_use` figures.
    pub bytes_in_use: usize,
}

impl MemoryStats {
    /// Committed reservation bytes plus live large bytes: what the
    /// reservation-wide budget is checked against.
    #[must_use]
    pub fn budget_used(&self) -> usize {
        self.committed + self.large_in_use
    }
}
