//! Fixed-size-block pools for small requests.
//!
//! Each pool owns one committed page split into equal slots. A free slot
//! stores the *index* of the next free slot in its first word, so slots need
//! no separate header. Pools of one class are kept in creation order and
//! scanned front to back.

use super::config::AllocatorConfig;
use super::error::AllocError;
use super::reservation::Region;
use fixedbitset::FixedBitSet;
use std::collections::HashMap;

/// End-of-list marker for the slot index chain.
const SLOT_SENTINEL: usize = usize::MAX;

/// Round a small request up to its size class: the next power of two, no
/// smaller than `min_class`.
#[inline]
#[must_use]
pub fn class_for(size: usize, min_class: usize) -> usize {
    size.next_power_of_two().max(min_class)
}

/// One page worth of `block_size` slots.
pub(crate) struct SizeClassPool {
    block_size: usize,
    slot_count: usize,
    free_count: usize,
    free_head: usize,
    /// Reservation offset of the page.
    base: usize,
    /// Slots currently handed out. Catches double free and stray pointers.
    live: FixedBitSet,
}

impl SizeClassPool {
    /// Build a pool over a freshly committed page and thread every slot onto
    /// the free list (`i -> i + 1`), so the free count always equals the
    /// number of slots reachable from the head.
    fn new(region: &mut Region<'_>, base: usize, page_size: usize, block_size: usize) -> Self {
        let slot_count = page_size / block_size;
        for i in 0..slot_count {
            let next = if i + 1 < slot_count { i + 1 } else { SLOT_SENTINEL };
            region.write_word(base + i * block_size, next);
        }

        Self {
            block_size,
            slot_count,
            free_count: slot_count,
            free_head: 0,
            base,
            live: FixedBitSet::with_capacity(slot_count),
        }
    }

    #[inline]
    fn slot_offset(&self, slot: usize) -> usize {
        self.base + slot * self.block_size
    }

    /// Pop the head slot. Must not be called on an exhausted pool.
    fn acquire(&mut self, region: &Region<'_>) -> usize {
        debug_assert!(self.free_count > 0 && self.free_head != SLOT_SENTINEL);
        let slot = self.free_head;
        let offset = self.slot_offset(slot);

        self.free_head = region.read_word(offset);
        self.free_count -= 1;
        self.live.insert(slot);
        offset
    }

    /// Push a slot back on the front of the list.
    fn release(&mut self, region: &mut Region<'_>, offset: usize) -> Result<(), AllocError> {
        let rel = offset - self.base;
        let slot = rel / self.block_size;
        if !rel.is_multiple_of(self.block_size) || slot >= self.slot_count {
            return Err(AllocError::ForeignPointer {
                addr: region.addr_of(offset),
            });
        }
        if !self.live.contains(slot) {
            return Err(AllocError::DoubleFree {
                addr: region.addr_of(offset),
            });
        }

        region.write_word(offset, self.free_head);
        self.free_head = slot;
        self.free_count += 1;
        self.live.set(slot, false);
        Ok(())
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Walk the chain from the head and count reachable slots.
    #[cfg(test)]
    fn reachable(&self, region: &Region<'_>) -> usize {
        let mut count = 0;
        let mut slot = self.free_head;
        while slot != SLOT_SENTINEL {
            count += 1;
            assert!(count <= self.slot_count, "cycle in slot free list");
            slot = region.read_word(self.slot_offset(slot));
        }
        count
    }
}

/// Per-class numbers for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeClassStats {
    pub block_size: usize,
    pub pools: usize,
    pub total_slots: usize,
    pub free_slots: usize,
}

impl SizeClassStats {
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        (self.total_slots - self.free_slots) * self.block_size
    }
}

/// All size-class pools, grouped by class in creation order.
pub(crate) struct SizeClassTier {
    page_size: usize,
    min_class: usize,
    small_ceiling: usize,
    classes: Vec<Vec<SizeClassPool>>,
    /// Page number (offset / page size) -> (class index, pool index).
    page_owner: HashMap<usize, (usize, usize)>,
}

impl SizeClassTier {
    pub fn new(config: &AllocatorConfig) -> Self {
        Self {
            page_size: config.page_size,
            min_class: config.min_class_size(),
            small_ceiling: config.small_ceiling,
            classes: (0..config.size_class_count()).map(|_| Vec::new()).collect(),
            page_owner: HashMap::new(),
        }
    }

    /// Size class serving a request of `size` bytes.
    #[must_use]
    pub fn class_for(&self, size: usize) -> usize {
        class_for(size, self.min_class)
    }

    #[inline]
    fn class_index(&self, class_size: usize) -> usize {
        debug_assert!(class_size.is_power_of_two() && class_size >= self.min_class);
        (class_size.trailing_zeros() - self.min_class.trailing_zeros()) as usize
    }

    /// Iterator over every class size served, smallest first.
    pub fn class_sizes(&self) -> impl Iterator<Item = usize> + use<> {
        let ceiling = self.small_ceiling;
        std::iter::successors(Some(self.min_class), move |&c| {
            (c < ceiling).then_some(c * 2)
        })
    }

    /// Take a slot from the first pool of this class that has one.
    /// `None` means every pool of the class is exhausted.
    pub fn acquire(&mut self, region: &Region<'_>, class_size: usize) -> Option<usize> {
        let idx = self.class_index(class_size);
        self.classes[idx]
            .iter_mut()
            .find(|pool| pool.free_count() > 0)
            .map(|pool| pool.acquire(region))
    }

    /// Turn a freshly committed page into a new pool for `class_size`.
    pub fn add_pool(&mut self, region: &mut Region<'_>, class_size: usize, page_offset: usize) {
        debug_assert!(page_offset.is_multiple_of(self.page_size));
        let idx = self.class_index(class_size);
        let pool = SizeClassPool::new(region, page_offset, self.page_size, class_size);
        log::debug!(
            "size class {class_size}: pool #{} at offset {page_offset:#x} ({} slots)",
            self.classes[idx].len(),
            pool.slot_count
        );

        self.page_owner
            .insert(page_offset / self.page_size, (idx, self.classes[idx].len()));
        self.classes[idx].push(pool);
    }

    /// True when `offset` falls inside a page owned by some pool.
    #[must_use]
    pub fn owns(&self, offset: usize) -> bool {
        self.page_owner.contains_key(&(offset / self.page_size))
    }

    fn pool_for(&self, offset: usize) -> Option<&SizeClassPool> {
        let &(class, pool) = self.page_owner.get(&(offset / self.page_size))?;
        Some(&self.classes[class][pool])
    }

    /// Return a slot to its pool.
    ///
    /// # Errors
    ///
    /// `ForeignPointer` if the offset is not a slot start of any pool,
    /// `DoubleFree` if the slot is already free. Nothing changes on error.
    pub fn release(&mut self, region: &mut Region<'_>, offset: usize) -> Result<usize, AllocError> {
        let Some(&(class, pool)) = self.page_owner.get(&(offset / self.page_size)) else {
            return Err(AllocError::ForeignPointer {
                addr: region.addr_of(offset),
            });
        };
        let pool = &mut self.classes[class][pool];
        pool.release(region, offset)?;
        Ok(pool.block_size)
    }

    /// Class size of the slot at `offset`, if it is a live slot.
    #[must_use]
    pub fn usable_size(&self, offset: usize) -> Option<usize> {
        let pool = self.pool_for(offset)?;
        let rel = offset - pool.base;
        (rel.is_multiple_of(pool.block_size) && pool.live.contains(rel / pool.block_size))
            .then_some(pool.block_size)
    }

    #[must_use]
    pub fn stats(&self, class_size: usize) -> SizeClassStats {
        let pools = &self.classes[self.class_index(class_size)];
        SizeClassStats {
            block_size: class_size,
            pools: pools.len(),
            total_slots: pools.iter().map(|p| p.slot_count).sum(),
            free_slots: pools.iter().map(SizeClassPool::free_count).sum(),
        }
    }

    /// Bytes committed to pools (one page each).
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.page_owner.len() * self.page_size
    }

    /// Bytes handed out (whole slots).
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.class_sizes().map(|c| self.stats(c).live_bytes()).sum()
    }
}
