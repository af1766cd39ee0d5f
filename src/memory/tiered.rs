use super::config::AllocatorConfig;
use super::error::AllocError;
use super::free_list::{FreeListArena, FreeListStats, HEADER_SIZE};
use super::large::LargeObjects;
use super::reservation::{Reservation, WORD};
use super::size_class::{SizeClassStats, SizeClassTier};
use super::stats::MemoryStats;
use super::vm::{PlatformVmOps, VmOps};
use std::ptr::NonNull;

/// Everything `init` builds and `destroy` tears down.
struct Heap<V: VmOps> {
    config: AllocatorConfig,
    reservation: Reservation<V>,
    pools: SizeClassTier,
    /// Arenas in creation order.
    arenas: Vec<FreeListArena>,
    large: LargeObjects<V>,
}

impl<V: VmOps> Heap<V> {
    fn new(config: &AllocatorConfig) -> Result<Self, AllocError> {
        let mut heap = Self {
            config: config.clone(),
            reservation: Reservation::new(config.reservation_size)?,
            pools: SizeClassTier::new(config),
            arenas: Vec::new(),
            large: LargeObjects::new(),
        };

        for class in heap.pools.class_sizes() {
            heap.grow_pool(class)?;
        }
        heap.grow_arena()?;

        log::debug!(
            "tiered allocator ready: {} size classes, {} byte arena, {} byte reservation",
            config.size_class_count(),
            config.arena_size,
            config.reservation_size
        );
        Ok(heap)
    }

    /// Fail if `len` more bytes would push committed plus large bytes past
    /// the reservation size.
    fn ensure_budget(&self, len: usize) -> Result<(), AllocError> {
        let used = self.reservation.committed() + self.large.live_bytes();
        let available = self.config.reservation_size.saturating_sub(used);
        if len > available {
            log::warn!("reservation exhausted: {len} bytes requested, {available} available");
            return Err(AllocError::OutOfReservation {
                requested: len,
                available,
            });
        }
        Ok(())
    }

    fn grow_pool(&mut self, class: usize) -> Result<(), AllocError> {
        let page = self.config.page_size;
        self.ensure_budget(page)?;
        let offset = self.reservation.commit_next(page)?;
        self.pools.add_pool(&mut self.reservation.region(), class, offset);
        Ok(())
    }

    fn grow_arena(&mut self) -> Result<(), AllocError> {
        let size = self.config.arena_size;
        self.ensure_budget(size)?;
        let offset = self.reservation.commit_next(size)?;
        let arena = FreeListArena::new(
            &mut self.reservation.region(),
            offset,
            size,
            self.config.alignment,
        );
        log::debug!("arena #{} at offset {offset:#x}", self.arenas.len());
        self.arenas.push(arena);
        Ok(())
    }

    /// Largest rounded request a fresh arena is guaranteed to hold.
    fn arena_limit(&self) -> usize {
        self.config
            .arena_size
            .saturating_sub(HEADER_SIZE + self.config.alignment)
    }

    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size <= self.config.small_ceiling {
            let class = self.pools.class_for(size);
            log::trace!("alloc {size} -> size class {class}");
            let offset = self.alloc_small(class)?;
            return Ok(self.reservation.ptr_at(offset));
        }

        if size <= self.config.coalesce_ceiling {
            match size.checked_next_power_of_two() {
                Some(rounded) if rounded <= self.arena_limit() => {
                    log::trace!("alloc {size} -> arena ({rounded} bytes)");
                    let offset = self.alloc_coalescing(rounded)?;
                    return Ok(self.reservation.ptr_at(offset));
                }
                _ => log::trace!("alloc {size}: never fits an arena, using large tier"),
            }
        }

        let len = size
            .checked_next_multiple_of(self.config.alignment.max(WORD))
            .ok_or(AllocError::OutOfReservation {
                requested: size,
                available: 0,
            })?;
        log::trace!("alloc {size} -> large ({len} bytes)");
        self.ensure_budget(len)?;
        Ok(self.large.allocate(len)?)
    }

    fn alloc_small(&mut self, class: usize) -> Result<usize, AllocError> {
        // A fresh pool always has a free slot, so this runs at most twice.
        loop {
            if let Some(offset) = self.pools.acquire(&self.reservation.region(), class) {
                return Ok(offset);
            }
            self.grow_pool(class)?;
        }
    }

    fn alloc_coalescing(&mut self, size: usize) -> Result<usize, AllocError> {
        // `size <= arena_limit`, so a fresh arena always holds it.
        loop {
            let mut region = self.reservation.region();
            if let Some(offset) = self
                .arenas
                .iter_mut()
                .find_map(|arena| arena.allocate(&mut region, size))
            {
                return Ok(offset);
            }
            self.grow_arena()?;
        }
    }

    fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr() as usize;

        if let Some(offset) = self.reservation.offset_of(addr) {
            let mut region = self.reservation.region();
            if self.pools.owns(offset) {
                let class = self.pools.release(&mut region, offset)?;
                log::trace!("free {ptr:p} -> size class {class}");
                return Ok(());
            }
            if let Some(arena) = self.arenas.iter_mut().find(|a| a.contains(offset)) {
                let block = arena.free(&mut region, offset)?;
                log::trace!("free {ptr:p} -> arena ({block} bytes)");
                return Ok(());
            }
        } else if let Some(size) = self.large.free(ptr) {
            log::trace!("free {ptr:p} -> large ({size} bytes)");
            return Ok(());
        }

        Err(AllocError::ForeignPointer { addr })
    }

    fn usable_size(&mut self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let Some(offset) = self.reservation.offset_of(addr) else {
            return self.large.usable_size(ptr);
        };
        if self.pools.owns(offset) {
            return self.pools.usable_size(offset);
        }
        let region = self.reservation.region();
        self.arenas
            .iter()
            .find(|a| a.contains(offset))
            .and_then(|a| a.usable_size(&region, offset))
    }

    fn stats(&self) -> MemoryStats {
        let size_class_in_use = self.pools.live_bytes();
        let coalescing_in_use: usize = self.arenas.iter().map(FreeListArena::in_use).sum();
        let large_in_use = self.large.live_bytes();

        MemoryStats {
            reserved: self.reservation.size(),
            committed: self.reservation.committed(),
            size_class_committed: self.pools.committed_bytes(),
            size_class_in_use,
            coalescing_committed: self.arenas.iter().map(FreeListArena::capacity).sum(),
            coalescing_in_use,
            arena_count: self.arenas.len(),
            large_in_use,
            large_count: self.large.count(),
            bytes_in_use: size_class_in_use + coalescing_in_use + large_in_use,
        }
    }
}

/// Tiered allocator over one fixed reservation.
///
/// Requests are routed by size:
///
/// - up to `small_ceiling`: a power-of-two size class served from
///   fixed-block pools, one committed page per pool;
/// - up to `coalesce_ceiling`: rounded to a power of two and carved from
///   coalescing free-list arenas of `arena_size` bytes;
/// - anything larger: a dedicated OS mapping per object.
///
/// Pools and arenas are committed from the reservation front to back and
/// never handed back before `destroy`. Committed bytes plus live large
/// bytes never exceed `reservation_size`.
///
/// Single-threaded: `Send` but not `Sync`. Wrap in a lock to share.
pub struct TieredAllocator<V: VmOps = PlatformVmOps> {
    config: AllocatorConfig,
    heap: Option<Heap<V>>,
}

// Safety: TieredAllocator owns its reservation and every large mapping;
// no pointer into them is shared with another allocator instance.
unsafe impl<V: VmOps> Send for TieredAllocator<V> {}

impl TieredAllocator {
    /// Create an allocator backed by the platform's virtual memory.
    /// Nothing is reserved until [`init`](Self::init).
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration fails validation.
    pub fn new(config: AllocatorConfig) -> Result<Self, AllocError> {
        Self::with_vm(config)
    }
}

impl<V: VmOps> TieredAllocator<V> {
    /// Same as [`TieredAllocator::new`] with an explicit VM backend.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration fails validation.
    pub fn with_vm(config: AllocatorConfig) -> Result<Self, AllocError> {
        config.validate()?;
        Ok(Self { config, heap: None })
    }

    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.is_some()
    }

    /// Reserve the address range and commit one page per size class plus
    /// the first arena.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` on a second call without `destroy`, `Vm` if the
    /// OS refuses the reservation or the initial commit.
    pub fn init(&mut self) -> Result<(), AllocError> {
        if self.heap.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }
        self.heap = Some(Heap::new(&self.config)?);
        Ok(())
    }

    /// Release every large mapping and the reservation. Every pointer handed
    /// out so far dangles afterwards. The allocator can be `init`ed again.
    pub fn destroy(&mut self) {
        if let Some(mut heap) = self.heap.take() {
            heap.large.release_all();
            log::debug!("tiered allocator destroyed");
        }
    }

    fn heap_mut(&mut self, op: &str) -> &mut Heap<V> {
        match self.heap.as_mut() {
            Some(heap) => heap,
            None => panic!("TieredAllocator::{op} called before init"),
        }
    }

    /// Allocate `size` bytes.
    ///
    /// Small requests are aligned to their class size, everything else to
    /// `config.alignment` (at least a word).
    ///
    /// # Errors
    ///
    /// `ZeroSizeRequest` for `size == 0`, `OutOfReservation` when the
    /// reservation budget cannot cover the request, `Vm` if the OS fails.
    /// A failed call leaves the allocator unchanged.
    ///
    /// # Panics
    ///
    /// If called before [`init`](Self::init).
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let heap = self.heap_mut("alloc");
        if size == 0 {
            return Err(AllocError::ZeroSizeRequest);
        }
        heap.alloc(size)
    }

    /// Return memory obtained from [`alloc`](Self::alloc).
    ///
    /// Pointers this allocator does not own, and double frees, are logged
    /// and ignored in release builds and panic in debug builds.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call. Passing an interior pointer
    /// of a live coalescing block is undefined: its bytes are read as a
    /// block header.
    ///
    /// # Panics
    ///
    /// If called before [`init`](Self::init), or on an invalid free in
    /// debug builds.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        if let Err(e) = self.heap_mut("free").free(ptr) {
            if matches!(e, AllocError::DoubleFree { .. }) {
                log::error!("ignoring free of {ptr:p}: {e}");
            } else {
                log::warn!("ignoring free of {ptr:p}: {e}");
            }
            #[cfg(debug_assertions)]
            panic!("invalid free of {ptr:p}: {e}");
        }
    }

    /// Like [`free`](Self::free) but reports an invalid pointer instead of
    /// applying the logging policy. Nothing changes on error.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before `init`, `ForeignPointer` if no tier owns
    /// `ptr`, `DoubleFree` if its block is already free.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    pub unsafe fn try_free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.heap
            .as_mut()
            .ok_or(AllocError::NotInitialized)?
            .free(ptr)
    }

    /// Usable bytes behind a live pointer: the class size, the payload
    /// capacity of an arena block, or the large object size.
    #[must_use]
    pub fn usable_size(&mut self, ptr: NonNull<u8>) -> Option<usize> {
        self.heap.as_mut()?.usable_size(ptr)
    }

    /// Accounting snapshot. All zero before `init`.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.heap.as_ref().map(Heap::stats).unwrap_or_default()
    }

    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.stats().bytes_in_use
    }

    /// Per-class pool figures, smallest class first.
    #[must_use]
    pub fn size_class_stats(&self) -> Vec<SizeClassStats> {
        self.heap.as_ref().map_or_else(Vec::new, |heap| {
            heap.pools.class_sizes().map(|c| heap.pools.stats(c)).collect()
        })
    }

    /// Per-arena figures in creation order.
    #[must_use]
    pub fn arena_stats(&mut self) -> Vec<FreeListStats> {
        let Some(heap) = self.heap.as_mut() else {
            return Vec::new();
        };
        let region = heap.reservation.region();
        heap.arenas.iter().map(|a| a.stats(&region)).collect()
    }
}

impl<V: VmOps> Drop for TieredAllocator<V> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::config::{KIB, MIB};
    use crate::memory::vm::HeapVmOps;

    fn small_config() -> AllocatorConfig {
        AllocatorConfig {
            page_size: 4 * KIB,
            small_ceiling: 512,
            coalesce_ceiling: 16 * KIB,
            arena_size: 64 * KIB,
            reservation_size: MIB,
            alignment: 8,
        }
    }

    fn allocator() -> TieredAllocator<HeapVmOps> {
        let mut alloc = TieredAllocator::<HeapVmOps>::with_vm(small_config()).unwrap();
        alloc.init().unwrap();
        alloc
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = AllocatorConfig {
            small_ceiling: 100,
            ..AllocatorConfig::default()
        };
        assert!(matches!(
            TieredAllocator::new(config),
            Err(AllocError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_init_commits_initial_footprint() {
        let alloc = allocator();
        let stats = alloc.stats();
        assert_eq!(stats.reserved, MIB);
        assert_eq!(stats.committed, small_config().initial_footprint());
        assert_eq!(stats.size_class_committed, 7 * 4 * KIB);
        assert_eq!(stats.coalescing_committed, 64 * KIB);
        assert_eq!(stats.arena_count, 1);
        assert_eq!(stats.bytes_in_use, 0);
        assert!(alloc.size_class_stats().iter().all(|s| s.pools == 1));
    }

    #[test]
    fn test_init_twice_fails() {
        let mut alloc = allocator();
        assert!(matches!(alloc.init(), Err(AllocError::AlreadyInitialized)));
    }

    #[test]
    fn test_reinit_after_destroy() {
        let mut alloc = allocator();
        alloc.alloc(100).unwrap();
        alloc.destroy();
        assert!(!alloc.is_initialized());
        assert_eq!(alloc.stats(), MemoryStats::default());

        alloc.init().unwrap();
        assert_eq!(alloc.bytes_in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "before init")]
    fn test_alloc_before_init_panics() {
        let mut alloc = TieredAllocator::<HeapVmOps>::with_vm(small_config()).unwrap();
        let _ = alloc.alloc(8);
    }

    #[test]
    fn test_try_free_before_init() {
        let mut alloc = TieredAllocator::<HeapVmOps>::with_vm(small_config()).unwrap();
        let mut local = 0u64;
        // Safety: rejected before anything is touched.
        let err = unsafe { alloc.try_free(NonNull::from(&mut local).cast()) }.unwrap_err();
        assert!(matches!(err, AllocError::NotInitialized));
    }

    #[test]
    fn test_routing_by_size() {
        let mut alloc = allocator();

        let small = alloc.alloc(24).unwrap();
        assert_eq!(alloc.usable_size(small), Some(32));
        assert_eq!(alloc.stats().size_class_in_use, 32);

        let mid = alloc.alloc(513).unwrap();
        assert_eq!(alloc.usable_size(mid), Some(1024));
        assert_eq!(alloc.stats().coalescing_in_use, 1024 + HEADER_SIZE);

        let big = alloc.alloc(16 * KIB + 1).unwrap();
        assert_eq!(alloc.usable_size(big), Some(16 * KIB + 8));
        assert_eq!(alloc.stats().large_count, 1);

        // Safety: all three came from `alloc`.
        unsafe {
            alloc.try_free(small).unwrap();
            alloc.try_free(mid).unwrap();
            alloc.try_free(big).unwrap();
        }
        assert_eq!(alloc.bytes_in_use(), 0);
    }

    #[test]
    fn test_mid_size_that_never_fits_an_arena_goes_large() {
        let config = AllocatorConfig {
            coalesce_ceiling: 48 * KIB,
            arena_size: 32 * KIB,
            ..small_config()
        };
        let mut alloc = TieredAllocator::<HeapVmOps>::with_vm(config).unwrap();
        alloc.init().unwrap();

        // Rounds to 32 KiB, which leaves no room for the header.
        let p = alloc.alloc(20 * KIB).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.large_count, 1);
        assert_eq!(stats.large_in_use, 20 * KIB);
        assert_eq!(stats.arena_count, 1);
        // Safety: from `alloc`.
        unsafe { alloc.free(p) };
    }

    #[test]
    fn test_small_allocations_honour_alignment() {
        let config = AllocatorConfig {
            alignment: 64,
            ..small_config()
        };
        let mut alloc = TieredAllocator::<HeapVmOps>::with_vm(config).unwrap();
        alloc.init().unwrap();
        assert_eq!(alloc.size_class_stats().len(), 4);
        assert_eq!(alloc.stats().size_class_committed, 4 * 4 * KIB);

        let mut ptrs = Vec::new();
        for size in (1..=512).chain([8, 8, 8, 8, 600, 3000]) {
            let p = alloc.alloc(size).unwrap();
            assert_eq!(p.as_ptr() as usize % 64, 0, "alloc({size}) -> {p:p}");
            assert!(alloc.usable_size(p).unwrap() >= size);
            ptrs.push(p);
        }
        // Every request up to 64 bytes shares the smallest class.
        assert_eq!(alloc.size_class_stats()[0].block_size, 64);
        assert_eq!(alloc.usable_size(ptrs[0]), Some(64));

        for p in ptrs {
            // Safety: from `alloc`.
            unsafe { alloc.try_free(p).unwrap() };
        }
        assert_eq!(alloc.bytes_in_use(), 0);
    }

    #[test]
    fn test_huge_mid_size_request_does_not_overflow() {
        let config = AllocatorConfig {
            coalesce_ceiling: usize::MAX,
            ..small_config()
        };
        let mut alloc = TieredAllocator::<HeapVmOps>::with_vm(config).unwrap();
        alloc.init().unwrap();
        let before = alloc.stats();

        // No power of two holds this; it must fall through to the large tier
        // and fail on the budget instead of growing arenas.
        let err = alloc.alloc(usize::MAX / 2 + 2).unwrap_err();
        assert!(err.is_exhaustion(), "{err}");
        assert_eq!(alloc.stats(), before);
    }

    #[test]
    fn test_pool_grows_when_class_exhausted() {
        let mut alloc = allocator();
        let slots = 4 * KIB / 512;
        let ptrs: Vec<_> = (0..=slots).map(|_| alloc.alloc(512).unwrap()).collect();

        let class = alloc.size_class_stats()[6];
        assert_eq!(class.block_size, 512);
        assert_eq!(class.pools, 2);
        assert_eq!(alloc.stats().size_class_committed, 8 * 4 * KIB);

        for p in ptrs {
            // Safety: from `alloc`.
            unsafe { alloc.try_free(p).unwrap() };
        }
        assert_eq!(alloc.stats().size_class_in_use, 0);
    }

    #[test]
    fn test_second_arena_when_first_full() {
        let mut alloc = allocator();
        // 16 KiB payload + header: three fit into a 64 KiB arena, not four.
        let ptrs: Vec<_> = (0..4).map(|_| alloc.alloc(16 * KIB).unwrap()).collect();
        assert_eq!(alloc.stats().arena_count, 2);

        let arenas = alloc.arena_stats();
        assert_eq!(arenas[0].in_use, 3 * (16 * KIB + HEADER_SIZE));
        assert_eq!(arenas[1].in_use, 16 * KIB + HEADER_SIZE);

        for p in ptrs {
            // Safety: from `alloc`.
            unsafe { alloc.try_free(p).unwrap() };
        }
        assert!(alloc.arena_stats().iter().all(|a| a.free_nodes == 1));
    }

    #[test]
    fn test_foreign_and_double_free_are_classified() {
        let mut alloc = allocator();
        let mut local = 0u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();
        // Safety: rejected before anything is touched.
        let err = unsafe { alloc.try_free(foreign) }.unwrap_err();
        assert!(matches!(err, AllocError::ForeignPointer { .. }));

        let p = alloc.alloc(64).unwrap();
        // Safety: from `alloc`; the second call is rejected.
        unsafe {
            alloc.try_free(p).unwrap();
            assert!(matches!(
                alloc.try_free(p),
                Err(AllocError::DoubleFree { .. })
            ));
        }
    }

    #[test]
    fn test_zero_size_changes_nothing() {
        let mut alloc = allocator();
        let before = alloc.stats();
        assert!(matches!(alloc.alloc(0), Err(AllocError::ZeroSizeRequest)));
        assert_eq!(alloc.stats(), before);
    }
}
