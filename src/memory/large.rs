use super::vm::{VmError, VmOps};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// One live mapping handed to the caller.
struct LargeRecord {
    base: NonNull<u8>,
    /// Requested size (already rounded to the alignment).
    size: usize,
    /// Mapping length (size rounded to the OS page).
    mapped: usize,
}

/// Requests above the coalescing ceiling. Each one gets its own OS mapping,
/// released as soon as it is freed. No caching and no reuse.
///
/// Records live in a flat list: large objects are few, and a scan is
/// cheaper than a map for a handful of entries.
pub(crate) struct LargeObjects<V: VmOps> {
    records: Vec<LargeRecord>,
    live_bytes: usize,
    _vm: PhantomData<V>,
}

impl<V: VmOps> LargeObjects<V> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            live_bytes: 0,
            _vm: PhantomData,
        }
    }

    /// Map `size` bytes, page aligned and committed.
    ///
    /// # Errors
    ///
    /// `VmError` if the OS refuses the reservation or the commit. A failed
    /// commit releases the reservation first.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        let mapped = size.next_multiple_of(V::page_size());
        // Safety: fresh mapping, nothing else references it.
        let base = unsafe {
            let base = V::reserve(mapped)?;
            if let Err(e) = V::commit(base, mapped) {
                if let Err(release) = V::release(base, mapped) {
                    log::error!("failed to release {base:p} after commit failure: {release}");
                }
                return Err(e);
            }
            base
        };

        self.records.push(LargeRecord { base, size, mapped });
        self.live_bytes += size;
        log::debug!("large object {size} bytes at {base:p}");
        Ok(base)
    }

    /// Release the mapping that starts exactly at `ptr`.
    ///
    /// Returns the freed size, or `None` if no record starts there.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Option<usize> {
        let idx = self.records.iter().position(|r| r.base == ptr)?;
        let record = self.records.swap_remove(idx);
        self.live_bytes -= record.size;
        Self::unmap(&record);
        log::debug!("large object {} bytes at {ptr:p} released", record.size);
        Some(record.size)
    }

    fn unmap(record: &LargeRecord) {
        // Safety: base/mapped are what `allocate` got from `reserve`, and the
        // record has been removed so nothing hands the pointer out again.
        if let Err(e) = unsafe { V::release(record.base, record.mapped) } {
            log::error!("failed to release large object at {:p}: {e}", record.base);
        }
    }

    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.records.iter().find(|r| r.base == ptr).map(|r| r.size)
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Unmap everything still live.
    pub fn release_all(&mut self) {
        if !self.records.is_empty() {
            log::debug!("releasing {} large objects", self.records.len());
        }
        for record in self.records.drain(..) {
            Self::unmap(&record);
        }
        self.live_bytes = 0;
    }
}

impl<V: VmOps> Drop for LargeObjects<V> {
    fn drop(&mut self) {
        self.release_all();
    }
}
