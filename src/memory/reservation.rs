use super::error::AllocError;
use super::vm::{VmError, VmOps};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Bytes in one intrusive link/size word.
pub(crate) const WORD: usize = std::mem::size_of::<usize>();

/// One contiguous address range reserved up front and committed front to
/// back with a bump cursor.
///
/// Every tier addresses memory inside the reservation by *offset* from the
/// base; raw pointers only exist at the public boundary.
pub(crate) struct Reservation<V: VmOps> {
    base: NonNull<u8>,
    /// Byte budget requested by the caller.
    size: usize,
    /// Actual mapping length (size rounded up to the OS page).
    mapped: usize,
    /// High-water mark: `[0, committed)` is backed by physical pages.
    committed: usize,
    _vm: PhantomData<V>,
}

impl<V: VmOps> Reservation<V> {
    /// Reserve `size` bytes of address space. Nothing is committed yet.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the OS refuses the reservation.
    pub fn new(size: usize) -> Result<Self, VmError> {
        let mapped = size.next_multiple_of(V::page_size());
        // Safety: nothing touches the range until it is committed.
        let base = unsafe { V::reserve(mapped)? };
        log::debug!("reserved {size} bytes at {base:p}");

        Ok(Self {
            base,
            size,
            mapped,
            committed: 0,
            _vm: PhantomData,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Commit the next `len` bytes and return their offset.
    ///
    /// # Errors
    ///
    /// `OutOfReservation` when the range would run past the reservation,
    /// `Vm` when the OS commit fails. On error nothing changes.
    pub fn commit_next(&mut self, len: usize) -> Result<usize, AllocError> {
        let offset = self.committed;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or(AllocError::OutOfReservation {
                requested: len,
                available: self.size - offset,
            })?;

        // Widen to OS page boundaries: the configured page may be smaller than
        // the OS page, and committing an already-committed page is harmless.
        let os_page = V::page_size();
        let start = offset - offset % os_page;
        let stop = end.next_multiple_of(os_page).min(self.mapped);
        // Safety: `start..stop` lies inside the mapping and is OS-page aligned.
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.as_ptr().add(start));
            V::commit(ptr, stop - start)?;
        }

        self.committed = end;
        log::debug!("committed [{offset:#x}, {end:#x}) of {:#x}", self.size);
        Ok(offset)
    }

    /// Offset of `addr` if it lies inside the committed part of the range.
    #[must_use]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let base = self.base.as_ptr() as usize;
        addr.checked_sub(base).filter(|&off| off < self.committed)
    }

    /// Pointer to a committed offset.
    #[must_use]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset < self.committed,
            "offset {offset:#x} outside committed range {:#x}",
            self.committed
        );
        // Safety: offset is inside the mapping, base is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Word-level view of the committed bytes.
    pub fn region(&mut self) -> Region<'_> {
        Region {
            base: self.base,
            len: self.committed,
            _borrow: PhantomData,
        }
    }
}

impl<V: VmOps> Drop for Reservation<V> {
    fn drop(&mut self) {
        // Safety: base/mapped are exactly what `reserve` handed out, and the
        // allocator that owns this reservation is going away with it.
        if let Err(e) = unsafe { V::release(self.base, self.mapped) } {
            log::error!("failed to release reservation at {:p}: {e}", self.base);
        } else {
            log::debug!("released reservation at {:p} ({} bytes)", self.base, self.mapped);
        }
    }
}

/// Mutable word accessors over the committed part of a reservation.
///
/// Intrusive free lists and allocation headers live inside the managed
/// memory itself; this is the only place that reads or writes them.
/// Every access is bounds-checked against the committed length.
pub(crate) struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _borrow: PhantomData<&'a mut [u8]>,
}

impl Region<'_> {
    /// Absolute address of an offset. Alignment math is done on addresses,
    /// not offsets, so it holds whatever the base alignment is.
    #[inline]
    #[must_use]
    pub fn addr_of(&self, offset: usize) -> usize {
        self.base.as_ptr() as usize + offset
    }

    #[inline]
    fn word_ptr(&self, offset: usize) -> *mut usize {
        assert!(
            offset.checked_add(WORD).is_some_and(|end| end <= self.len),
            "word access at {offset:#x} outside committed range {:#x}",
            self.len
        );
        // Safety: bounds checked above.
        unsafe { self.base.as_ptr().add(offset).cast::<usize>() }
    }

    #[inline]
    #[must_use]
    pub fn read_word(&self, offset: usize) -> usize {
        // Safety: in bounds, committed, and owned by the allocator.
        unsafe { self.word_ptr(offset).read_unaligned() }
    }

    #[inline]
    pub fn write_word(&mut self, offset: usize, value: usize) {
        // Safety: in bounds, committed, and owned by the allocator.
        unsafe { self.word_ptr(offset).write_unaligned(value) }
    }
}
