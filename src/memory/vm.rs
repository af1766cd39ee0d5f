use std::io;
use std::ptr::NonNull;

use thiserror::Error;

/// Alignment and commit granularity of heap-backed reservations.
const HEAP_PAGE: usize = 4096;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
}

/// Virtual memory backend the allocator is built on.
///
/// The allocator core depends only on this trait; which backend is used is a
/// type parameter of [`TieredAllocator`](super::tiered::TieredAllocator).
/// Address space is reserved once, committed front to back, and released
/// whole. Nothing is ever handed back page by page.
pub trait VmOps {
    /// Reserve `size` bytes of address space without backing them.
    ///
    /// # Safety
    /// The returned range must not be touched before it is committed.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Back `ptr..ptr + size` with readable, writable pages. Committing an
    /// already committed page leaves its contents intact.
    ///
    /// # Safety
    /// The range must lie inside a live reservation and `ptr` must be
    /// aligned to [`VmOps::page_size`].
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Give a whole reservation back. Every pointer into it dangles.
    ///
    /// # Safety
    /// `ptr` and `size` must be exactly what was passed to / returned by
    /// [`VmOps::reserve`].
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Granularity of `commit`.
    fn page_size() -> usize;
}

/// Backend for the host operating system.
///
/// On unix this is `mmap`/`mprotect`/`munmap`. Under Miri and on hosts
/// without a supported VM API it falls back to [`HeapVmOps`].
pub struct PlatformVmOps;

/// Heap-backed `VmOps`: every reservation is a zeroed, page-aligned heap
/// block that is readable from the start, so `commit` has nothing to do.
pub struct HeapVmOps;

impl HeapVmOps {
    fn layout(size: usize) -> io::Result<std::alloc::Layout> {
        std::alloc::Layout::from_size_align(size, HEAP_PAGE).map_err(io::Error::other)
    }
}

impl VmOps for HeapVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = Self::layout(size).map_err(VmError::ReservationFailed)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::from(io::ErrorKind::OutOfMemory))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = Self::layout(size).map_err(VmError::ReleaseFailed)?;
        // Safety: ptr was allocated with the same layout by `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        HEAP_PAGE
    }
}

#[cfg(all(unix, not(miri)))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps, io};
    use std::sync::OnceLock;

    /// Map a libc status code to `Ok` or the current `errno`.
    fn check(rc: libc::c_int, wrap: fn(io::Error) -> VmError) -> Result<(), VmError> {
        if rc == 0 {
            Ok(())
        } else {
            Err(wrap(io::Error::last_os_error()))
        }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: anonymous PROT_NONE mapping; no existing memory is touched.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            let addr = ptr.as_ptr().cast::<libc::c_void>();
            // Safety: the range lies inside a reservation we own.
            let rc = unsafe { libc::mprotect(addr, size, libc::PROT_READ | libc::PROT_WRITE) };
            check(rc, VmError::CommitFailed)?;

            // Pools and arenas are carved up right after commit.
            #[cfg(target_os = "linux")]
            // Safety: advisory only, same range as above.
            unsafe {
                libc::madvise(addr, size, libc::MADV_WILLNEED);
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: caller passes back exactly what `reserve` mapped.
            let rc = unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) };
            check(rc, VmError::ReleaseFailed)
        }

        fn page_size() -> usize {
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: sysconf has no preconditions.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or_else(|| {
                    panic!("sysconf(_SC_PAGESIZE) failed: {}", io::Error::last_os_error())
                })
            })
        }
    }
}

#[cfg(any(miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded contract.
        unsafe { HeapVmOps::reserve(size) }
    }

    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded contract.
        unsafe { HeapVmOps::commit(ptr, size) }
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded contract.
        unsafe { HeapVmOps::release(ptr, size) }
    }

    fn page_size() -> usize {
        HeapVmOps::page_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pointer `offset` bytes into a reservation.
    fn at(base: NonNull<u8>, offset: usize) -> NonNull<u8> {
        // Safety: callers stay inside the reservation.
        unsafe { base.add(offset) }
    }

    #[test]
    fn test_bump_commits_inside_one_reservation() {
        // The reservation layer commits consecutive pieces of one range.
        let page = PlatformVmOps::page_size();
        let total = 8 * page;
        // Safety: every byte touched below was committed first.
        unsafe {
            let base = PlatformVmOps::reserve(total).unwrap();
            let mut cursor = 0;
            for pages in [2, 3, 1] {
                let len = pages * page;
                PlatformVmOps::commit(at(base, cursor), len).unwrap();
                at(base, cursor).as_ptr().write(pages as u8);
                at(base, cursor + len - 1).as_ptr().write(0xee);
                cursor += len;
            }
            assert_eq!(base.as_ptr().read(), 2);
            assert_eq!(at(base, 2 * page).as_ptr().read(), 3);
            assert_eq!(at(base, 5 * page).as_ptr().read(), 1);
            assert_eq!(at(base, cursor - 1).as_ptr().read(), 0xee);
            PlatformVmOps::release(base, total).unwrap();
        }
    }

    #[test]
    fn test_widened_recommit_keeps_contents() {
        // Sub-page commits get widened to whole pages, so the page holding
        // the previous commit's tail is committed again.
        let page = PlatformVmOps::page_size();
        // Safety: as above.
        unsafe {
            let base = PlatformVmOps::reserve(4 * page).unwrap();
            PlatformVmOps::commit(base, page).unwrap();
            at(base, page / 2).as_ptr().write(0x42);

            PlatformVmOps::commit(base, 3 * page).unwrap();
            assert_eq!(at(base, page / 2).as_ptr().read(), 0x42);
            at(base, 3 * page - 1).as_ptr().write(7);
            assert_eq!(at(base, 3 * page - 1).as_ptr().read(), 7);
            PlatformVmOps::release(base, 4 * page).unwrap();
        }
    }

    #[test]
    fn test_large_object_mappings_are_independent() {
        // One mapping per large object; releasing one leaves the rest.
        let page = PlatformVmOps::page_size();
        let sizes = [page, 3 * page, 5 * page];
        // Safety: as above.
        unsafe {
            let maps: Vec<_> = sizes
                .iter()
                .map(|&len| {
                    let ptr = PlatformVmOps::reserve(len).unwrap();
                    PlatformVmOps::commit(ptr, len).unwrap();
                    at(ptr, len - 1).as_ptr().write((len / page) as u8);
                    ptr
                })
                .collect();

            PlatformVmOps::release(maps[1], sizes[1]).unwrap();
            assert_eq!(at(maps[0], sizes[0] - 1).as_ptr().read(), 1);
            assert_eq!(at(maps[2], sizes[2] - 1).as_ptr().read(), 5);
            PlatformVmOps::release(maps[0], sizes[0]).unwrap();
            PlatformVmOps::release(maps[2], sizes[2]).unwrap();
        }
    }

    #[test]
    fn test_zero_size_reservation_is_refused() {
        // Safety: nothing is mapped on failure.
        unsafe {
            assert!(PlatformVmOps::reserve(0).is_err());
            assert!(matches!(HeapVmOps::reserve(0), Err(VmError::ReservationFailed(_))));
        }
    }

    #[test]
    fn test_heap_backend_is_zeroed_and_page_aligned() {
        let page = HeapVmOps::page_size();
        assert!(page.is_power_of_two());
        assert!(PlatformVmOps::page_size().is_power_of_two());
        // Safety: heap reservations are readable once returned.
        unsafe {
            let ptr = HeapVmOps::reserve(3 * page).unwrap();
            assert_eq!(ptr.as_ptr() as usize % page, 0);
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), 3 * page);
            assert!(bytes.iter().all(|&b| b == 0));
            HeapVmOps::release(ptr, 3 * page).unwrap();
        }
    }
}
