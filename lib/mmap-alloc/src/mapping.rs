//! Aligned reservations flanked by guard extents.
//!
//! A reservation is laid out as
//!
//! ```text
//! reservation                base = reservation + slack
//! |-- slack (PROT_NONE) --|-- usable (len bytes, RW) --|-- guard page --|-- tail --|
//! ```
//!
//! The whole extent is over-allocated by `align + page_size` so an aligned
//! window and a trailing guard page always fit, even when `len` is already a
//! multiple of the alignment.

use std::{
    io,
    mem::ManuallyDrop,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    ptr, slice,
};

use more_asserts::assert_ge;

use crate::{
    MmapError,
    page_size::{fd_page_size, host_page_size},
};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // Not exported by every libc target.
        const MAP_SHARED_VALIDATE: libc::c_int = 0x03;
        const MAP_SYNC: libc::c_int = 0x08_0000;
    } else {
        const MAP_SHARED_VALIDATE: libc::c_int = 0;
        const MAP_SYNC: libc::c_int = 0;
    }
}

/// Round `size` up to the nearest multiple of `page_size`.
fn round_up_to_page_size(size: usize, page_size: usize) -> Option<usize> {
    size.checked_next_multiple_of(page_size)
}

fn too_large(len: usize) -> MmapError {
    MmapError::Reserve {
        len,
        source: io::Error::from_raw_os_error(libc::ENOMEM),
    }
}

/// How a request is backed once the host's page-size rules are applied.
#[derive(Debug, Clone, Copy)]
struct Backing {
    fd: Option<RawFd>,
    page_size: usize,
    flags: libc::c_int,
}

impl Backing {
    fn for_fd(fd: Option<BorrowedFd<'_>>) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", target_arch = "powerpc64"))] {
                // Mappings in one ppc64 segment must share a page size, so a
                // region on hugepages is reserved through its own descriptor
                // without reserving backing store.
                let page_size = fd_page_size(fd);
                match fd {
                    Some(fd) if page_size != host_page_size() => Self {
                        fd: Some(fd.as_raw_fd()),
                        page_size,
                        flags: libc::MAP_NORESERVE,
                    },
                    _ => Self {
                        fd: None,
                        page_size,
                        flags: libc::MAP_ANONYMOUS,
                    },
                }
            } else {
                match fd {
                    Some(fd) => Self {
                        fd: Some(fd.as_raw_fd()),
                        page_size: fd_page_size(Some(fd)),
                        flags: 0,
                    },
                    None => Self {
                        fd: None,
                        page_size: host_page_size(),
                        flags: libc::MAP_ANONYMOUS,
                    },
                }
            }
        }
    }
}

/// Parameters for [`MappingRequest::map`].
#[derive(Debug, Clone, Copy)]
pub struct MappingRequest<'fd> {
    size: usize,
    align: usize,
    fd: Option<BorrowedFd<'fd>>,
    shared: bool,
    persistent: bool,
}

impl<'fd> MappingRequest<'fd> {
    /// Request `size` bytes of private anonymous memory aligned to `align`.
    pub fn new(size: usize, align: usize) -> Self {
        Self {
            size,
            align,
            fd: None,
            shared: false,
            persistent: false,
        }
    }

    /// Back the mapping with `fd` instead of anonymous memory.
    ///
    /// The file should be at least `size + align + page size` bytes long, or
    /// touching the tail of the reservation will raise `SIGBUS`.
    pub fn backed_by(mut self, fd: BorrowedFd<'fd>) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Share writes with other mappings of the same backing (`MAP_SHARED`).
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Ask for writes to survive a host crash (`MAP_SYNC`). Only honoured for
    /// shared mappings on persistent-memory (DAX) filesystems.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Reserve the region.
    ///
    /// # Panics
    ///
    /// If `size` is zero, `align` is not a power of two, or `align` is smaller
    /// than the backing page size.
    pub fn map(&self) -> Result<AlignedMapping, MmapError> {
        let backing = Backing::for_fd(self.fd);
        let page_size = backing.page_size;

        assert!(self.size > 0, "cannot map an empty region");
        assert!(
            self.align.is_power_of_two(),
            "alignment {:#x} is not a power of two",
            self.align
        );
        // Always align to the backing page size.
        assert_ge!(self.align, page_size);

        let len =
            round_up_to_page_size(self.size, page_size).ok_or_else(|| too_large(self.size))?;
        let total = len
            .checked_add(self.align)
            .and_then(|n| n.checked_add(page_size))
            .ok_or_else(|| too_large(len))?;

        let flags = backing.flags
            | if self.shared {
                libc::MAP_SHARED
            } else {
                libc::MAP_PRIVATE
            };
        let sync_flags = if self.shared && self.persistent {
            MAP_SYNC | MAP_SHARED_VALIDATE
        } else {
            0
        };

        let mut degraded = false;
        let reservation = match reserve(total, flags | sync_flags, backing.fd) {
            Ok(addr) => addr,
            Err(err) if sync_flags != 0 => {
                if err.raw_os_error() == Some(libc::ENOTSUP) {
                    warn_without_persistence(backing.fd);
                }
                // Same layout, without the durability request.
                degraded = true;
                reserve(total, flags, backing.fd)
                    .map_err(|source| MmapError::Reserve { len: total, source })?
            }
            Err(source) => return Err(MmapError::Reserve { len: total, source }),
        };

        let slack = reservation.next_multiple_of(self.align) - reservation;
        if slack != 0 {
            // SAFETY: `[reservation, reservation + slack)` lies inside the
            // reservation made above and nothing references it yet.
            let protected = unsafe {
                region::protect(reservation as *const u8, slack, region::Protection::NONE)
            };
            if let Err(source) = protected {
                release_quietly(reservation, total);
                return Err(MmapError::GuardSlack { len: slack, source });
            }
        }

        let mut trailing_guard = false;
        if total - slack > len + page_size {
            let guard = reservation + slack + len;
            // SAFETY: the guard page lies inside the reservation, right after
            // the usable bytes.
            let protected = unsafe {
                region::protect(guard as *const u8, page_size, region::Protection::NONE)
            };
            match protected {
                Ok(()) => trailing_guard = true,
                Err(err) => {
                    tracing::debug!(guard, error = %err, "trailing guard page not installed")
                }
            }
        }

        tracing::debug!(
            base = reservation + slack,
            len,
            align = self.align,
            page_size,
            shared = self.shared,
            degraded,
            "mapped aligned region"
        );

        Ok(AlignedMapping {
            reservation,
            reserved_len: total,
            slack,
            len,
            page_size,
            align: self.align,
            trailing_guard,
            degraded,
        })
    }
}

fn reserve(len: usize, flags: libc::c_int, fd: Option<RawFd>) -> io::Result<usize> {
    // SAFETY: a new mapping at a kernel-chosen address aliases nothing.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd.unwrap_or(-1),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as usize)
}

fn release(addr: usize, len: usize) -> io::Result<()> {
    // SAFETY: callers only pass extents they reserved and no longer reference.
    let r = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn release_quietly(addr: usize, len: usize) {
    if let Err(err) = release(addr, len) {
        tracing::debug!(addr, len, error = %err, "munmap failed");
    }
}

fn warn_without_persistence(fd: Option<RawFd>) {
    let file = fd
        .and_then(|fd| std::fs::read_link(format!("/proc/self/fd/{fd}")).ok())
        .unwrap_or_default();
    tracing::warn!(
        file = %file.display(),
        "requesting persistence across crashes failed; proceeding without persistence, \
         data might become corrupted in case of host crash"
    );
}

/// An aligned region of host memory with guard extents.
///
/// The handle remembers the full reservation it was carved from, so dropping
/// it releases the slack, the usable bytes, the guard page and the tail in
/// one go.
#[derive(Debug)]
pub struct AlignedMapping {
    // Stored as `usize` instead of a pointer so the handle is `Send` and `Sync`
    // without `unsafe impl`; the kernel coordinates access to the pages.
    reservation: usize,
    reserved_len: usize,
    slack: usize,
    len: usize,
    page_size: usize,
    align: usize,
    trailing_guard: bool,
    degraded: bool,
}

impl AlignedMapping {
    /// Start of the usable region.
    pub fn as_ptr(&self) -> *const u8 {
        (self.reservation + self.slack) as *const u8
    }

    /// Start of the usable region.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        (self.reservation + self.slack) as *mut u8
    }

    /// Number of usable bytes: the requested size rounded up to the page size.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; empty mappings are rejected at creation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The usable region.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the usable bytes stay mapped read/write until `self` drops.
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// The usable region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`; `&mut self` makes the borrow exclusive.
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }

    /// Page size of the backing store; also the size of the guard page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Alignment of [`as_ptr`](Self::as_ptr).
    pub fn alignment(&self) -> usize {
        self.align
    }

    /// Bytes of inaccessible slack in front of the usable region.
    pub fn slack_len(&self) -> usize {
        self.slack
    }

    /// Whether an inaccessible page follows the usable region.
    pub fn has_trailing_guard(&self) -> bool {
        self.trailing_guard
    }

    /// Whether crash persistence was requested but could not be provided.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Give up ownership and return the base pointer.
    ///
    /// Release it with [`unmap`], passing the same descriptor and size used to
    /// create it. That call only releases the usable bytes and the guard page;
    /// the slack in front of the region and the tail behind the guard page
    /// stay reserved.
    pub fn into_raw(self) -> *mut u8 {
        let this = ManuallyDrop::new(self);
        (this.reservation + this.slack) as *mut u8
    }
}

impl Drop for AlignedMapping {
    fn drop(&mut self) {
        // SAFETY: the handle owns the whole reservation and nothing borrows it.
        let r = unsafe { libc::munmap(self.reservation as *mut libc::c_void, self.reserved_len) };
        assert_eq!(r, 0, "munmap failed: {}", io::Error::last_os_error());
    }
}

/// Release a region obtained from [`AlignedMapping::into_raw`].
///
/// Unmaps `size` bytes (rounded up to the page size) plus one guard page,
/// where the page size is recomputed from `fd` exactly as it was when the
/// region was mapped. A null `ptr` is ignored.
///
/// # Safety
///
/// `ptr` must come from [`AlignedMapping::into_raw`] on a mapping created with
/// the same `fd` and `size`, and nothing may reference the region afterwards.
pub unsafe fn unmap(fd: Option<BorrowedFd<'_>>, ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    let page_size = Backing::for_fd(fd).page_size;
    let Some(len) =
        round_up_to_page_size(size, page_size).and_then(|len| len.checked_add(page_size))
    else {
        tracing::debug!(addr = ptr as usize, size, "unmap size overflows");
        return;
    };
    release_quietly(ptr as usize, len);
}

#[cfg(test)]
mod tests {
    use std::os::{fd::AsFd, unix::fs::FileExt};

    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn test_round_up_to_page_size() {
        assert_eq!(round_up_to_page_size(0, 4096), Some(0));
        assert_eq!(round_up_to_page_size(1, 4096), Some(4096));
        assert_eq!(round_up_to_page_size(4096, 4096), Some(4096));
        assert_eq!(round_up_to_page_size(4097, 4096), Some(8192));
        assert_eq!(round_up_to_page_size(usize::MAX - 10, 4096), None);
    }

    #[test]
    fn oversized_request_is_refused() {
        let page = host_page_size();
        for size in [usize::MAX - 10, usize::MAX - 2 * page] {
            match MappingRequest::new(size, page).map() {
                Err(MmapError::Reserve { source, .. }) => {
                    assert_eq!(source.raw_os_error(), Some(libc::ENOMEM));
                }
                other => panic!("unexpected result for {size:#x}: {other:?}"),
            }
        }
    }

    #[test]
    fn reservation_covers_slack_usable_and_guard() {
        let page = host_page_size();
        let mapping = MappingRequest::new(3 * page, 8 * page).map().unwrap();
        assert_eq!(mapping.reserved_len, 3 * page + 8 * page + page);
        assert!(mapping.slack_len() < mapping.alignment());
        assert_eq!(mapping.as_ptr() as usize % (8 * page), 0);
        assert!(mapping.has_trailing_guard());
        assert!(!mapping.is_degraded());
    }

    #[test]
    fn size_is_rounded_to_whole_pages() {
        let page = host_page_size();
        let mut mapping = MappingRequest::new(page + 1, page).map().unwrap();
        assert_eq!(mapping.len(), 2 * page);
        mapping.as_mut_slice().fill(0xa5);
        assert!(mapping.as_slice().iter().all(|&b| b == 0xa5));
    }

    #[test]
    #[should_panic(expected = "is not a power of two")]
    fn non_power_of_two_alignment_is_a_programming_error() {
        let page = host_page_size();
        let _ = MappingRequest::new(page, 3 * page).map();
    }

    #[test]
    #[should_panic]
    fn alignment_below_page_size_is_a_programming_error() {
        let _ = MappingRequest::new(host_page_size(), 16).map();
    }

    #[test]
    fn raw_unmap_ignores_null() {
        unsafe { unmap(None, ptr::null_mut(), 4096) };
    }

    #[test]
    #[traced_test]
    fn failed_release_is_logged() {
        // An unaligned address is always rejected by `munmap`.
        release_quietly(1, host_page_size());
        assert!(logs_contain("munmap failed"));
    }

    #[test]
    fn raw_unmap_tolerates_overflowing_size() {
        let page = host_page_size();
        let mapping = MappingRequest::new(page, page).map().unwrap();
        let ptr = mapping.into_raw();
        unsafe {
            unmap(None, ptr, usize::MAX);
            unmap(None, ptr, page);
        }
    }

    #[test]
    fn file_backed_raw_pointer_is_released_through_its_descriptor() {
        let page = host_page_size();
        let file = tempfile::tempfile().unwrap();
        file.set_len((8 * page) as u64).unwrap();

        let mapping = MappingRequest::new(3 * page, 4 * page)
            .backed_by(file.as_fd())
            .shared(true)
            .map()
            .unwrap();
        assert_eq!(mapping.page_size(), fd_page_size(Some(file.as_fd())));
        let slack = mapping.slack_len();
        let ptr = mapping.into_raw();
        unsafe {
            ptr.write_bytes(0x3c, 3 * page);
            unmap(Some(file.as_fd()), ptr, 3 * page);
        }

        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, (slack + 3 * page - 1) as u64).unwrap();
        assert_eq!(byte, [0x3c]);
    }

    #[test]
    fn raw_pointer_is_released_with_the_same_size() {
        let page = host_page_size();
        let mapping = MappingRequest::new(4 * page, 4 * page).map().unwrap();
        let ptr = mapping.into_raw();
        unsafe {
            ptr.write_bytes(0x5a, 4 * page);
            unmap(None, ptr, 4 * page);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[traced_test]
    fn persistence_falls_back_when_unsupported() {
        let page = host_page_size();
        let file = tempfile::tempfile().unwrap();
        file.set_len((4 * page) as u64).unwrap();

        let mapping = MappingRequest::new(4 * page, page)
            .backed_by(file.as_fd())
            .shared(true)
            .persistent(true)
            .map();

        // Temporary directories are never DAX-capable, so `MAP_SYNC` is refused
        // and the degraded path has to be taken.
        let mut mapping = mapping.unwrap();
        assert!(mapping.is_degraded());
        assert!(logs_contain("proceeding without persistence"));
        mapping.as_mut_slice()[0] = 1;
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn degraded_mapping_keeps_its_alignment() {
        let page = host_page_size();
        let (size, align) = (4 * page, 64 * page);
        let file = tempfile::tempfile().unwrap();
        file.set_len((size + align + page) as u64).unwrap();

        for _ in 0..8 {
            let mut mapping = MappingRequest::new(size, align)
                .backed_by(file.as_fd())
                .shared(true)
                .persistent(true)
                .map()
                .unwrap();
            assert!(mapping.is_degraded());
            assert_eq!(mapping.as_ptr() as usize % align, 0);
            assert_eq!(mapping.len(), size);
            assert!(mapping.has_trailing_guard());
            mapping.as_mut_slice().fill(0x11);
        }
    }
}
