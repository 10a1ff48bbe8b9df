//! Effective page size of a mapping's backing store.
//!
//! Anonymous memory uses the host page size. Memory backed by a hugetlbfs file
//! uses the huge page size the filesystem reports as its block size, and every
//! guard and alignment computation for such a mapping has to use that size too.

use std::{os::fd::BorrowedFd, path::Path};

use crate::MmapError;

/// `f_type` reported by `statfs` for a hugetlbfs mount.
pub const HUGETLBFS_MAGIC: u32 = 0x9584_58f6;

/// SHMLBA for SPARC Linux: the L1 data cache size.
#[cfg(all(target_os = "linux", any(target_arch = "sparc", target_arch = "sparc64")))]
const SPARC_SHMLBA: usize = 0x4000;

/// The host's base page size.
pub fn host_page_size() -> usize {
    region::page::size()
}

/// Alignment required for virtual allocations on this host.
///
/// This is the host page size everywhere except SPARC Linux, where mappings
/// must also honour SHMLBA.
pub fn vmalloc_align() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", any(target_arch = "sparc", target_arch = "sparc64")))] {
            host_page_size().max(SPARC_SHMLBA)
        } else {
            host_page_size()
        }
    }
}

/// Page size to use for memory backed by `fd`.
///
/// Returns the huge page size when `fd` lives on hugetlbfs. Any failure to
/// query the descriptor is ignored and the default alignment is returned.
pub fn fd_page_size(fd: Option<BorrowedFd<'_>>) -> usize {
    fd.and_then(|fd| sys::fd_hugepage_size(fd).ok().flatten())
        .unwrap_or_else(vmalloc_align)
}

/// Page size to use for memory backed by files under `path`.
///
/// Unlike [`fd_page_size`], a failed `statfs` is fatal: the process logs the
/// error and exits, since a wrong page size would silently corrupt guest RAM
/// layout. Use [`try_path_page_size`] to handle the error instead.
pub fn path_page_size(path: Option<&Path>) -> usize {
    match try_path_page_size(path) {
        Ok(size) => size,
        Err(err) => {
            tracing::error!(error = %err, "cannot determine the page size of the memory path");
            std::process::exit(1);
        }
    }
}

/// Fallible form of [`path_page_size`].
pub fn try_path_page_size(path: Option<&Path>) -> Result<usize, MmapError> {
    if let Some(path) = path {
        let hugepage = sys::path_hugepage_size(path).map_err(|source| MmapError::Statfs {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(size) = hugepage {
            return Ok(size);
        }
    }
    Ok(vmalloc_align())
}

#[cfg(target_os = "linux")]
mod sys {
    use std::{
        ffi::CString,
        io, mem,
        os::{
            fd::{AsRawFd, BorrowedFd},
            unix::ffi::OsStrExt,
        },
        path::Path,
    };

    use super::HUGETLBFS_MAGIC;

    /// Run a `statfs`-family call, retrying on `EINTR`.
    fn retry_statfs(
        mut call: impl FnMut(&mut libc::statfs) -> libc::c_int,
    ) -> io::Result<libc::statfs> {
        // SAFETY: `statfs` is a plain C struct for which all-zeroes is valid.
        let mut fs: libc::statfs = unsafe { mem::zeroed() };
        loop {
            if call(&mut fs) == 0 {
                return Ok(fs);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    // `f_type` and `f_bsize` change width and signedness between targets.
    #[allow(clippy::unnecessary_cast)]
    fn hugepage_size(fs: &libc::statfs) -> Option<usize> {
        (fs.f_type as u32 == HUGETLBFS_MAGIC).then_some(fs.f_bsize as usize)
    }

    pub(super) fn fd_hugepage_size(fd: BorrowedFd<'_>) -> io::Result<Option<usize>> {
        let raw = fd.as_raw_fd();
        // SAFETY: `raw` stays open for the lifetime of the borrow and `fs`
        // points to a live `statfs`.
        let fs = retry_statfs(|fs| unsafe { libc::fstatfs(raw, fs) })?;
        Ok(hugepage_size(&fs))
    }

    pub(super) fn path_hugepage_size(path: &Path) -> io::Result<Option<usize>> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `path` is NUL-terminated and `fs` points to a live `statfs`.
        let fs = retry_statfs(|fs| unsafe { libc::statfs(path.as_ptr(), fs) })?;
        Ok(hugepage_size(&fs))
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::{io, os::fd::BorrowedFd, path::Path};

    // There is no hugetlbfs outside of Linux.

    pub(super) fn fd_hugepage_size(_fd: BorrowedFd<'_>) -> io::Result<Option<usize>> {
        Ok(None)
    }

    pub(super) fn path_hugepage_size(_path: &Path) -> io::Result<Option<usize>> {
        Ok(None)
    }
}
