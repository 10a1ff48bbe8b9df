use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised while probing page sizes or creating a mapping.
#[derive(Debug, Error)]
pub enum MmapError {
    /// The kernel refused to reserve the address range.
    #[error("failed to reserve {len} bytes of address space: {source}")]
    Reserve {
        /// Number of bytes requested from the kernel.
        len: usize,
        /// The underlying `mmap` failure.
        #[source]
        source: io::Error,
    },
    /// The alignment slack in front of the usable region could not be made
    /// inaccessible. The reservation has already been released.
    #[error("failed to protect {len} bytes of alignment slack: {source}")]
    GuardSlack {
        /// Length of the slack region.
        len: usize,
        /// The underlying protection failure.
        #[source]
        source: region::Error,
    },
    /// `statfs` on a memory path failed.
    #[error("couldn't statfs() memory path {}: {source}", .path.display())]
    Statfs {
        /// The path that was probed.
        path: PathBuf,
        /// The underlying `statfs` failure.
        #[source]
        source: io::Error,
    },
}
