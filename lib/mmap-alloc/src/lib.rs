//! Host memory mappings for guest RAM.
//!
//! Regions are reserved with a caller-chosen alignment, optionally backed by a
//! file descriptor (including hugetlbfs), and flanked by inaccessible guard
//! extents so stray accesses past either end fault immediately.

#![cfg(unix)]
#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]
#![cfg_attr(
    feature = "cargo-clippy",
    warn(
        clippy::mut_mut,
        clippy::nonminimal_bool,
        clippy::map_unwrap_or,
        clippy::print_stdout,
        clippy::use_self
    )
)]

mod error;
mod mapping;
mod page_size;

pub use crate::error::MmapError;
pub use crate::mapping::{AlignedMapping, MappingRequest, unmap};
pub use crate::page_size::{
    HUGETLBFS_MAGIC, fd_page_size, host_page_size, path_page_size, try_path_page_size,
    vmalloc_align,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
