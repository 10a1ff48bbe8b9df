use std::io;

use thiserror::Error;

/// Errors raised while creating coroutines.
#[derive(Debug, Error)]
pub enum CoroutineError {
    /// The pool had no parked stack and a new one could not be mapped.
    #[error("failed to allocate a {size}-byte coroutine stack: {source}")]
    StackAllocation {
        /// Requested stack size in bytes.
        size: usize,
        /// The underlying allocation failure.
        #[source]
        source: io::Error,
    },
}
