//! Free list of coroutine stacks.
//!
//! Mapping a stack is the expensive part of creating a coroutine, so the
//! stacks of terminated coroutines are parked here and handed to the next
//! coroutine. The pool stops parking once `total` reaches its capacity:
//! stacks released past that point are unmapped instead.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use corosensei::stack::DefaultStack;

use crate::{
    CoroutineError,
    coroutine::{Body, Coroutine},
};

/// Default number of stacks a pool keeps.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Default coroutine stack size, 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// A bounded pool of coroutine stacks.
///
/// Cloning the pool yields another handle to the same free list. Pools are
/// bound to the thread that created them.
#[derive(Clone)]
pub struct CoroutinePool {
    inner: Rc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    stack_size: usize,
    /// Stacks allocated by this pool and not yet unmapped.
    total: Cell<usize>,
    parked: RefCell<Vec<DefaultStack>>,
}

impl CoroutinePool {
    /// Create a pool that keeps up to `capacity` stacks of `stack_size` bytes.
    pub fn new(capacity: usize, stack_size: usize) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                capacity,
                stack_size,
                total: Cell::new(0),
                parked: RefCell::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    /// Create a coroutine that will run `entry` when first entered.
    ///
    /// Reuses a parked stack when one is available and maps a new one
    /// otherwise.
    pub fn acquire<F>(&self, entry: F) -> Result<Coroutine, CoroutineError>
    where
        F: FnOnce() + 'static,
    {
        let parked = self.inner.parked.borrow_mut().pop();
        let stack = match parked {
            Some(stack) => stack,
            None => {
                let size = self.inner.stack_size;
                let stack = DefaultStack::new(size)
                    .map_err(|source| CoroutineError::StackAllocation { size, source })?;
                self.inner.total.set(self.inner.total.get() + 1);
                stack
            }
        };
        Ok(Coroutine::new(self.clone(), stack, entry))
    }

    /// Take back the stack of a coroutine that has terminated.
    pub(crate) fn release(&self, co: &Coroutine, body: Body) {
        co.inner.caller.borrow_mut().take();

        let stack = body.into_stack();
        let total = self.inner.total.get();
        if total >= self.inner.capacity {
            drop(stack);
            self.inner.total.set(total - 1);
        } else {
            self.inner.parked.borrow_mut().push(stack);
        }
    }

    /// Account for the stack of a coroutine dropped before it terminated.
    pub(crate) fn forget_stack(&self) {
        self.inner.total.set(self.inner.total.get() - 1);
    }

    /// Stacks allocated by this pool that are still mapped, parked or in use.
    pub fn total(&self) -> usize {
        self.inner.total.get()
    }

    /// Stacks currently parked for reuse.
    pub fn parked(&self) -> usize {
        self.inner.parked.borrow().len()
    }

    /// Maximum number of stacks kept once coroutines terminate.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Size of every stack handed out by this pool.
    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }
}

impl Default for CoroutinePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_STACK_SIZE)
    }
}

impl fmt::Debug for CoroutinePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutinePool")
            .field("capacity", &self.capacity())
            .field("stack_size", &self.stack_size())
            .field("total", &self.total())
            .field("parked", &self.parked())
            .finish()
    }
}
