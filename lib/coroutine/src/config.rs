use crate::pool::{DEFAULT_POOL_CAPACITY, DEFAULT_STACK_SIZE};

/// Tunables for a [`CoroutineEngine`](crate::CoroutineEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    stack_size: usize,
    pool_capacity: usize,
}

impl EngineConfig {
    /// Size in bytes of every coroutine stack, excluding its guard page.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// How many stacks the pool keeps alive once coroutines terminate.
    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    /// Size in bytes of every coroutine stack.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Pool capacity.
    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}
