use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    ptr::NonNull,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

use corosensei::{Yielder, stack::DefaultStack};

use crate::{context::ExecutionContext, pool::CoroutinePool};

/// The switchable half of a coroutine: its stack and saved registers.
pub(crate) type Body = corosensei::Coroutine<(), (), (), DefaultStack>;

/// Process-wide unique identifier of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroutineId(u64);

impl CoroutineId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whoever entered a coroutine and gets control back when it yields.
#[derive(Debug, Clone)]
pub(crate) enum Caller {
    /// The thread's own stack, outside of any coroutine.
    Thread,
    Coroutine(Weak<CoroutineInner>),
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => f.write_str("thread"),
            Self::Coroutine(co) => match co.upgrade() {
                Some(co) => write!(f, "coroutine {}", co.id),
                None => f.write_str("dropped coroutine"),
            },
        }
    }
}

pub(crate) struct CoroutineInner {
    pub(crate) id: CoroutineId,
    /// `None` while the coroutine runs and after it terminates.
    pub(crate) body: RefCell<Option<Body>>,
    /// Published by the body when it first runs; lives on the body's stack.
    pub(crate) yielder: Cell<Option<NonNull<Yielder<(), ()>>>>,
    pub(crate) caller: RefCell<Option<Caller>>,
    pub(crate) ctx: RefCell<Option<ExecutionContext>>,
    /// Name of the site that queued the coroutine on a context, if any.
    pub(crate) scheduled: Cell<Option<&'static str>>,
    /// Coroutines woken while this one ran; entered right after it switches out.
    pub(crate) wakeup: RefCell<VecDeque<Coroutine>>,
    pub(crate) locks_held: Cell<usize>,
    pub(crate) terminated: Cell<bool>,
    pub(crate) pool: CoroutinePool,
}

impl Drop for CoroutineInner {
    fn drop(&mut self) {
        // A body that never terminated is unwound and its stack unmapped
        // instead of being parked.
        if let Some(body) = self.body.get_mut().take() {
            #[cfg(panic = "abort")]
            let body = {
                let mut body = body;
                if body.started() && !body.done() {
                    // SAFETY: nothing on the suspended stack is reachable from
                    // outside the coroutine; its locals are leaked, not unwound.
                    unsafe { body.force_reset() };
                }
                body
            };
            drop(body);
            self.pool.forget_stack();
        }
    }
}

/// A handle to a stackful coroutine.
///
/// Handles are cheap to clone and compare equal when they refer to the same
/// coroutine. Dropping the last handle to a suspended coroutine unwinds its
/// stack.
#[derive(Clone)]
pub struct Coroutine {
    pub(crate) inner: Rc<CoroutineInner>,
}

impl Coroutine {
    pub(crate) fn new<F>(pool: CoroutinePool, stack: DefaultStack, entry: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        let inner = Rc::new(CoroutineInner {
            id: CoroutineId::next(),
            body: RefCell::new(None),
            yielder: Cell::new(None),
            caller: RefCell::new(None),
            ctx: RefCell::new(None),
            scheduled: Cell::new(None),
            wakeup: RefCell::new(VecDeque::new()),
            locks_held: Cell::new(0),
            terminated: Cell::new(false),
            pool,
        });

        let this = Rc::downgrade(&inner);
        let body = Body::with_stack(stack, move |yielder: &Yielder<(), ()>, _: ()| {
            if let Some(this) = this.upgrade() {
                this.yielder.set(Some(NonNull::from(yielder)));
            }
            entry();
        });
        *inner.body.borrow_mut() = Some(body);

        Self { inner }
    }

    /// Identifier of this coroutine.
    pub fn id(&self) -> CoroutineId {
        self.inner.id
    }

    /// Whether the coroutine is running or has entered another coroutine,
    /// i.e. whether it has a caller to yield to.
    pub fn is_entered(&self) -> bool {
        self.inner.caller.borrow().is_some()
    }

    /// The context the coroutine was last entered in. `None` until it is
    /// first entered.
    pub fn context(&self) -> Option<ExecutionContext> {
        self.inner.ctx.borrow().clone()
    }

    /// Whether the coroutine is queued on a context waiting to be entered.
    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.get().is_some()
    }

    /// Whether the entry function has returned.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.get()
    }

    /// Number of coroutine locks currently held.
    pub fn locks_held(&self) -> usize {
        self.inner.locks_held.get()
    }

    /// Record that this coroutine holds a lock until the guard is dropped.
    ///
    /// Coroutine-aware locks take one of these for every acquisition. A
    /// coroutine that terminates while any guard is outstanding is a bug.
    pub fn hold_lock(&self) -> LockHold {
        self.inner.locks_held.set(self.inner.locks_held.get() + 1);
        LockHold { co: self.clone() }
    }

    pub(crate) fn caller(&self) -> Option<Caller> {
        self.inner.caller.borrow().clone()
    }
}

impl PartialEq for Coroutine {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Coroutine {}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("entered", &self.is_entered())
            .field("scheduled", &self.inner.scheduled.get())
            .field("terminated", &self.is_terminated())
            .field("locks_held", &self.locks_held())
            .finish()
    }
}

/// A lock acquisition counted against a coroutine.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockHold {
    co: Coroutine,
}

impl Drop for LockHold {
    fn drop(&mut self) {
        let held = &self.co.inner.locks_held;
        held.set(held.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let pool = CoroutinePool::new(0, 64 * 1024);
        let a = pool.acquire(|| {}).unwrap();
        let b = pool.acquire(|| {}).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn new_coroutine_is_inactive() {
        let co = CoroutinePool::default().acquire(|| {}).unwrap();
        assert!(!co.is_entered());
        assert!(!co.is_scheduled());
        assert!(!co.is_terminated());
        assert!(co.context().is_none());
        assert!(co.caller().is_none());
    }

    #[test]
    fn lock_holds_are_counted() {
        let co = CoroutinePool::default().acquire(|| {}).unwrap();
        let first = co.hold_lock();
        let second = co.hold_lock();
        assert_eq!(co.locks_held(), 2);
        drop(first);
        assert_eq!(co.locks_held(), 1);
        drop(second);
        assert_eq!(co.locks_held(), 0);
    }
}
