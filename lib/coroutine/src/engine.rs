//! The enter/yield protocol.
//!
//! [`enter`] switches to a coroutine and keeps running until it and every
//! coroutine it woke along the way have yielded or terminated. The coroutine
//! currently running on this thread is tracked in a thread local so that
//! [`yield_now`] and [`wake`] can find it without being handed a reference.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use corosensei::CoroutineResult;
use scopeguard::ScopeGuard;

use crate::{
    Coroutine, CoroutineError, CoroutinePool, EngineConfig, ExecutionContext,
    coroutine::{Body, Caller},
};

thread_local! {
    static CURRENT: RefCell<Option<Coroutine>> = const { RefCell::new(None) };
}

/// How control came back from a coroutine.
enum CoroutineAction {
    Yield,
    Terminate(Body),
}

/// The coroutine running on this thread, if any.
pub fn current() -> Option<Coroutine> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Whether the caller is running inside a coroutine.
pub fn in_coroutine() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// Switch to `to` until it yields or terminates.
fn switch(to: &Coroutine) -> CoroutineAction {
    let body = to
        .inner
        .body
        .borrow_mut()
        .take()
        .unwrap_or_else(|| panic!("coroutine {} entered after it terminated", to.id()));
    // A panic escaping the entry function ends the coroutine; its stack is
    // unmapped rather than parked.
    let mut body = scopeguard::guard_on_unwind(body, |body| {
        drop(body);
        to.inner.caller.borrow_mut().take();
        to.inner.yielder.set(None);
        to.inner.terminated.set(true);
        to.inner.pool.forget_stack();
    });

    let previous = CURRENT.with(|current| current.replace(Some(to.clone())));
    let _restore = scopeguard::guard(previous, |previous| {
        CURRENT.with(|current| *current.borrow_mut() = previous);
    });

    let result = body.resume(());
    let body = ScopeGuard::into_inner(body);
    match result {
        CoroutineResult::Yield(()) => {
            *to.inner.body.borrow_mut() = Some(body);
            CoroutineAction::Yield
        }
        CoroutineResult::Return(()) => CoroutineAction::Terminate(body),
    }
}

fn terminate(co: &Coroutine, body: Body) {
    let locks = co.locks_held();
    assert!(
        locks == 0,
        "coroutine {} terminated while holding {locks} lock(s)",
        co.id()
    );
    tracing::trace!(co = %co.id(), "terminate coroutine");

    co.inner.terminated.set(true);
    co.inner.yielder.set(None);
    co.inner.pool.release(co, body);
}

/// Enter `co` in `ctx`, then every coroutine woken while it ran.
///
/// Woken coroutines run depth-first: whatever a coroutine woke is entered
/// right after it switches out, before coroutines that were already pending,
/// and in the order it woke them.
///
/// # Panics
///
/// If a coroutine about to be entered is queued on a context, is already
/// entered (recursive re-entry), has terminated, or terminates while holding
/// locks.
pub fn enter(ctx: &ExecutionContext, co: &Coroutine) {
    let from = current();
    let caller = match &from {
        Some(from) => Caller::Coroutine(Rc::downgrade(&from.inner)),
        None => Caller::Thread,
    };

    let mut pending = VecDeque::from([co.clone()]);
    while let Some(to) = pending.pop_front() {
        if let Some(site) = to.inner.scheduled.get() {
            panic!("coroutine {} was already scheduled in '{site}'", to.id());
        }
        if to.is_entered() {
            panic!("coroutine {} re-entered recursively", to.id());
        }

        *to.inner.caller.borrow_mut() = Some(caller.clone());
        *to.inner.ctx.borrow_mut() = Some(ctx.clone());
        tracing::trace!(ctx = ctx.name(), from = %caller, to = %to.id(), "enter coroutine");

        let action = switch(&to);

        let woken = to.inner.wakeup.take();
        for co in woken.into_iter().rev() {
            pending.push_front(co);
        }

        match action {
            CoroutineAction::Yield => {}
            CoroutineAction::Terminate(body) => terminate(&to, body),
        }
    }
}

/// Enter `co` unless it is already entered.
pub fn enter_if_inactive(ctx: &ExecutionContext, co: &Coroutine) {
    if !co.is_entered() {
        enter(ctx, co);
    }
}

/// Suspend the running coroutine and return control to its caller.
///
/// # Panics
///
/// If called outside of a coroutine, or from a coroutine that nobody entered.
pub fn yield_now() {
    let Some(this) = current() else {
        panic!("coroutine is yielding to no one");
    };
    let caller = this.inner.caller.borrow_mut().take();
    let (Some(caller), Some(yielder)) = (caller, this.inner.yielder.get()) else {
        panic!("coroutine is yielding to no one");
    };
    tracing::trace!(co = %this.id(), to = %caller, "yield coroutine");
    drop(this);

    // SAFETY: the yielder was published by the body of the running coroutine
    // and lives on its stack, which is the stack we are executing on.
    unsafe { yielder.as_ref() }.suspend(());
}

/// Make `co` runnable again.
///
/// The target context is the one `co` last ran in or, for a coroutine that
/// has never run, the context of the running coroutine.
///
/// - Inside a coroutine running in that context, `co` is queued behind the
///   running coroutine and entered as soon as it switches out.
/// - Inside a coroutine running in another context, `co` is
///   [scheduled](ExecutionContext::schedule) there.
/// - Outside of any coroutine, `co` is entered immediately.
///
/// # Panics
///
/// If no context can be determined.
pub fn wake(co: &Coroutine) {
    let this = current();
    let ctx = co
        .context()
        .or_else(|| this.as_ref().and_then(Coroutine::context))
        .unwrap_or_else(|| panic!("coroutine {} has no context to be woken in", co.id()));

    match this {
        Some(this) if this.context().as_ref() == Some(&ctx) => {
            tracing::trace!(co = %co.id(), by = %this.id(), "queue coroutine wake-up");
            this.inner.wakeup.borrow_mut().push_back(co.clone());
        }
        Some(_) => ctx.schedule(co),
        None => enter(&ctx, co),
    }
}

/// A context plus the pool its coroutines draw stacks from.
///
/// Engines are bound to the thread that created them; run one per event-loop
/// thread.
#[derive(Debug, Clone)]
pub struct CoroutineEngine {
    context: ExecutionContext,
    pool: CoroutinePool,
}

impl CoroutineEngine {
    /// Create an engine with the default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, EngineConfig::default())
    }

    /// Create an engine with the given configuration.
    pub fn with_config(name: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            context: ExecutionContext::new(name),
            pool: CoroutinePool::new(config.pool_capacity(), config.stack_size()),
        }
    }

    /// Create a coroutine running `entry`, reusing a pooled stack if possible.
    pub fn spawn<F>(&self, entry: F) -> Result<Coroutine, CoroutineError>
    where
        F: FnOnce() + 'static,
    {
        self.pool.acquire(entry)
    }

    /// [`enter`] `co` in this engine's context.
    pub fn enter(&self, co: &Coroutine) {
        enter(&self.context, co);
    }

    /// [`enter_if_inactive`] `co` in this engine's context.
    pub fn enter_if_inactive(&self, co: &Coroutine) {
        enter_if_inactive(&self.context, co);
    }

    /// Enter every coroutine scheduled on this engine's context.
    pub fn run_scheduled(&self) -> usize {
        self.context.run_scheduled()
    }

    /// The engine's context.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// The engine's stack pool.
    pub fn pool(&self) -> &CoroutinePool {
        &self.pool
    }
}
