//! The event-loop side of the engine.

use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use crate::{Coroutine, engine};

/// Marker left on coroutines queued through [`ExecutionContext::schedule`].
const SCHEDULE_SITE: &str = "ExecutionContext::schedule";

/// An event-loop context that coroutines run under.
///
/// Every entered coroutine records the context it was entered in, so wake-ups
/// issued later can be routed back to the right loop. Coroutines queued with
/// [`schedule`](Self::schedule) are entered on the next
/// [`run_scheduled`](Self::run_scheduled).
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    name: String,
    scheduled: RefCell<VecDeque<Coroutine>>,
}

impl ExecutionContext {
    /// Create a context. The name only shows up in diagnostics.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                name: name.into(),
                scheduled: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `co` to be entered by the next [`run_scheduled`](Self::run_scheduled).
    ///
    /// # Panics
    ///
    /// If `co` is already queued somewhere: entering it twice could resume it
    /// after it has terminated.
    pub fn schedule(&self, co: &Coroutine) {
        if let Some(site) = co.inner.scheduled.replace(Some(SCHEDULE_SITE)) {
            panic!("coroutine {} was already scheduled in '{site}'", co.id());
        }
        tracing::trace!(ctx = self.name(), co = %co.id(), "schedule coroutine");
        self.inner.scheduled.borrow_mut().push_back(co.clone());
    }

    /// Whether any coroutine is waiting for [`run_scheduled`](Self::run_scheduled).
    pub fn has_scheduled(&self) -> bool {
        !self.inner.scheduled.borrow().is_empty()
    }

    /// Enter every coroutine queued so far, in queue order.
    ///
    /// Coroutines scheduled while this runs wait for the next call. Returns
    /// the number of coroutines entered.
    pub fn run_scheduled(&self) -> usize {
        let batch = self.inner.scheduled.take();
        let entered = batch.len();
        for co in batch {
            co.inner.scheduled.set(None);
            engine::enter(self, &co);
        }
        entered
    }

    /// Shorthand for [`engine::enter`](crate::enter) in this context.
    pub fn enter(&self, co: &Coroutine) {
        engine::enter(self, co);
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ExecutionContext {}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name())
            .field("scheduled", &self.inner.scheduled.borrow().len())
            .finish()
    }
}
