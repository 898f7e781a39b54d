//! Execution contexts and the thread-local current scheduler.
//!
//! Every job runs under an [`ExecutionContext`]: the monitor that receives its
//! errors, its priority, and a map of local values. Contexts are immutable;
//! scoped changes build a new context and run code [`within`] it.
//!
//! The scheduler handle is explicit (see `Scheduler`), but while a scheduler
//! is entered or running it is also installed in thread-local storage so that
//! primitives such as `Deferred::upon` can capture the ambient context without
//! threading a handle through every call.
//!
//! # Example
//!
//! ```ignore
//! use deferred_kernel::{ExecutionContext, Priority, within};
//!
//! let low = ExecutionContext::current().with_priority(Priority::Low);
//! within(&low, || {
//!     // callbacks registered here run after normal-priority jobs
//! });
//! ```

use crate::deferred::Deferred;
use crate::monitor::Monitor;
use crate::runtime::core::Core;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    /// The scheduler entered on this thread, if any.
    ///
    /// Set by [`enter_context`] for the duration of `Scheduler::enter` and of
    /// every run call.
    static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// Job priority. Normal jobs of a cycle run before low ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    Low,
}

static NEXT_LOCAL_KEY: AtomicU64 = AtomicU64::new(0);

/// Typed key into an execution context's local values.
pub struct LocalKey<T> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> LocalKey<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_LOCAL_KEY.fetch_add(1, Ordering::Relaxed),
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for LocalKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for LocalKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Immutable bundle of monitor, priority and local values.
#[derive(Clone)]
pub struct ExecutionContext {
    monitor: Monitor,
    priority: Priority,
    locals: Rc<HashMap<u64, Rc<dyn Any>>>,
}

impl ExecutionContext {
    pub(crate) fn root(monitor: Monitor) -> Self {
        Self {
            monitor,
            priority: Priority::Normal,
            locals: Rc::new(HashMap::new()),
        }
    }

    /// Returns the context of the code currently running.
    ///
    /// # Panics
    /// Panics if called outside of a scheduler context.
    pub fn current() -> Self {
        with_current(|core| core.current_context())
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn with_monitor(&self, monitor: Monitor) -> Self {
        Self {
            monitor,
            ..self.clone()
        }
    }

    pub fn with_priority(&self, priority: Priority) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }

    /// Returns a context where `key` maps to `value`, or is unset for `None`.
    pub fn with_local<T: Clone + 'static>(&self, key: &LocalKey<T>, value: Option<T>) -> Self {
        let mut locals = (*self.locals).clone();

        match value {
            Some(value) => {
                locals.insert(key.id, Rc::new(value));
            }
            None => {
                locals.remove(&key.id);
            }
        }

        Self {
            locals: Rc::new(locals),
            ..self.clone()
        }
    }

    pub fn find_local<T: Clone + 'static>(&self, key: &LocalKey<T>) -> Option<T> {
        self.locals
            .get(&key.id)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("monitor", &self.monitor)
            .field("priority", &self.priority)
            .field("locals", &self.locals.len())
            .finish()
    }
}

// Restores the previously entered scheduler, also when unwinding.
struct Restore(Option<Rc<Core>>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Installs `core` as the thread's current scheduler while `function` runs.
///
/// The previously installed scheduler, if any, is restored on exit.
pub(crate) fn enter_context<F, R>(core: &Rc<Core>, function: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = CURRENT.with(|current| current.borrow_mut().replace(core.clone()));
    let _restore = Restore(previous);

    function()
}

/// Runs `function` with the current scheduler.
///
/// # Panics
/// Panics if no scheduler is entered on this thread.
pub(crate) fn with_current<R>(function: impl FnOnce(&Rc<Core>) -> R) -> R {
    let core = try_current().expect("called outside of a scheduler context");
    function(&core)
}

pub(crate) fn try_current() -> Option<Rc<Core>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Runs `function` as if `context` were the current execution context.
///
/// A panic inside `function` is sent to `context`'s monitor and `None` is
/// returned. The previous context is restored in every case.
pub fn within<T>(context: &ExecutionContext, function: impl FnOnce() -> T) -> Option<T> {
    with_current(|core| {
        let monitor = context.monitor.clone();
        let result = core.with_context(context.clone(), || {
            panic::catch_unwind(AssertUnwindSafe(function))
        });

        match result {
            Ok(value) => Some(value),
            Err(payload) => {
                core.send_error(&monitor, crate::Error::from_panic(payload));
                None
            }
        }
    })
}

/// Like [`within`] for functions returning a deferred; yields
/// [`Deferred::never`] when `function` panicked.
pub fn within_deferred<T: Clone + 'static>(
    context: &ExecutionContext,
    function: impl FnOnce() -> Deferred<T>,
) -> Deferred<T> {
    within(context, function).unwrap_or_else(Deferred::never)
}

/// Runs `function` with the current context's priority replaced.
pub fn with_priority<T>(priority: Priority, function: impl FnOnce() -> T) -> Option<T> {
    within(&ExecutionContext::current().with_priority(priority), function)
}

/// Runs `function` with `key` bound to `value` in the current context.
pub fn with_local<K: Clone + 'static, T>(
    key: &LocalKey<K>,
    value: Option<K>,
    function: impl FnOnce() -> T,
) -> Option<T> {
    within(&ExecutionContext::current().with_local(key, value), function)
}

/// Looks `key` up in the current execution context.
pub fn find_local<T: Clone + 'static>(key: &LocalKey<T>) -> Option<T> {
    ExecutionContext::current().find_local(key)
}
