//! The monitor tree.
//!
//! Monitors catch errors raised by the jobs running under them. Every monitor
//! except the root has a parent; an error sent to a monitor with no handlers
//! walks up the tree until some monitor handles it, a detached monitor drops
//! it, or it reaches the root and stops the scheduler.
//!
//! Nodes live in a [`Slab`] owned by the scheduler and are reference counted:
//! a [`Monitor`] value, an execution context referencing one, and each child
//! node keep a node alive. A node whose count drops to zero is removed along
//! with its handlers.
//!
//! # Example
//!
//! ```ignore
//! use deferred_kernel::{Deferred, monitor::try_with};
//!
//! let result = sched.block_on(|| try_with(|| -> Deferred<()> { panic!("boom") }))?;
//! assert!(result.is_err());
//! ```

use crate::deferred::{Deferred, Ivar};
use crate::error::{Error, raise_error};
use crate::runtime::context::{ExecutionContext, within_deferred};
use crate::runtime::core::Core;

use slab::Slab;
use tracing::debug;

use std::fmt;
use std::rc::{Rc, Weak};

pub(crate) type ErrorHandler = Rc<dyn Fn(Error)>;

/// An error handler and the context it runs under.
pub(crate) struct Handler {
    context: ExecutionContext,
    run: ErrorHandler,
}

pub(crate) struct Node {
    name: String,
    parent: Option<usize>,
    depth: usize,
    handlers: Vec<Handler>,
    has_seen_error: bool,
    is_detached: bool,
    refs: usize,
}

/// Outcome of sending an error into the tree.
pub(crate) enum Route {
    /// Schedule every handler of the handling monitor. `escalate_to` is the
    /// handling monitor's parent, already counted, for errors the handlers
    /// themselves raise.
    Handle {
        handlers: Vec<(ExecutionContext, ErrorHandler)>,
        escalate_to: Option<usize>,
    },
    /// A detached monitor without handlers swallowed the error.
    Ignore { monitor: String },
    /// The error reached the root.
    Unhandled { monitor: String },
}

#[derive(Default)]
pub(crate) struct MonitorArena {
    nodes: Slab<Node>,
}

impl MonitorArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a node holding one reference, which the caller owns.
    pub(crate) fn insert(&mut self, name: String, parent: Option<usize>) -> usize {
        let depth = match parent.and_then(|id| self.nodes.get_mut(id)) {
            Some(node) => {
                node.refs += 1;
                node.depth + 1
            }
            None => 0,
        };

        self.nodes.insert(Node {
            name,
            parent,
            depth,
            handlers: Vec::new(),
            has_seen_error: false,
            is_detached: false,
            refs: 1,
        })
    }

    pub(crate) fn acquire(&mut self, id: usize) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.refs += 1;
        }
    }

    /// Drops one reference on `id`, removing nodes whose count reaches zero.
    ///
    /// Removed nodes are returned rather than dropped so that the handles they
    /// own are released after the caller gives up its borrow of the arena.
    pub(crate) fn release(&mut self, id: usize) -> Vec<Node> {
        let mut removed = Vec::new();
        let mut next = Some(id);

        while let Some(id) = next.take() {
            let Some(node) = self.nodes.get_mut(id) else {
                break;
            };

            node.refs -= 1;
            if node.refs > 0 {
                break;
            }

            let node = self.nodes.remove(id);
            next = node.parent;
            removed.push(node);
        }

        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn route(&mut self, start: usize) -> Route {
        let origin = match self.nodes.get(start) {
            Some(node) => node.name.clone(),
            None => {
                return Route::Ignore {
                    monitor: String::from("<released>"),
                };
            }
        };

        let mut id = start;
        loop {
            let node = &mut self.nodes[id];
            node.has_seen_error = true;

            if !node.handlers.is_empty() {
                let handlers = node
                    .handlers
                    .iter()
                    .map(|handler| (handler.context.clone(), handler.run.clone()))
                    .collect();
                let escalate_to = node.parent;

                if let Some(parent) = escalate_to {
                    self.acquire(parent);
                }

                return Route::Handle {
                    handlers,
                    escalate_to,
                };
            }

            if node.is_detached {
                return Route::Ignore {
                    monitor: node.name.clone(),
                };
            }

            match node.parent {
                Some(parent) => id = parent,
                None => return Route::Unhandled { monitor: origin },
            }
        }
    }
}

struct MonitorHandle {
    id: usize,
    core: Weak<Core>,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let removed = core.monitors.borrow_mut().release(self.id);
            drop(removed);
        }
    }
}

/// A node of the monitor tree.
///
/// Cloning a monitor is cheap and shares the node.
#[derive(Clone)]
pub struct Monitor {
    handle: Rc<MonitorHandle>,
}

impl Monitor {
    /// Wraps a node id whose reference the caller already holds.
    pub(crate) fn from_counted(core: Weak<Core>, id: usize) -> Self {
        Self {
            handle: Rc::new(MonitorHandle { id, core }),
        }
    }

    /// Creates a child of the current context's monitor.
    ///
    /// # Panics
    /// Panics if called outside of a scheduler context.
    pub fn create(name: impl Into<String>) -> Self {
        Self::create_with_parent(name, ExecutionContext::current().monitor())
    }

    pub fn create_with_parent(name: impl Into<String>, parent: &Monitor) -> Self {
        let name = name.into();
        let core = parent.handle.core.clone();

        let id = match core.upgrade() {
            Some(core) => {
                let mut arena = core.monitors.borrow_mut();
                arena.insert(name.clone(), Some(parent.id()))
            }
            None => usize::MAX,
        };

        debug!(monitor = %name, id, parent = parent.id(), "monitor created");
        Self::from_counted(core, id)
    }

    /// Returns the monitor of the current execution context.
    pub fn current() -> Self {
        ExecutionContext::current().monitor().clone()
    }

    pub(crate) fn id(&self) -> usize {
        self.handle.id
    }

    fn with_node<R>(&self, function: impl FnOnce(&mut MonitorArena, usize) -> R) -> Option<R> {
        let core = self.handle.core.upgrade()?;
        let mut arena = core.monitors.borrow_mut();

        if !arena.nodes.contains(self.handle.id) {
            return None;
        }

        Some(function(&mut arena, self.handle.id))
    }

    pub fn name(&self) -> String {
        self.with_node(|arena, id| arena.nodes[id].name.clone())
            .unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Monitor> {
        let parent = self.with_node(|arena, id| {
            let parent = arena.nodes[id].parent?;
            arena.acquire(parent);
            Some(parent)
        })??;

        Some(Monitor::from_counted(self.handle.core.clone(), parent))
    }

    /// Number of ancestors; the root has depth zero.
    pub fn depth(&self) -> usize {
        self.with_node(|arena, id| arena.nodes[id].depth)
            .unwrap_or_default()
    }

    pub fn has_seen_error(&self) -> bool {
        self.with_node(|arena, id| arena.nodes[id].has_seen_error)
            .unwrap_or_default()
    }

    pub fn is_detached(&self) -> bool {
        self.with_node(|arena, id| arena.nodes[id].is_detached)
            .unwrap_or_default()
    }

    /// Routes `error` into the tree starting at this monitor.
    pub fn send_error(&self, error: Error) {
        if let Some(core) = self.handle.core.upgrade() {
            core.send_error(self, error);
        }
    }

    /// Marks this monitor detached: errors reaching it stop here instead of
    /// propagating to its parent.
    pub fn detach(&self) {
        self.with_node(|arena, id| arena.nodes[id].is_detached = true);
    }

    /// Detaches this monitor and schedules `handler` once per error it
    /// receives, under the context current at this call.
    ///
    /// # Panics
    /// Panics if called outside of a scheduler context.
    pub fn detach_and_iter_errors(&self, handler: impl Fn(Error) + 'static) {
        let handler = Handler {
            context: ExecutionContext::current(),
            run: Rc::new(handler),
        };

        self.with_node(move |arena, id| {
            let node = &mut arena.nodes[id];
            node.is_detached = true;
            node.handlers.push(handler);
        });
    }

    pub(crate) fn add_handler(&self, context: ExecutionContext, run: ErrorHandler) {
        self.with_node(move |arena, id| {
            arena.nodes[id].handlers.push(Handler { context, run });
        });
    }
}

impl PartialEq for Monitor {
    fn eq(&self, other: &Self) -> bool {
        self.handle.id == other.handle.id && Weak::ptr_eq(&self.handle.core, &other.handle.core)
    }
}

impl Eq for Monitor {}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.handle.id)
            .finish_non_exhaustive()
    }
}

/// What a [`try_with`] does with errors raised after its result is
/// determined.
#[derive(Clone, Default)]
pub enum Rest {
    /// Forward them to the monitor that was current at the call.
    #[default]
    Raise,
    /// Drop them.
    Ignore,
    /// Hand them to a callback.
    Call(Rc<dyn Fn(Error)>),
}

impl Rest {
    pub fn call(handler: impl Fn(Error) + 'static) -> Self {
        Rest::Call(Rc::new(handler))
    }
}

impl fmt::Debug for Rest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rest::Raise => f.write_str("Raise"),
            Rest::Ignore => f.write_str("Ignore"),
            Rest::Call(_) => f.write_str("Call(..)"),
        }
    }
}

/// Options for [`try_with_opts`].
#[derive(Debug, Clone, Default)]
pub struct TryWith {
    name: Option<String>,
    rest: Rest,
}

impl TryWith {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the monitor created for the call.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn rest(mut self, rest: Rest) -> Self {
        self.rest = rest;
        self
    }
}

/// Runs `function` under a fresh child monitor and captures its first error.
///
/// See [`try_with_opts`].
pub fn try_with<T, F>(function: F) -> Deferred<Result<T, Error>>
where
    T: Clone + 'static,
    F: FnOnce() -> Deferred<T>,
{
    try_with_opts(TryWith::new(), function)
}

/// Runs `function` under a fresh child monitor.
///
/// The result is `Ok` with the value of `function`'s deferred, or `Err` with
/// the first error raised under the monitor, whichever comes first. Errors
/// raised after that are handled according to [`TryWith::rest`].
///
/// # Arguments
/// * `options` - The monitor name and the policy for later errors.
/// * `function` - The computation to run.
///
/// # Panics
/// Panics if called outside of a scheduler context.
pub fn try_with_opts<T, F>(options: TryWith, function: F) -> Deferred<Result<T, Error>>
where
    T: Clone + 'static,
    F: FnOnce() -> Deferred<T>,
{
    let parent_context = ExecutionContext::current();
    let parent = parent_context.monitor().clone();
    let name = options.name.unwrap_or_else(|| String::from("try_with"));
    let monitor = Monitor::create_with_parent(name, &parent);

    let result = Ivar::new();
    let on_error = result.clone();
    let rest = options.rest;

    monitor.add_handler(
        parent_context.clone(),
        Rc::new(move |error: Error| {
            if on_error.fill_if_empty(Err(error.clone())) {
                return;
            }

            match &rest {
                Rest::Raise => parent.send_error(error),
                Rest::Ignore => debug!(error = %error, "try_with dropped a later error"),
                Rest::Call(handler) => handler(error),
            }
        }),
    );

    let deferred = within_deferred(&parent_context.with_monitor(monitor), function);

    let on_value = result.clone();
    deferred.upon(move |value| {
        on_value.fill_if_empty(Ok(value));
    });

    result.read()
}

/// Runs `function` under a detached child monitor whose errors all go to
/// `handler`.
pub fn handle_errors<T, F, H>(function: F, handler: H) -> Deferred<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Deferred<T>,
    H: Fn(Error) + 'static,
{
    let context = ExecutionContext::current();
    let monitor = Monitor::create_with_parent("handle_errors", context.monitor());
    monitor.detach_and_iter_errors(handler);

    within_deferred(&context.with_monitor(monitor), function)
}

/// Runs `finally` after `function` completes or fails, then yields the
/// outcome of `function`, re-raising its error if it failed.
pub fn protect<T, F, G>(function: F, finally: G) -> Deferred<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Deferred<T>,
    G: FnOnce() -> Deferred<()> + 'static,
{
    try_with(function).bind(move |outcome| {
        finally().map(move |()| match outcome {
            Ok(value) => value,
            Err(error) => raise_error(error),
        })
    })
}

