//! The cycle scheduler.
//!
//! A [`Scheduler`] owns the job queue, the monitor tree, the timing wheel and
//! the external-event plumbing, and runs jobs in cycles. Each cycle:
//!
//! 1. moves alarms due at the current time from the wheel into the queue
//! 2. collects ready file descriptors, finished blocking work and task wakes
//! 3. runs up to `max_jobs_per_cycle` jobs, normal priority first
//!
//! Jobs run on the thread driving the scheduler, one at a time. A job that
//! panics has its error sent to the monitor of the context it ran under.

use crate::builder::{ClockMode, Config, SchedulerBuilder};
use crate::deferred::{Deferred, Ivar};
use crate::error::Error;
use crate::monitor::{Monitor, MonitorArena, Route};
use crate::reactor::core::{Interest, Reactor};
use crate::reactor::event::WakePipe;
use crate::runtime::context::{ExecutionContext, enter_context, try_current};
use crate::runtime::driver::{BlockingPool, Completion};
use crate::runtime::queue::{Job, JobQueue};
use crate::runtime::shutdown::{self, ShutdownState};
use crate::runtime::waker::{Inbound, Inbox};
use crate::task::{self, Task};
use crate::time::{Alarm, Time, TimingWheel, WheelError};

use slab::Slab;
use tracing::{debug, error, trace};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::mem;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Running,
    Stopped,
}

pub(crate) enum ClockSource {
    Wall { epoch: Instant },
    Manual { now: Time },
}

impl ClockSource {
    fn now(&self) -> Time {
        match self {
            ClockSource::Wall { epoch } => Time::from_duration(epoch.elapsed()),
            ClockSource::Manual { now } => *now,
        }
    }
}

pub(crate) struct Core {
    pub(crate) config: Config,
    state: Cell<SchedulerState>,
    queue: RefCell<JobQueue>,
    pub(crate) monitors: RefCell<MonitorArena>,
    current: RefCell<ExecutionContext>,
    clock: RefCell<ClockSource>,
    wheel: RefCell<TimingWheel<Job>>,
    reactor: RefCell<Reactor>,
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) pool: BlockingPool,
    pub(crate) completions: RefCell<Slab<Completion>>,
    pub(crate) tasks: RefCell<Slab<Rc<Task>>>,
    pub(crate) shutdown: RefCell<ShutdownState>,
    idle_waiters: RefCell<Vec<Ivar<()>>>,
    failure: RefCell<Option<Error>>,
    cycle_count: Cell<u64>,
    jobs_run: Cell<u64>,
}

impl Core {
    fn new(config: Config) -> Result<Rc<Self>, Error> {
        let wheel = TimingWheel::new(config.wheel.clone(), Time::ZERO)?;
        let wake = Arc::new(WakePipe::new()?);
        let inbox = Arc::new(Inbox::new(wake.clone()));
        let reactor = Reactor::new(wake);
        let pool = BlockingPool::new(config.max_worker_threads);

        let clock = match config.clock {
            ClockMode::Wall => ClockSource::Wall {
                epoch: Instant::now(),
            },
            ClockMode::Manual => ClockSource::Manual { now: Time::ZERO },
        };

        Ok(Rc::new_cyclic(|weak| {
            let mut monitors = MonitorArena::new();
            let root = monitors.insert(String::from("main"), None);
            let root = Monitor::from_counted(weak.clone(), root);

            Core {
                config,
                state: Cell::new(SchedulerState::NotStarted),
                queue: RefCell::new(JobQueue::new()),
                monitors: RefCell::new(monitors),
                current: RefCell::new(ExecutionContext::root(root)),
                clock: RefCell::new(clock),
                wheel: RefCell::new(wheel),
                reactor: RefCell::new(reactor),
                inbox,
                pool,
                completions: RefCell::new(Slab::new()),
                tasks: RefCell::new(Slab::new()),
                shutdown: RefCell::new(ShutdownState::default()),
                idle_waiters: RefCell::new(Vec::new()),
                failure: RefCell::new(None),
                cycle_count: Cell::new(0),
                jobs_run: Cell::new(0),
            }
        }))
    }

    pub(crate) fn current_context(&self) -> ExecutionContext {
        self.current.borrow().clone()
    }

    /// Runs `function` with `context` as the current execution context.
    pub(crate) fn with_context<R>(&self, context: ExecutionContext, function: impl FnOnce() -> R) -> R {
        let previous = self.current.replace(context);
        let result = function();
        let replaced = self.current.replace(previous);
        drop(replaced);
        result
    }

    pub(crate) fn enqueue(&self, job: Job) {
        self.queue.borrow_mut().push(job);
    }

    pub(crate) fn state(&self) -> SchedulerState {
        self.state.get()
    }

    pub(crate) fn now(&self) -> Time {
        self.clock.borrow().now()
    }

    /// Schedules `job` at `at` on the wheel, or enqueues it right away if
    /// `at` is not after the wheel's current time.
    pub(crate) fn schedule_at(&self, at: Time, job: Job) -> Result<Option<Alarm>, WheelError> {
        let wheel_now = self.wheel.borrow().now();
        if at < wheel_now {
            self.enqueue(job);
            return Ok(None);
        }

        let alarm = self.wheel.borrow_mut().add(at, job)?;
        Ok(Some(alarm))
    }

    pub(crate) fn remove_alarm(&self, alarm: &Alarm) -> bool {
        let removed = self.wheel.borrow_mut().remove(alarm);
        removed.is_some()
    }

    pub(crate) fn next_alarm_fires_at(&self) -> Option<Time> {
        self.wheel.borrow().next_alarm_fires_at()
    }

    /// Moves every alarm at or before the current time into the queue.
    pub(crate) fn fire_alarms(&self) {
        let now = self.now();
        let mut fired = Vec::new();

        {
            let mut wheel = self.wheel.borrow_mut();
            wheel.advance_clock(now, |_, job| fired.push(job));
            wheel.fire_past_alarms(|_, job| fired.push(job));
        }

        if !fired.is_empty() {
            trace!(count = fired.len(), %now, "alarms fired");
        }

        let mut queue = self.queue.borrow_mut();
        for job in fired {
            queue.push(job);
        }
    }

    /// Routes `error` from `monitor` up the tree.
    pub(crate) fn send_error(self: &Rc<Self>, monitor: &Monitor, error: Error) {
        let route = self.monitors.borrow_mut().route(monitor.id());

        match route {
            Route::Handle {
                handlers,
                escalate_to,
            } => {
                let escalate = escalate_to.map(|id| Monitor::from_counted(Rc::downgrade(self), id));

                for (context, handler) in handlers {
                    let error = error.clone();
                    let escalate = escalate.clone();
                    let core = Rc::downgrade(self);

                    self.enqueue(Job::new(context, move || {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(error)));
                        let (Err(payload), Some(core)) = (outcome, core.upgrade()) else {
                            return;
                        };

                        let failure = Error::from_panic(payload);
                        match escalate {
                            Some(parent) => core.send_error(&parent, failure),
                            None => core.fail(String::from("main"), failure),
                        }
                    }));
                }
            }
            Route::Ignore { monitor } => {
                debug!(monitor = %monitor, error = %error, "error dropped by detached monitor");
            }
            Route::Unhandled { monitor } => self.fail(monitor, error),
        }
    }

    /// Stops the scheduler because `error` reached the root monitor.
    fn fail(&self, monitor: String, error: Error) {
        error!(monitor = %monitor, error = %error, "unhandled error, stopping scheduler");

        {
            let mut failure = self.failure.borrow_mut();
            if failure.is_none() {
                *failure = Some(Error::Unhandled {
                    monitor,
                    source: Box::new(error),
                });
            }
        }

        self.state.set(SchedulerState::Stopped);
        let dropped = self.queue.borrow_mut().drain();
        drop(dropped);
    }

    pub(crate) fn stop(&self) {
        if self.state.get() != SchedulerState::Stopped {
            debug!(cycles = self.cycle_count.get(), "scheduler stopped");
            self.state.set(SchedulerState::Stopped);
        }
    }

    fn check_failure(&self) -> Result<(), Error> {
        match &*self.failure.borrow() {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    fn start(&self) -> Result<(), Error> {
        self.check_failure()?;

        match self.state.get() {
            SchedulerState::NotStarted => {
                debug!(
                    max_jobs_per_cycle = self.config.max_jobs_per_cycle,
                    "scheduler started"
                );
                self.state.set(SchedulerState::Running);
                Ok(())
            }
            SchedulerState::Running => Ok(()),
            SchedulerState::Stopped => Err(Error::Stopped),
        }
    }

    fn run_job(self: &Rc<Self>, job: Job) {
        let Job { context, run } = job;
        let monitor = context.monitor().clone();

        let result = self.with_context(context, || panic::catch_unwind(AssertUnwindSafe(run)));
        self.jobs_run.set(self.jobs_run.get() + 1);

        if let Err(payload) = result {
            self.send_error(&monitor, Error::from_panic(payload));
        }
    }

    pub(crate) fn run_cycle(self: &Rc<Self>) -> Result<(), Error> {
        self.start()?;
        self.cycle_count.set(self.cycle_count.get() + 1);

        self.fire_alarms();
        self.poll_external(Some(Duration::ZERO))?;

        let mut ran = 0;
        while ran < self.config.max_jobs_per_cycle && self.state.get() == SchedulerState::Running {
            let job = self.queue.borrow_mut().pop();
            let Some(job) = job else {
                break;
            };

            self.run_job(job);
            ran += 1;
        }

        if self.queue.borrow().is_empty() {
            let waiters = mem::take(&mut *self.idle_waiters.borrow_mut());
            for waiter in waiters {
                waiter.fill_if_empty(());
            }
        }

        trace!(
            cycle = self.cycle_count.get(),
            jobs = ran,
            pending = self.queue.borrow().len(),
            "cycle finished"
        );

        self.check_failure()
    }

    /// Runs cycles until `done` yields a value, blocking for external events
    /// between cycles when nothing is runnable.
    pub(crate) fn run_until<T>(self: &Rc<Self>, mut done: impl FnMut() -> Option<T>) -> Result<T, Error> {
        loop {
            if let Some(value) = done() {
                return Ok(value);
            }

            self.run_cycle()?;

            if let Some(value) = done() {
                return Ok(value);
            }

            if self.queue.borrow().is_empty() {
                self.wait_for_work()?;
            }
        }
    }

    /// Runs cycles until no job is ready and no alarm is due, without
    /// blocking.
    fn run_until_idle(self: &Rc<Self>) -> Result<(), Error> {
        loop {
            self.run_cycle()?;
            self.fire_alarms();

            if self.queue.borrow().is_empty() && self.idle_waiters.borrow().is_empty() {
                return Ok(());
            }
        }
    }

    fn wait_for_work(self: &Rc<Self>) -> Result<(), Error> {
        self.poll_external(Some(Duration::ZERO))?;
        self.fire_alarms();

        if !self.queue.borrow().is_empty() || !self.idle_waiters.borrow().is_empty() {
            return Ok(());
        }

        let timeout = match (&*self.clock.borrow(), self.next_alarm_fires_at()) {
            (ClockSource::Wall { epoch }, Some(at)) => {
                Some(at.saturating_duration_since(Time::from_duration(epoch.elapsed())))
            }
            _ => None,
        };

        let external = self.reactor.borrow().has_interest() || !self.completions.borrow().is_empty();
        if timeout.is_none() && !external {
            debug!(pending_tasks = self.tasks.borrow().len(), "scheduler stalled");
            return Err(Error::Stalled);
        }

        trace!(?timeout, "waiting for external events");
        self.poll_external(timeout)?;
        self.fire_alarms();

        Ok(())
    }

    /// Collects readiness, blocking-work results and task wakes.
    fn poll_external(self: &Rc<Self>, timeout: Option<Duration>) -> Result<(), Error> {
        let ready = if timeout == Some(Duration::ZERO) && !self.reactor.borrow().has_interest() {
            Vec::new()
        } else {
            self.reactor.borrow_mut().poll(timeout)?
        };

        for ivar in ready {
            ivar.fill_if_empty(());
        }

        for inbound in self.inbox.take() {
            match inbound {
                Inbound::Wake(key) => task::schedule(self, key),
                Inbound::Completion { token, result } => {
                    let completion = self.completions.borrow_mut().try_remove(token);
                    if let Some(completion) = completion {
                        completion.deliver(self, result);
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) fn register_interest(&self, fd: RawFd, interest: Interest) -> Deferred<()> {
        self.reactor.borrow_mut().register(fd, interest)
    }

    pub(crate) fn add_idle_waiter(&self, waiter: Ivar<()>) {
        self.idle_waiters.borrow_mut().push(waiter);
    }

    fn advance_to(&self, time: Time) -> Result<(), Error> {
        {
            let mut clock = self.clock.borrow_mut();
            let ClockSource::Manual { now } = &mut *clock else {
                return Err(Error::WallClock);
            };

            if time > *now {
                *now = time;
            }
        }

        self.fire_alarms();
        Ok(())
    }
}

/// Handle to a single-threaded cycle scheduler.
///
/// Cloning a scheduler is cheap and shares the same state. All jobs run on
/// the thread that calls one of the run methods.
///
/// # Example
/// ```ignore
/// let sched = Scheduler::new();
/// let value = sched.block_on(|| Deferred::value(42))?;
/// assert_eq!(value, 42);
/// ```
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<Core>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler with the default configuration.
    ///
    /// # Panics
    /// Panics if the wake pipe cannot be created. Use
    /// [`SchedulerBuilder::build`] to handle that error.
    pub fn new() -> Self {
        Self::from_config(Config::default()).expect("failed to create scheduler")
    }

    /// Returns a builder for a scheduler with custom settings.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) fn from_config(config: Config) -> Result<Self, Error> {
        Ok(Self {
            core: Core::new(config)?,
        })
    }

    /// Returns the scheduler entered on this thread, if any.
    pub fn current() -> Option<Self> {
        try_current().map(|core| Self { core })
    }

    /// Makes this scheduler current on this thread while `function` runs.
    ///
    /// Code inside may create deferreds, register callbacks and schedule
    /// alarms; the resulting jobs run on the next cycle.
    pub fn enter<R>(&self, function: impl FnOnce() -> R) -> R {
        enter_context(&self.core, function)
    }

    /// Runs one cycle.
    ///
    /// # Returns
    /// `Err(Error::Unhandled)` if an error reached the root monitor, or
    /// `Err(Error::Stopped)` if the scheduler was already stopped.
    pub fn run_cycle(&self) -> Result<(), Error> {
        self.enter(|| self.core.run_cycle())
    }

    /// Runs cycles until nothing is ready to run and no alarm is due.
    pub fn run_until_idle(&self) -> Result<(), Error> {
        self.enter(|| self.core.run_until_idle())
    }

    /// Runs cycles until `deferred` is determined and returns its value.
    ///
    /// # Returns
    /// `Err(Error::Stalled)` if the deferred can no longer be determined
    /// because nothing is runnable or pending.
    pub fn run_until_determined<T: Clone + 'static>(&self, deferred: &Deferred<T>) -> Result<T, Error> {
        self.enter(|| self.core.run_until(|| deferred.peek()))
    }

    /// Calls `function` inside the scheduler and runs until its deferred is
    /// determined.
    pub fn block_on<T, F>(&self, function: F) -> Result<T, Error>
    where
        T: Clone + 'static,
        F: FnOnce() -> Deferred<T>,
    {
        let deferred = self.enter(function);
        self.run_until_determined(&deferred)
    }

    /// Runs until [`shutdown`](shutdown::shutdown) completes
    /// and returns the requested status.
    pub fn run_until_stopped(&self) -> Result<i32, Error> {
        self.enter(|| {
            self.core.run_until(|| {
                if self.core.failure.borrow().is_some() {
                    return None;
                }

                (self.core.state() == SchedulerState::Stopped)
                    .then(|| self.core.shutdown.borrow().status.unwrap_or(0))
            })
        })
    }

    /// Runs the scheduler forever and exits the process with the shutdown
    /// status once it stops.
    pub fn go(self) -> ! {
        let status = match self.run_until_stopped() {
            Ok(status) => status,
            Err(err) => {
                error!(error = %err, "scheduler failed");
                1
            }
        };

        std::process::exit(status)
    }

    /// Spawns a future as a task. See [`crate::spawn`].
    pub fn spawn<F>(&self, future: F) -> Deferred<F::Output>
    where
        F: Future + 'static,
        F::Output: Clone + 'static,
    {
        self.enter(|| task::spawn(future))
    }

    /// Current time of the scheduler's clock.
    pub fn now(&self) -> Time {
        self.core.now()
    }

    /// Moves a manual clock forward to `time` and queues the alarms due by
    /// then.
    ///
    /// Time never moves backwards; an earlier `time` only fires alarms
    /// already due.
    ///
    /// # Returns
    /// `Err(Error::WallClock)` if the scheduler reads the wall clock.
    pub fn advance_to(&self, time: Time) -> Result<(), Error> {
        self.enter(|| self.core.advance_to(time))
    }

    /// Moves a manual clock forward by `span`. See [`advance_to`](Self::advance_to).
    ///
    /// # Arguments
    /// * `span` - Time to add to the clock's current reading.
    ///
    /// # Returns
    /// `Err(Error::WallClock)` if the scheduler reads the wall clock.
    pub fn advance_by(&self, span: Duration) -> Result<(), Error> {
        self.advance_to(self.now() + span)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        self.core.state()
    }

    /// Returns `true` between the first cycle and the stop.
    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Number of cycles started since creation.
    pub fn cycle_count(&self) -> u64 {
        self.core.cycle_count.get()
    }

    /// Jobs queued and not yet run, both priorities included.
    pub fn num_pending_jobs(&self) -> usize {
        self.core.queue.borrow().len()
    }

    /// Jobs run since creation, failed ones included.
    pub fn num_jobs_run(&self) -> u64 {
        self.core.jobs_run.get()
    }

    /// Number of monitors currently alive, the root included.
    pub fn num_live_monitors(&self) -> usize {
        self.core.monitors.borrow().len()
    }

    /// Requests shutdown with `status`. See [`shutdown::shutdown`].
    pub fn shutdown(&self, status: i32) {
        self.enter(|| shutdown::shutdown(status))
    }

    /// Status passed to the first shutdown request, if any.
    pub fn shutdown_status(&self) -> Option<i32> {
        self.core.shutdown.borrow().status
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.core.state())
            .field("cycle_count", &self.core.cycle_count.get())
            .field("pending_jobs", &self.core.queue.borrow().len())
            .finish()
    }
}
