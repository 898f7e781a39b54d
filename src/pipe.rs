//! In-process FIFO channels with pushback.
//!
//! A pipe has a [`Writer`] and a [`Reader`] end sharing one buffer. Writes
//! never block: [`Writer::write`] appends the value and returns the pipe's
//! *pushback*, a deferred determined once the buffer is back within its size
//! budget. Producers that wait on pushback before writing again keep the
//! buffer bounded.
//!
//! Readers waiting on an empty pipe are served in the order they called
//! [`Reader::read`]. Closing the pipe wakes every waiting reader with
//! [`Read::Eof`] once the buffer is drained.
//!
//! # Example
//!
//! ```ignore
//! use deferred_kernel::pipe;
//!
//! let (reader, writer) = pipe::create();
//! writer.write(1);
//! writer.close();
//! let values = reader.to_vec(); // determined with vec![1]
//! ```

use crate::deferred::{Deferred, Ivar};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::Rc;

/// Result of [`Reader::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Read<T> {
    Ok(T),
    Eof,
}

/// Result of [`Reader::read_now`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadNow<T> {
    Ok(T),
    Eof,
    NothingAvailable,
}

/// Result of [`Reader::values_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Available {
    Ok,
    Eof,
}

struct Shared<T> {
    buffer: VecDeque<T>,
    size_budget: usize,
    closed: bool,
    blocked_reads: VecDeque<Ivar<Read<T>>>,
    pushback: Option<Ivar<()>>,
    available: Vec<Ivar<Available>>,
    closed_signal: Ivar<()>,
}

impl<T: Clone + 'static> Shared<T> {
    // Pushback ivar to fill, if the buffer is within budget again.
    fn take_released_pushback(&mut self) -> Option<Ivar<()>> {
        if self.buffer.len() <= self.size_budget {
            self.pushback.take()
        } else {
            None
        }
    }
}

/// Creates a pipe whose pushback is determined only when the buffer is
/// empty.
pub fn create<T: Clone + 'static>() -> (Reader<T>, Writer<T>) {
    with_size_budget(0)
}

/// Creates a pipe whose pushback is determined while at most `size_budget`
/// values are buffered.
pub fn with_size_budget<T: Clone + 'static>(size_budget: usize) -> (Reader<T>, Writer<T>) {
    let shared = Rc::new(RefCell::new(Shared {
        buffer: VecDeque::new(),
        size_budget,
        closed: false,
        blocked_reads: VecDeque::new(),
        pushback: None,
        available: Vec::new(),
        closed_signal: Ivar::new(),
    }));

    (
        Reader {
            shared: shared.clone(),
        },
        Writer { shared },
    )
}

/// A closed pipe holding `values`.
pub fn of_list<T: Clone + 'static>(values: impl IntoIterator<Item = T>) -> Reader<T> {
    let (reader, writer) = create();
    for value in values {
        writer.write_without_pushback(value);
    }
    writer.close();

    reader
}

/// Write end of a pipe.
pub struct Writer<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Clone for Writer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + 'static> Writer<T> {
    /// Writes `value` and returns the pipe's pushback.
    ///
    /// # Panics
    /// Panics if the pipe is closed.
    pub fn write(&self, value: T) -> Deferred<()> {
        self.write_without_pushback(value);
        self.pushback()
    }

    /// Writes `value`, handing it straight to the oldest blocked reader if
    /// there is one.
    ///
    /// # Panics
    /// Panics if the pipe is closed.
    pub fn write_without_pushback(&self, value: T) {
        let (reader, available) = {
            let mut shared = self.shared.borrow_mut();
            assert!(!shared.closed, "write to a closed pipe");

            match shared.blocked_reads.pop_front() {
                Some(reader) => (Some((reader, value)), Vec::new()),
                None => {
                    shared.buffer.push_back(value);
                    (None, mem::take(&mut shared.available))
                }
            }
        };

        if let Some((reader, value)) = reader {
            reader.fill(Read::Ok(value));
        }

        for waiter in available {
            waiter.fill(Available::Ok);
        }
    }

    /// Determined once the buffer is within the size budget or the pipe is
    /// closed.
    pub fn pushback(&self) -> Deferred<()> {
        let mut shared = self.shared.borrow_mut();

        if shared.closed || shared.buffer.len() <= shared.size_budget {
            return Deferred::unit();
        }

        shared.pushback.get_or_insert_with(Ivar::new).read()
    }

    /// Closes the pipe. Buffered values can still be read; waiting readers
    /// get [`Read::Eof`]. Closing twice is a no-op.
    pub fn close(&self) {
        close(&self.shared);
    }

    /// Returns `true` once either end closed the pipe.
    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }
}

/// Read end of a pipe.
pub struct Reader<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + 'static> Reader<T> {
    /// Determined with the next value, or [`Read::Eof`] once the pipe is
    /// closed and drained.
    pub fn read(&self) -> Deferred<Read<T>> {
        let (value, pushback) = {
            let mut shared = self.shared.borrow_mut();

            match shared.buffer.pop_front() {
                Some(value) => (value, shared.take_released_pushback()),
                None if shared.closed => return Deferred::value(Read::Eof),
                None => {
                    let reader = Ivar::new();
                    let out = reader.read();
                    shared.blocked_reads.push_back(reader);
                    return out;
                }
            }
        };

        if let Some(pushback) = pushback {
            pushback.fill(());
        }

        Deferred::value(Read::Ok(value))
    }

    /// Takes the next value without waiting.
    pub fn read_now(&self) -> ReadNow<T> {
        let (value, pushback) = {
            let mut shared = self.shared.borrow_mut();

            match shared.buffer.pop_front() {
                Some(value) => (value, shared.take_released_pushback()),
                None if shared.closed => return ReadNow::Eof,
                None => return ReadNow::NothingAvailable,
            }
        };

        if let Some(pushback) = pushback {
            pushback.fill(());
        }

        ReadNow::Ok(value)
    }

    /// Determined once a value is buffered or the pipe is closed, without
    /// consuming anything.
    pub fn values_available(&self) -> Deferred<Available> {
        let mut shared = self.shared.borrow_mut();

        if !shared.buffer.is_empty() {
            return Deferred::value(Available::Ok);
        }

        if shared.closed {
            return Deferred::value(Available::Eof);
        }

        let waiter = Ivar::new();
        let out = waiter.read();
        shared.available.push(waiter);
        out
    }

    /// Determined when the pipe is closed.
    pub fn closed(&self) -> Deferred<()> {
        self.shared.borrow().closed_signal.read()
    }

    /// Returns `true` once either end closed the pipe.
    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.shared.borrow().buffer.len()
    }

    /// Returns `true` if no value is buffered.
    pub fn is_empty(&self) -> bool {
        self.shared.borrow().buffer.is_empty()
    }

    /// Closes the pipe and discards every buffered value.
    pub fn close_read(&self) {
        let discarded = mem::take(&mut self.shared.borrow_mut().buffer);
        drop(discarded);
        close(&self.shared);
    }

    /// Calls `function` on each value in order, waiting for the deferred it
    /// returns before reading the next one. Determined at end of file.
    pub fn iter(&self, function: impl FnMut(T) -> Deferred<()> + 'static) -> Deferred<()> {
        let done = Ivar::new();
        let out = done.read();

        Rc::new(Iter {
            reader: self.clone(),
            function: RefCell::new(Box::new(function)),
            done,
        })
        .next();

        out
    }

    /// Collects every remaining value until end of file.
    pub fn to_vec(&self) -> Deferred<Vec<T>> {
        let values = Rc::new(RefCell::new(Vec::new()));
        let collected = values.clone();

        self.iter(move |value| {
            values.borrow_mut().push(value);
            Deferred::unit()
        })
        .map(move |()| mem::take(&mut *collected.borrow_mut()))
    }
}

struct Iter<T> {
    reader: Reader<T>,
    function: RefCell<Box<dyn FnMut(T) -> Deferred<()>>>,
    done: Ivar<()>,
}

impl<T: Clone + 'static> Iter<T> {
    fn next(self: Rc<Self>) {
        self.reader.read().upon(move |read| match read {
            Read::Eof => self.done.fill(()),
            Read::Ok(value) => {
                let step = (&mut *self.function.borrow_mut())(value);
                step.upon(move |()| self.next());
            }
        });
    }
}

fn close<T: Clone + 'static>(shared: &Rc<RefCell<Shared<T>>>) {
    let (readers, available, pushback, closed_signal) = {
        let mut shared = shared.borrow_mut();
        if shared.closed {
            return;
        }

        shared.closed = true;
        (
            mem::take(&mut shared.blocked_reads),
            mem::take(&mut shared.available),
            shared.pushback.take(),
            shared.closed_signal.clone(),
        )
    };

    for reader in readers {
        reader.fill(Read::Eof);
    }

    for waiter in available {
        waiter.fill(Available::Eof);
    }

    if let Some(pushback) = pushback {
        pushback.fill(());
    }

    closed_signal.fill(());
}

impl<T> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Reader")
            .field("len", &shared.buffer.len())
            .field("closed", &shared.closed)
            .finish()
    }
}

impl<T> fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Writer")
            .field("len", &shared.buffer.len())
            .field("closed", &shared.closed)
            .finish()
    }
}
