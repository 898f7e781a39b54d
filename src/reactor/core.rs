//! Readiness polling for file descriptors.
//!
//! The reactor keeps one-shot interests: each registration is a file
//! descriptor, a direction and the ivar to fill once the descriptor is ready.
//! [`Reactor::poll`] waits with `poll(2)` on every registered descriptor plus
//! the wake pipe, removes the interests that became ready and hands their
//! ivars back to the scheduler.

use crate::deferred::{Deferred, Ivar};
use crate::reactor::event::WakePipe;

use tracing::trace;

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Direction of readiness to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        }
    }
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    ready: Ivar<()>,
}

pub(crate) struct Reactor {
    registrations: Vec<Registration>,
    wake: Arc<WakePipe>,
}

impl Reactor {
    pub(crate) fn new(wake: Arc<WakePipe>) -> Self {
        Self {
            registrations: Vec::new(),
            wake,
        }
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest) -> Deferred<()> {
        let ready = Ivar::new();
        let out = ready.read();

        trace!(fd, ?interest, "interest registered");
        self.registrations.push(Registration {
            fd,
            interest,
            ready,
        });

        out
    }

    pub(crate) fn has_interest(&self) -> bool {
        !self.registrations.is_empty()
    }

    /// Waits up to `timeout` (forever for `None`) for a registered descriptor
    /// to become ready or for the wake pipe to be notified.
    ///
    /// # Returns
    /// The ivars of the interests that became ready. Errors and hang-ups count
    /// as ready so that the following read or write reports them.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ivar<()>>> {
        let mut fds = Vec::with_capacity(self.registrations.len() + 1);
        fds.push(libc::pollfd {
            fd: self.wake.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.extend(self.registrations.iter().map(|registration| libc::pollfd {
            fd: registration.fd,
            events: registration.interest.events(),
            revents: 0,
        }));

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_millis(timeout)) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        if fds[0].revents != 0 {
            self.wake.drain();
        }

        let mut ready = Vec::new();
        let registrations = mem::take(&mut self.registrations);

        for (registration, pollfd) in registrations.into_iter().zip(&fds[1..]) {
            if pollfd.revents != 0 {
                trace!(fd = registration.fd, interest = ?registration.interest, "descriptor ready");
                ready.push(registration.ready);
            } else {
                self.registrations.push(registration);
            }
        }

        Ok(ready)
    }
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
