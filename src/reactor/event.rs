use libc::{F_GETFL, F_SETFL, O_NONBLOCK, fcntl};

use std::io;
use std::os::unix::io::RawFd;

/// Self-pipe used to interrupt a blocking `poll` from other threads.
///
/// Both ends are non-blocking: a full pipe already guarantees a pending
/// wake-up, so a failed write is ignored.
#[derive(Debug)]
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_nonblocking(pipe.read_fd)?;
        set_nonblocking(pipe.write_fd)?;

        Ok(pipe)
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn notify(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    /// Empties the pipe so the next `poll` blocks again.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking(file_descriptor: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(file_descriptor, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(file_descriptor, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable_now(fd: RawFd) -> bool {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pollfd, 1, 0) == 1 }
    }

    #[test]
    fn test_notify_then_drain() {
        let pipe = WakePipe::new().unwrap();
        assert!(!readable_now(pipe.read_fd()));

        pipe.notify();
        pipe.notify();
        assert!(readable_now(pipe.read_fd()), "notify should make the pipe readable");

        pipe.drain();
        assert!(!readable_now(pipe.read_fd()), "drain should empty the pipe");
    }
}
