//! Cancellable fd wait used by the completion dispatchers.
//!
//! A pipe is multiplexed with the provider fd; `cancel` writes to the pipe,
//! which wakes every current and future wait. The pipe is never drained, so
//! cancellation is permanent for the session's lifetime.

use crate::error::{Error, Result};

pub(crate) struct FdPoller {
    pipe_fds: [libc::c_int; 2],
}

impl FdPoller {
    pub fn new() -> Result<Self> {
        let mut fds = [-1 as libc::c_int; 2];
        // SAFETY: FFI; fds points at two writable ints.
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret == -1 {
            return Err(Error::from_os(last_errno()));
        }
        Ok(FdPoller { pipe_fds: fds })
    }

    /// Wait for readability on `fd` or cancellation. Returns true if `fd`
    /// became readable, false on cancellation (or timeout).
    pub fn poll_on_fd(&self, fd: libc::c_int, timeout_ms: i32) -> Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.pipe_fds[0],
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: FFI; fds is a valid pollfd array.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout_ms) };
        if ret == -1 {
            return Err(Error::from_os(last_errno()));
        }
        Ok(fds[0].revents != 0)
    }

    /// Wake every waiter, now and forever.
    pub fn cancel(&self) {
        // SAFETY: FFI; best effort, a full pipe already means "cancelled".
        unsafe {
            let _ = libc::write(self.pipe_fds[1], b" ".as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for FdPoller {
    fn drop(&mut self) {
        for fd in self.pipe_fds {
            if fd != -1 {
                // SAFETY: fd owned by this poller.
                unsafe { libc::close(fd) };
            }
        }
    }
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
