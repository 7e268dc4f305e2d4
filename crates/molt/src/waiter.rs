//! Readiness waiting for the worker loop and the master's sleep.
//!
//! epoll-backed where available, with a `poll(2)` fallback. The fd set is
//! re-registered wholesale when it changes; both workers (listeners plus
//! control channel) and the master (self-pipe) wait on a handful of fds,
//! so registration churn is not a concern.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

enum Backend {
    Epoll { epfd: OwnedFd, registered: Vec<RawFd> },
    Poll,
}

/// Waits for readability on a set of fds with a timeout.
pub struct Waiter {
    backend: Backend,
}

impl Waiter {
    /// Create a waiter, preferring epoll.
    #[must_use]
    pub fn new() -> Self {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        let backend = if epfd >= 0 {
            Backend::Epoll {
                epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
                registered: Vec::new(),
            }
        } else {
            Backend::Poll
        };
        Self { backend }
    }

    /// Wait up to `timeout` for any of `fds` to become readable.
    ///
    /// Returns the ready fds; empty on timeout or signal interruption.
    pub fn wait(&mut self, fds: &[RawFd], timeout: Duration) -> io::Result<Vec<RawFd>> {
        match &mut self.backend {
            Backend::Epoll { epfd, registered } => {
                if registered != fds {
                    reregister(epfd.as_raw_fd(), registered, fds)?;
                }
                epoll_wait(epfd.as_raw_fd(), fds.len().max(1), timeout)
            }
            Backend::Poll => poll_wait(fds, timeout),
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backend {
            Backend::Epoll { registered, .. } => {
                write!(f, "Waiter::Epoll({} fds)", registered.len())
            }
            Backend::Poll => write!(f, "Waiter::Poll"),
        }
    }
}

fn reregister(epfd: RawFd, registered: &mut Vec<RawFd>, fds: &[RawFd]) -> io::Result<()> {
    for &fd in registered.iter() {
        unsafe {
            libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }
    registered.clear();
    for &fd in fds {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } != 0 {
            return Err(io::Error::last_os_error());
        }
        registered.push(fd);
    }
    Ok(())
}

fn epoll_wait(epfd: RawFd, capacity: usize, timeout: Duration) -> io::Result<Vec<RawFd>> {
    let mut events: Vec<libc::epoll_event> =
        vec![libc::epoll_event { events: 0, u64: 0 }; capacity];
    let timeout_ms = timeout_millis(timeout);
    let n = unsafe {
        libc::epoll_wait(
            epfd,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            timeout_ms,
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }
    Ok(events[..n as usize].iter().map(|e| e.u64 as RawFd).collect())
}

fn poll_wait(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<RawFd>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let n = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_millis(timeout),
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }
    Ok(pollfds
        .iter()
        .filter(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|p| p.fd)
        .collect())
}

fn timeout_millis(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(i32::MAX as u128) as libc::c_int
}
