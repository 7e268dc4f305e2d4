//! Signal plumbing: the master's self-pipe and the workers' flag handlers.
//!
//! Signal handlers do exactly two async-signal-safe things: push the signal
//! number into a fixed-size queue of atomics and write one byte to a
//! non-blocking pipe. The master's control loop sleeps on the pipe's read
//! end, drains it on wakeup, and handles one queued token per iteration,
//! in FIFO order. When the queue is saturated the token is dropped; the
//! pipe byte still wakes the loop.
//!
//! Workers do not queue: their handlers set flags checked at the top of
//! the accept loop, and TERM/INT terminate on the spot.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

/// Signals the master reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful shutdown.
    Quit,
    /// Immediate shutdown.
    Term,
    /// Immediate shutdown (interactive).
    Int,
    /// Log rotation, propagated to workers.
    Usr1,
    /// Manual refork trigger.
    Usr2,
    /// Increment the worker count.
    Ttin,
    /// Decrement the worker count.
    Ttou,
    /// Child exited; reap on the next iteration.
    Chld,
}

impl Signal {
    /// All master-handled signals.
    pub const ALL: [Signal; 8] = [
        Self::Quit,
        Self::Term,
        Self::Int,
        Self::Usr1,
        Self::Usr2,
        Self::Ttin,
        Self::Ttou,
        Self::Chld,
    ];

    #[must_use]
    fn from_raw(sig: libc::c_int) -> Option<Self> {
        match sig {
            libc::SIGQUIT => Some(Self::Quit),
            libc::SIGTERM => Some(Self::Term),
            libc::SIGINT => Some(Self::Int),
            libc::SIGUSR1 => Some(Self::Usr1),
            libc::SIGUSR2 => Some(Self::Usr2),
            libc::SIGTTIN => Some(Self::Ttin),
            libc::SIGTTOU => Some(Self::Ttou),
            libc::SIGCHLD => Some(Self::Chld),
            _ => None,
        }
    }

    /// The raw signal number.
    #[must_use]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Self::Quit => libc::SIGQUIT,
            Self::Term => libc::SIGTERM,
            Self::Int => libc::SIGINT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
            Self::Ttin => libc::SIGTTIN,
            Self::Ttou => libc::SIGTTOU,
            Self::Chld => libc::SIGCHLD,
        }
    }
}

const QUEUE_CAP: usize = 32;

#[allow(clippy::declare_interior_mutable_const)]
const QUEUE_SLOT: AtomicI32 = AtomicI32::new(0);
static QUEUE: [AtomicI32; QUEUE_CAP] = [QUEUE_SLOT; QUEUE_CAP];
static QUEUE_HEAD: AtomicUsize = AtomicUsize::new(0);
static QUEUE_TAIL: AtomicUsize = AtomicUsize::new(0);
static PIPE_W: AtomicI32 = AtomicI32::new(-1);

// Handlers are serialized by sa_mask blocking every other handled signal,
// so the queue is single-producer; the master loop is the single consumer.
extern "C" fn master_handler(sig: libc::c_int) {
    let head = QUEUE_HEAD.load(Ordering::Relaxed);
    let tail = QUEUE_TAIL.load(Ordering::Acquire);
    if head.wrapping_sub(tail) < QUEUE_CAP {
        QUEUE[head % QUEUE_CAP].store(sig, Ordering::Relaxed);
        QUEUE_HEAD.store(head.wrapping_add(1), Ordering::Release);
    }
    let fd = PIPE_W.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [b'.'].as_ptr().cast(), 1);
        }
    }
}

/// The master's self-pipe plus signal queue.
#[derive(Debug)]
pub struct SelfPipe {
    read_end: OwnedFd,
}

impl SelfPipe {
    /// Create the pipe and install handlers for every master signal.
    pub fn install() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        PIPE_W.store(fds[1], Ordering::SeqCst);

        for signal in Signal::ALL {
            install_handler(signal.as_raw(), master_handler as usize)?;
        }
        ignore_sigpipe()?;

        Ok(Self {
            read_end: unsafe { OwnedFd::from_raw_fd(fds[0]) },
        })
    }

    /// Empty the pipe after a wakeup.
    pub fn drain_pipe(&self) {
        let mut sink = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_end.as_raw_fd(),
                    sink.as_mut_ptr().cast(),
                    sink.len(),
                )
            };
            if n <= 0 {
                return;
            }
        }
    }

    /// Pop the oldest queued signal token, if any.
    #[must_use]
    pub fn pop_token(&self) -> Option<Signal> {
        let tail = QUEUE_TAIL.load(Ordering::Relaxed);
        let head = QUEUE_HEAD.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let raw = QUEUE[tail % QUEUE_CAP].load(Ordering::Relaxed);
        QUEUE_TAIL.store(tail.wrapping_add(1), Ordering::Release);
        Signal::from_raw(raw)
    }
}

impl AsRawFd for SelfPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }
}

static WORKER_QUIT: AtomicBool = AtomicBool::new(false);
static WORKER_REOPEN: AtomicBool = AtomicBool::new(false);

extern "C" fn worker_handler(sig: libc::c_int) {
    match sig {
        libc::SIGQUIT => WORKER_QUIT.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => WORKER_REOPEN.store(true, Ordering::SeqCst),
        // Immediate shutdown: nothing to drain, nothing to flush.
        libc::SIGTERM | libc::SIGINT => unsafe { libc::_exit(0) },
        _ => {}
    }
}

/// Worker-side signal state. Installed after fork, replacing the master's
/// handlers inherited across it.
#[derive(Debug)]
pub struct WorkerSignals;

impl WorkerSignals {
    /// Reset master handlers and install the worker's own.
    pub fn install() -> io::Result<Self> {
        PIPE_W.store(-1, Ordering::SeqCst);
        WORKER_QUIT.store(false, Ordering::SeqCst);
        WORKER_REOPEN.store(false, Ordering::SeqCst);
        for signal in Signal::ALL {
            reset_handler(signal.as_raw())?;
        }
        install_handler(libc::SIGQUIT, worker_handler as usize)?;
        install_handler(libc::SIGUSR1, worker_handler as usize)?;
        install_handler(libc::SIGTERM, worker_handler as usize)?;
        install_handler(libc::SIGINT, worker_handler as usize)?;
        ignore_sigpipe()?;
        Ok(Self)
    }

    /// True once a graceful stop was requested (sticky).
    #[must_use]
    pub fn quit_requested(&self) -> bool {
        WORKER_QUIT.load(Ordering::SeqCst)
    }

    /// Request a graceful stop from process-local code (control channel).
    pub fn request_quit(&self) {
        WORKER_QUIT.store(true, Ordering::SeqCst);
    }

    /// Take the log-reopen request, clearing it.
    #[must_use]
    pub fn take_reopen_request(&self) -> bool {
        WORKER_REOPEN.swap(false, Ordering::SeqCst)
    }
}

fn install_handler(sig: libc::c_int, handler: usize) -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn reset_handler(sig: libc::c_int) -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = libc::SIG_DFL;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn ignore_sigpipe() -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = libc::SIG_IGN;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGPIPE, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The self-pipe write fd, for explicit closing in forked children.
#[must_use]
pub(crate) fn self_pipe_write_fd() -> RawFd {
    PIPE_W.load(Ordering::SeqCst)
}

/// Send a signal to a process.
pub fn kill(pid: u32, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
