//! The master process: supervision, reaping, timeout murder, and the
//! reforking lifecycle.
//!
//! The master never touches client sockets. Its control loop blocks only
//! on the self-pipe; each iteration reaps exited children, handles one
//! queued signal token, kills workers whose ticks went stale, fills
//! missing worker slots, and evaluates the refork policy.
//!
//! Generation 0 workers are forked from the master itself. Once a worker
//! is promoted to mold, subsequent spawns are delegated to it over its
//! control channel, with the new worker's side-band fds passed along.

use crate::config::{Config, WorkerIdent};
use crate::ctrl::{channel_pair, ChildChannel, CtrlMessage, LiveMessage, MasterChannel};
use crate::error::Error;
use crate::listener::{ListenerSet, FD_ENV};
use crate::memstats::MemStats;
use crate::refork::{default_mold_selector, ReforkPolicy, WorkerSnapshot};
use crate::signals::{self, SelfPipe, Signal};
use crate::waiter::Waiter;
use crate::worker::{monotonic_secs, run_worker};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable carrying worker bootstrap data for exec spawns:
/// `<nr>;<generation>;<ctrl_fd>,<live_fd>`.
pub const WORKER_ENV: &str = "MOLT_WORKER";

/// Master-side record of one live child.
struct Worker {
    nr: u32,
    pid: u32,
    generation: u64,
    channel: MasterChannel,
    tick: u64,
    requests: u64,
    soft_killed: bool,
}

/// A spawn delegated to the mold, awaiting its pid report.
struct PendingSpawn {
    channel: MasterChannel,
    requested_at: u64,
}

/// The current mold, when one has been promoted.
struct Mold {
    pid: u32,
    channel: MasterChannel,
    tick: u64,
}

enum Flow {
    Continue,
    Exit,
}

/// The preforking supervisor.
pub struct Server {
    config: Arc<Config>,
    listeners: ListenerSet,
    pipe: SelfPipe,
    waiter: Waiter,
    workers: Vec<Worker>,
    pending: Vec<(u32, PendingSpawn)>,
    mold: Option<Mold>,
    generation: u64,
    worker_processes: usize,
    policy: ReforkPolicy,
    last_check: u64,
}

impl Server {
    /// Bind the configured listeners (merging any inherited sockets) and
    /// prepare the supervisor. Fatal errors here mean a non-zero exit.
    pub fn new(config: Config) -> Result<Self, Error> {
        let mut listeners = ListenerSet::inherit().map_err(Error::Io)?;
        for (addr, opts) in &config.listeners {
            listeners.bind_listen(addr, opts)?;
        }
        // The master keeps listeners across exec; workers re-mark them.
        listeners.set_cloexec(false).map_err(Error::Io)?;

        let worker_processes = config.worker_processes;
        let policy = ReforkPolicy::new(config.refork_after.clone());
        Ok(Self {
            config: Arc::new(config),
            listeners,
            pipe: SelfPipe::install().map_err(Error::Io)?,
            waiter: Waiter::new(),
            workers: Vec::new(),
            pending: Vec::new(),
            mold: None,
            generation: 0,
            worker_processes,
            policy,
            last_check: monotonic_secs(),
        })
    }

    /// Canonical names of the bound listeners.
    #[must_use]
    pub fn listener_names(&self) -> Vec<String> {
        self.listeners.listener_names()
    }

    /// Run the supervision loop until shutdown.
    pub fn run(&mut self) -> Result<(), Error> {
        tracing::info!(
            pid = std::process::id(),
            workers = self.worker_processes,
            listeners = ?self.listener_names(),
            "master ready"
        );

        loop {
            self.reap_children();
            self.drain_liveness();

            if let Some(signal) = self.pipe.pop_token() {
                if let Flow::Exit = self.handle_signal(signal)? {
                    return Ok(());
                }
            }

            let now = monotonic_secs();
            let timeout_secs = self.config.timeout.as_secs().max(1);
            let mut bound = self.config.timeout / 2;
            if now.saturating_sub(self.last_check) > timeout_secs {
                // The host was likely suspended; killing on stale ticks
                // now would murder perfectly healthy workers.
                tracing::warn!(
                    gap = now - self.last_check,
                    "clock jumped, skipping timeout enforcement"
                );
            } else if let Some(deadline) = self.murder_lazy_workers(now, timeout_secs) {
                bound = bound.min(Duration::from_secs(deadline.saturating_sub(now).max(1)));
            }
            self.last_check = now;

            self.maintain_worker_count();
            self.check_refork(false);

            let fds = [self.pipe.as_raw_fd()];
            self.waiter.wait(&fds, bound).map_err(Error::Io)?;
            self.pipe.drain_pipe();
        }
    }

    // ------------------------------------------------------------------
    // Loop steps
    // ------------------------------------------------------------------

    fn reap_children(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                // 0: children exist but none exited; -1: ECHILD, benign.
                return;
            }
            self.handle_exit(pid as u32, status);
        }
    }

    fn handle_exit(&mut self, pid: u32, status: libc::c_int) {
        if self.mold.as_ref().is_some_and(|m| m.pid == pid) {
            tracing::warn!(pid, "mold died, falling back to direct forking");
            self.mold = None;
            // Delegated spawns can no longer complete.
            self.pending.clear();
            return;
        }

        if let Some(pos) = self.workers.iter().position(|w| w.pid == pid) {
            let worker = self.workers.remove(pos);
            let code = if libc::WIFEXITED(status) {
                Some(libc::WEXITSTATUS(status))
            } else {
                None
            };
            tracing::info!(
                nr = worker.nr,
                pid,
                generation = worker.generation,
                code,
                "worker exited"
            );
            let ident = WorkerIdent {
                nr: worker.nr,
                pid,
                generation: worker.generation,
            };
            if let Some(hook) = &self.config.hooks.after_worker_exit {
                hook(&ident, status);
            }
        } else {
            tracing::debug!(pid, "reaped unknown child");
        }
    }

    fn drain_liveness(&mut self) {
        for worker in &mut self.workers {
            let (messages, _closed) = worker.channel.drain_live();
            for message in messages {
                if let LiveMessage::Tick { tick, requests } = message {
                    worker.tick = tick;
                    worker.requests = requests;
                }
            }
        }

        let mut spawned = Vec::new();
        if let Some(mold) = &mut self.mold {
            let (messages, _closed) = mold.channel.drain_live();
            for message in messages {
                match message {
                    LiveMessage::Tick { tick, .. } => mold.tick = tick,
                    LiveMessage::Spawned { nr, pid } => spawned.push((nr, pid)),
                }
            }
        }
        for (nr, pid) in spawned {
            self.register_spawned(nr, pid);
        }
    }

    fn register_spawned(&mut self, nr: u32, pid: u32) {
        let Some(pos) = self.pending.iter().position(|(p_nr, _)| *p_nr == nr) else {
            tracing::warn!(nr, pid, "spawn report for a slot not pending");
            return;
        };
        let (_, pending) = self.pending.remove(pos);
        self.workers.push(Worker {
            nr,
            pid,
            generation: self.generation,
            channel: pending.channel,
            tick: monotonic_secs(),
            requests: 0,
            soft_killed: false,
        });
    }

    fn handle_signal(&mut self, signal: Signal) -> Result<Flow, Error> {
        match signal {
            Signal::Quit => {
                self.graceful_shutdown();
                Ok(Flow::Exit)
            }
            Signal::Term | Signal::Int => {
                self.immediate_shutdown();
                Ok(Flow::Exit)
            }
            Signal::Usr1 => {
                tracing::info!("rotating logs");
                if let Some(hook) = &self.config.hooks.log_reopen {
                    if let Err(e) = hook() {
                        // Hook failures in the master are fatal to the
                        // cluster; a half-rotated master cannot be trusted.
                        tracing::error!(error = %e, "master log reopen failed");
                        self.immediate_shutdown();
                        return Err(Error::Io(e));
                    }
                }
                for worker in &self.workers {
                    let _ = signals::kill(worker.pid, libc::SIGUSR1);
                }
                if let Some(mold) = &self.mold {
                    let _ = signals::kill(mold.pid, libc::SIGUSR1);
                }
                Ok(Flow::Continue)
            }
            Signal::Usr2 => {
                self.check_refork(true);
                Ok(Flow::Continue)
            }
            Signal::Ttin => {
                self.worker_processes += 1;
                tracing::info!(workers = self.worker_processes, "worker count raised");
                Ok(Flow::Continue)
            }
            Signal::Ttou => {
                self.worker_processes = self.worker_processes.saturating_sub(1);
                tracing::info!(workers = self.worker_processes, "worker count lowered");
                Ok(Flow::Continue)
            }
            Signal::Chld => Ok(Flow::Continue),
        }
    }

    /// Kill workers whose tick went stale. Returns the earliest upcoming
    /// deadline so the sleep can be shortened to meet it.
    fn murder_lazy_workers(&mut self, now: u64, timeout_secs: u64) -> Option<u64> {
        let mut next_deadline: Option<u64> = None;
        for worker in &self.workers {
            let age = now.saturating_sub(worker.tick);
            if age > timeout_secs {
                tracing::warn!(
                    nr = worker.nr,
                    pid = worker.pid,
                    age,
                    timeout = timeout_secs,
                    "worker timed out, killing"
                );
                let _ = signals::kill(worker.pid, libc::SIGKILL);
            } else {
                let deadline = worker.tick + timeout_secs;
                next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
            }
        }
        if let Some(mold) = &self.mold {
            let age = now.saturating_sub(mold.tick);
            if age > timeout_secs {
                tracing::warn!(pid = mold.pid, age, "mold timed out, killing");
                let _ = signals::kill(mold.pid, libc::SIGKILL);
            }
        }
        next_deadline
    }

    fn maintain_worker_count(&mut self) {
        // Delegated spawns the mold never answered are abandoned so the
        // slot can be refilled (possibly by direct fork).
        let now = monotonic_secs();
        let timeout_secs = self.config.timeout.as_secs().max(1);
        self.pending.retain(|(nr, pending)| {
            let stale = now.saturating_sub(pending.requested_at) > timeout_secs;
            if stale {
                tracing::warn!(nr = *nr, "spawn request went unanswered, abandoning");
            }
            !stale
        });

        // Excess slots (TTOU) are retired gracefully.
        let limit = self.worker_processes as u32;
        let mut to_soft_kill = Vec::new();
        for worker in &mut self.workers {
            if worker.nr >= limit && !worker.soft_killed {
                to_soft_kill.push(worker.pid);
                worker.soft_killed = true;
                let _ = worker.channel.send(CtrlMessage::SoftKill);
            }
        }
        for pid in to_soft_kill {
            let _ = signals::kill(pid, libc::SIGQUIT);
        }

        for nr in 0..limit {
            let filled = self
                .workers
                .iter()
                .any(|w| w.nr == nr && !w.soft_killed)
                || self.pending.iter().any(|(p_nr, _)| *p_nr == nr);
            if !filled {
                self.spawn_worker(nr);
            }
        }
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    fn spawn_worker(&mut self, nr: u32) {
        let ident = WorkerIdent {
            nr,
            pid: 0,
            generation: self.generation,
        };
        if let Some(hook) = &self.config.hooks.before_fork {
            hook(&ident);
        }

        if self.mold.is_some() {
            if self.spawn_via_mold(nr) {
                return;
            }
            // The mold could not take the request; fall back.
            self.mold = None;
        }
        self.spawn_direct(nr);
    }

    fn spawn_via_mold(&mut self, nr: u32) -> bool {
        let Some(mold) = &self.mold else {
            return false;
        };
        let (master_ch, child_ch) = match channel_pair() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(nr, error = %e, "channel setup failed");
                return true; // not the mold's fault; retry next tick
            }
        };
        match mold.channel.send_spawn(nr, &child_ch) {
            Ok(()) => {
                // The child-end fds were duplicated into the message; our
                // copies close here.
                drop(child_ch);
                self.pending.push((
                    nr,
                    PendingSpawn {
                        channel: master_ch,
                        requested_at: monotonic_secs(),
                    },
                ));
                true
            }
            Err(e) => {
                tracing::warn!(nr, error = %e, "mold unreachable, forking directly");
                false
            }
        }
    }

    fn spawn_direct(&mut self, nr: u32) {
        let (master_ch, child_ch) = match channel_pair() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(nr, error = %e, "channel setup failed");
                return;
            }
        };

        if self.config.spawn_via_exec {
            self.spawn_exec(nr, master_ch, child_ch);
            return;
        }

        let pid = unsafe { libc::fork() };
        match pid {
            0 => {
                // Child: shed every master-side fd, then serve.
                drop(master_ch);
                self.close_master_fds();
                let config = Arc::clone(&self.config);
                let listeners = std::mem::take(&mut self.listeners);
                let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_worker(nr, self.generation, config, listeners, child_ch)
                }))
                .unwrap_or(1);
                unsafe { libc::_exit(code) }
            }
            pid if pid > 0 => {
                drop(child_ch);
                tracing::info!(nr, pid, generation = self.generation, "spawned worker");
                self.workers.push(Worker {
                    nr,
                    pid: pid as u32,
                    generation: self.generation,
                    channel: master_ch,
                    tick: monotonic_secs(),
                    requests: 0,
                    soft_killed: false,
                });
            }
            _ => {
                tracing::error!(nr, error = %std::io::Error::last_os_error(), "fork failed");
            }
        }
    }

    /// Exec-based spawn: fork, then exec the current binary with worker
    /// bootstrap data in the environment. Requires the embedding binary to
    /// call [`crate::worker_from_env`] early in `main`.
    fn spawn_exec(&mut self, nr: u32, master_ch: MasterChannel, child_ch: ChildChannel) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                tracing::error!(nr, error = %e, "current_exe failed, forking instead");
                drop(master_ch);
                drop(child_ch);
                return;
            }
        };

        let pid = unsafe { libc::fork() };
        match pid {
            0 => {
                drop(master_ch);
                self.close_master_fds();
                let [ctrl_fd, live_fd] = child_ch.raw_fds();
                if child_ch.clear_cloexec().is_err() {
                    unsafe { libc::_exit(1) }
                }
                std::env::set_var(
                    WORKER_ENV,
                    format!("{nr};{};{ctrl_fd},{live_fd}", self.generation),
                );
                std::env::set_var(FD_ENV, self.listeners.fd_env_value());
                let err = exec(&exe);
                tracing::error!(error = %err, "exec failed");
                unsafe { libc::_exit(1) }
            }
            pid if pid > 0 => {
                drop(child_ch);
                tracing::info!(nr, pid, generation = self.generation, "exec-spawned worker");
                self.workers.push(Worker {
                    nr,
                    pid: pid as u32,
                    generation: self.generation,
                    channel: master_ch,
                    tick: monotonic_secs(),
                    requests: 0,
                    soft_killed: false,
                });
            }
            _ => {
                tracing::error!(nr, error = %std::io::Error::last_os_error(), "fork failed");
            }
        }
    }

    /// Close fds that belong to the master, from inside a fresh child.
    /// The owning handles stay alive in the parent; the child never drops
    /// them (it exits through `_exit`), so raw closes cannot double-free.
    fn close_master_fds(&self) {
        unsafe {
            libc::close(self.pipe.as_raw_fd());
            libc::close(signals::self_pipe_write_fd());
            for worker in &self.workers {
                for fd in worker.channel.raw_fds() {
                    libc::close(fd);
                }
            }
            for (_, pending) in &self.pending {
                for fd in pending.channel.raw_fds() {
                    libc::close(fd);
                }
            }
            if let Some(mold) = &self.mold {
                for fd in mold.channel.raw_fds() {
                    libc::close(fd);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reforking
    // ------------------------------------------------------------------

    fn check_refork(&mut self, forced: bool) {
        if !forced && !self.policy.active(self.generation) {
            return;
        }

        let snapshots = self.snapshots();
        if snapshots.is_empty() {
            return;
        }
        if !forced && !self.policy.should_refork(self.generation, &snapshots) {
            return;
        }

        let nr = match &self.config.mold_selector {
            Some(selector) => selector(&snapshots),
            None => default_mold_selector(&snapshots),
        };
        let Some(nr) = nr else {
            return;
        };
        let Some(pos) = self
            .workers
            .iter()
            .position(|w| w.nr == nr && w.generation == self.generation && !w.soft_killed)
        else {
            tracing::warn!(nr, "selected mold candidate is gone");
            return;
        };

        tracing::info!("Refork condition met, promoting ourselves");
        let candidate = self.workers.remove(pos);
        if let Err(e) = candidate.channel.send(CtrlMessage::Promote) {
            tracing::error!(nr, pid = candidate.pid, error = %e, "promote failed");
            self.workers.push(candidate);
            return;
        }
        tracing::info!(
            nr,
            pid = candidate.pid,
            generation = self.generation,
            "worker promoted to mold"
        );

        // Retire the previous worker-mold.
        if let Some(old) = self.mold.replace(Mold {
            pid: candidate.pid,
            channel: candidate.channel,
            tick: candidate.tick,
        }) {
            let _ = old.channel.send(CtrlMessage::SoftKill);
            let _ = signals::kill(old.pid, libc::SIGQUIT);
        }

        // The old generation drains while its replacements spawn.
        let old_generation = self.generation;
        for worker in &mut self.workers {
            if worker.generation == old_generation && !worker.soft_killed {
                worker.soft_killed = true;
                let _ = worker.channel.send(CtrlMessage::SoftKill);
                let _ = signals::kill(worker.pid, libc::SIGQUIT);
            }
        }
        self.generation += 1;
        tracing::info!(generation = self.generation, "generation advanced");
    }

    fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .iter()
            .filter(|w| w.generation == self.generation && !w.soft_killed)
            .map(|w| WorkerSnapshot {
                nr: w.nr,
                pid: w.pid,
                generation: w.generation,
                requests: w.requests,
                mem: MemStats::read(w.pid).ok(),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn graceful_shutdown(&mut self) {
        tracing::info!("graceful shutdown");
        self.listeners.close_all();

        for worker in &mut self.workers {
            worker.soft_killed = true;
            let _ = worker.channel.send(CtrlMessage::SoftKill);
            let _ = signals::kill(worker.pid, libc::SIGQUIT);
        }
        if let Some(mold) = &self.mold {
            let _ = mold.channel.send(CtrlMessage::SoftKill);
            let _ = signals::kill(mold.pid, libc::SIGQUIT);
        }

        let deadline = monotonic_secs() + self.config.timeout.as_secs().max(1);
        while monotonic_secs() < deadline {
            self.reap_children();
            if self.workers.is_empty() && self.mold.is_none() {
                tracing::info!("all workers drained");
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for worker in &self.workers {
            tracing::warn!(nr = worker.nr, pid = worker.pid, "killing straggler");
            let _ = signals::kill(worker.pid, libc::SIGKILL);
        }
        if let Some(mold) = &self.mold {
            let _ = signals::kill(mold.pid, libc::SIGKILL);
        }
        self.reap_children();
    }

    fn immediate_shutdown(&mut self) {
        tracing::info!("immediate shutdown");
        for worker in &self.workers {
            let _ = signals::kill(worker.pid, libc::SIGTERM);
        }
        if let Some(mold) = &self.mold {
            let _ = signals::kill(mold.pid, libc::SIGTERM);
        }
        // One quick reap pass; anything slower is init's problem now.
        std::thread::sleep(Duration::from_millis(50));
        self.reap_children();
    }
}

fn exec(path: &std::path::Path) -> std::io::Error {
    use std::os::unix::ffi::OsStrExt;
    let c_path = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
        Ok(c) => c,
        Err(_) => return std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad exe path"),
    };
    let argv = [c_path.as_ptr(), std::ptr::null()];
    unsafe {
        libc::execv(c_path.as_ptr(), argv.as_ptr());
    }
    std::io::Error::last_os_error()
}

/// Exec-spawned worker entry: when `MOLT_WORKER` is present, run the
/// worker loop and return its exit code. The embedding binary calls this
/// before starting a [`Server`] and exits with the returned code.
#[must_use]
pub fn worker_from_env(config: Config) -> Option<i32> {
    let spec = std::env::var(WORKER_ENV).ok()?;
    std::env::remove_var(WORKER_ENV);

    let parsed = parse_worker_env(&spec);
    let Some((nr, generation, ctrl_fd, live_fd)) = parsed else {
        tracing::error!(spec = %spec, "malformed worker bootstrap data");
        return Some(1);
    };

    let listeners = match ListenerSet::inherit() {
        Ok(listeners) => listeners,
        Err(e) => {
            tracing::error!(error = %e, "listener inheritance failed");
            return Some(1);
        }
    };
    std::env::remove_var(FD_ENV);

    let channel = unsafe {
        ChildChannel::from_fds(OwnedFd::from_raw_fd(ctrl_fd), OwnedFd::from_raw_fd(live_fd))
    };
    Some(run_worker(nr, generation, Arc::new(config), listeners, channel))
}

fn parse_worker_env(spec: &str) -> Option<(u32, u64, i32, i32)> {
    let mut parts = spec.split(';');
    let nr = parts.next()?.parse().ok()?;
    let generation = parts.next()?.parse().ok()?;
    let fds = parts.next()?;
    let (ctrl, live) = fds.split_once(',')?;
    Some((nr, generation, ctrl.parse().ok()?, live.parse().ok()?))
}
