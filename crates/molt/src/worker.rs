//! The worker process: accept loop, liveness ticks, and mold mode.
//!
//! A worker serves exactly one request at a time. Its only suspension
//! point is the readiness wait over the listeners plus its control
//! channel, bounded by half the liveness timeout. The tick is published
//! before every wait and after every request, so an idle worker stays
//! visibly alive.
//!
//! A promoted worker stops serving and becomes the mold: it parks on its
//! control channel and forks a new-generation worker for every spawn
//! request, reporting child pids back to the master.

use crate::app::App;
use crate::config::{Config, WorkerIdent};
use crate::ctrl::{ChildChannel, CtrlEvent, CtrlMessage};
use crate::env::EarlyHints;
use crate::error::Error;
use crate::listener::{Connection, ListenerSet};
use crate::reader::RequestReader;
use crate::signals::WorkerSignals;
use crate::waiter::Waiter;
use molt_http::ResponseWriter;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Exit code for a failed log reopen, per the log-rotation contract.
pub const EXIT_LOG_REOPEN_FAILED: i32 = 77;

/// Monotonic seconds; comparable across processes on the same host.
#[must_use]
pub(crate) fn monotonic_secs() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64
}

/// Child-side worker state.
struct WorkerProcess {
    nr: u32,
    generation: u64,
    config: Arc<Config>,
    listeners: ListenerSet,
    channel: ChildChannel,
    signals: WorkerSignals,
    reader: RequestReader,
    app: Box<dyn App>,
    requests: u64,
    waiter: Waiter,
}

/// Run a freshly forked worker to completion. Returns the exit code.
pub(crate) fn run_worker(
    nr: u32,
    generation: u64,
    config: Arc<Config>,
    listeners: ListenerSet,
    channel: ChildChannel,
) -> i32 {
    let signals = match WorkerSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(nr, error = %e, "worker signal setup failed");
            return 1;
        }
    };
    if let Err(e) = listeners.set_cloexec(true) {
        tracing::error!(nr, error = %e, "worker listener setup failed");
        return 1;
    }

    let ident = WorkerIdent {
        nr,
        pid: std::process::id(),
        generation,
    };
    if let Some(hook) = &config.hooks.after_fork {
        hook(&ident);
    }

    let app = (config.app_factory)();
    let reader = config.reader();
    let mut worker = WorkerProcess {
        nr,
        generation,
        config,
        listeners,
        channel,
        signals,
        reader,
        app,
        requests: 0,
        waiter: Waiter::new(),
    };
    worker.run()
}

impl WorkerProcess {
    fn run(&mut self) -> i32 {
        tracing::info!(
            nr = self.nr,
            pid = std::process::id(),
            generation = self.generation,
            "worker ready"
        );
        let ident = WorkerIdent {
            nr: self.nr,
            pid: std::process::id(),
            generation: self.generation,
        };
        if let Some(hook) = &self.config.hooks.after_worker_ready {
            hook(&ident);
        }

        let wait_bound = self.config.timeout / 2;
        loop {
            if self.signals.quit_requested() {
                break;
            }
            if self.signals.take_reopen_request() {
                if let Some(code) = self.reopen_logs() {
                    return code;
                }
            }
            self.publish_tick();

            match self.drain_ctrl() {
                CtrlOutcome::Continue => {}
                CtrlOutcome::Stop => break,
                CtrlOutcome::Mold => return self.run_mold(),
            }

            let mut fds: Vec<RawFd> = self.listeners.fds();
            fds.push(self.channel.ctrl_fd());
            let ready = match self.waiter.wait(&fds, wait_bound) {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::error!(nr = self.nr, error = %e, "wait failed");
                    return 1;
                }
            };

            for fd in ready {
                if fd == self.channel.ctrl_fd() {
                    continue; // handled at the top of the loop
                }
                if self.signals.quit_requested() {
                    break;
                }
                let accepted = match self.listeners.by_fd(fd) {
                    Some(listener) => listener.accept(),
                    None => continue,
                };
                match accepted {
                    Ok(Some(conn)) => {
                        self.handle_connection(conn);
                        self.requests += 1;
                        self.publish_tick();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(nr = self.nr, error = %e, "accept failed");
                    }
                }
            }
        }

        // Graceful stop: no request is in flight between loop iterations,
        // so closing the listeners is all that remains.
        self.listeners.close_all();
        tracing::info!(nr = self.nr, "worker exiting");
        0
    }

    fn publish_tick(&self) {
        self.channel.send_tick(monotonic_secs(), self.requests);
    }

    fn reopen_logs(&self) -> Option<i32> {
        tracing::info!(nr = self.nr, "reopening logs");
        if let Some(hook) = &self.config.hooks.log_reopen {
            if let Err(e) = hook() {
                tracing::error!(nr = self.nr, error = %e, "log reopen failed");
                if e.kind() == io::ErrorKind::PermissionDenied {
                    return Some(EXIT_LOG_REOPEN_FAILED);
                }
            }
        }
        None
    }

    fn drain_ctrl(&mut self) -> CtrlOutcome {
        loop {
            match self.channel.recv() {
                CtrlEvent::Empty => return CtrlOutcome::Continue,
                CtrlEvent::Closed => {
                    tracing::warn!(nr = self.nr, "master went away, stopping");
                    return CtrlOutcome::Stop;
                }
                CtrlEvent::Message(CtrlMessage::SoftKill, _) => return CtrlOutcome::Stop,
                CtrlEvent::Message(CtrlMessage::Promote, _) => return CtrlOutcome::Mold,
                CtrlEvent::Message(CtrlMessage::Spawn { nr }, _) => {
                    tracing::warn!(nr, "spawn request sent to a non-mold worker, ignoring");
                }
            }
        }
    }

    fn handle_connection(&mut self, mut conn: Connection) {
        match self.serve(&mut conn) {
            Ok(()) => {}
            Err(err) => self.answer_error(&mut conn, &err),
        }
    }

    fn serve(&mut self, conn: &mut Connection) -> Result<(), Error> {
        let mut env = self.reader.read_request(conn)?;

        if self.config.check_client_connection && conn.client_gone() {
            return Err(Error::ClientDisconnect(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client went away before dispatch",
            )));
        }

        if self.config.early_hints {
            let hints_out = conn.try_clone().map_err(Error::Io)?;
            env.set_early_hints(EarlyHints::new(Box::new(hints_out)));
        }
        env.set_hijack(conn.try_clone().map_err(Error::Io)?);

        let writer_out = conn.try_clone().map_err(Error::Io)?;
        let mut writer = ResponseWriter::new(writer_out);

        let mut response = self
            .app
            .call(&mut env)
            .map_err(|e| Error::App(Box::new(e)))?;

        // A 100 status is the application accepting the body: answer the
        // expectation, then ask again for the real response.
        if response.status == 100 {
            if env.expects_continue() {
                writer.write_continue()?;
            }
            response = self
                .app
                .call(&mut env)
                .map_err(|e| Error::App(Box::new(e)))?;
        }

        if env.is_hijacked() {
            tracing::debug!(nr = self.nr, "connection hijacked");
            return Ok(());
        }

        writer.write_head(response.status, &response.headers)?;
        match response.body {
            crate::app::AppBody::Empty => {}
            crate::app::AppBody::Bytes(bytes) => writer.write_body(&bytes)?,
            crate::app::AppBody::Chunks(chunks) => {
                for chunk in chunks {
                    writer.write_body(&chunk)?;
                }
            }
        }
        writer.finish()?;

        // Trailers arrive only once a chunked body has been fully read.
        if let Some(input) = env.input() {
            let trailers = input.trailers().to_vec();
            if !trailers.is_empty() {
                env.merge_trailers(&trailers);
            }
        }

        for callback in env.take_after_reply() {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
                tracing::error!(nr = self.nr, ?panic, "after-reply callback panicked");
            }
        }

        let _ = conn.shutdown_write();
        Ok(())
    }

    fn answer_error(&self, conn: &mut Connection, err: &Error) {
        if err.is_client_error() {
            tracing::debug!(nr = self.nr, error = %err, "request failed");
        } else {
            tracing::error!(nr = self.nr, error = %err, "request failed");
        }
        if let Some(status) = err.response_status() {
            let mut writer = ResponseWriter::new(conn);
            let _ = writer.write_error(status);
        }
    }

    /// Mold mode: fork new-generation workers on demand.
    fn run_mold(&mut self) -> i32 {
        let ident = WorkerIdent {
            nr: self.nr,
            pid: std::process::id(),
            generation: self.generation,
        };
        if let Some(hook) = &self.config.hooks.after_promotion {
            hook(&ident);
        }
        tracing::info!(
            pid = std::process::id(),
            generation = self.generation,
            "became mold"
        );

        let wait_bound = self.config.timeout / 2;
        loop {
            self.publish_tick();
            match self.channel.recv() {
                CtrlEvent::Empty => {}
                CtrlEvent::Closed => {
                    tracing::warn!("master went away, mold exiting");
                    return 0;
                }
                CtrlEvent::Message(CtrlMessage::SoftKill, _) => {
                    tracing::info!("mold retiring");
                    return 0;
                }
                CtrlEvent::Message(CtrlMessage::Promote, _) => {
                    tracing::warn!("already the mold, ignoring promote");
                }
                CtrlEvent::Message(CtrlMessage::Spawn { nr }, fds) => {
                    if let Some(code) = self.spawn_child(nr, fds) {
                        // In the child: run the worker loop to completion.
                        return code;
                    }
                }
            }
            if self.signals.quit_requested() {
                return 0;
            }
            let fds = [self.channel.ctrl_fd()];
            if let Err(e) = self.waiter.wait(&fds, wait_bound) {
                tracing::error!(error = %e, "mold wait failed");
                return 1;
            }
        }
    }

    /// Fork one worker for `nr`. Returns `None` in the mold, and the
    /// worker's exit code in the child.
    fn spawn_child(&mut self, nr: u32, fds: Vec<std::os::fd::OwnedFd>) -> Option<i32> {
        if fds.len() != 2 {
            tracing::error!(nr, got = fds.len(), "spawn request missing channel fds");
            return None;
        }
        let mut fds = fds.into_iter();
        let ctrl_r = fds.next().unwrap();
        let live_w = fds.next().unwrap();

        let pid = unsafe { libc::fork() };
        match pid {
            0 => {
                // Child: swap in the channel the master created for this
                // slot; the mold's own ends close with the old value.
                let old = std::mem::replace(
                    &mut self.channel,
                    ChildChannel::from_fds(ctrl_r, live_w),
                );
                drop(old);
                Some(self.rebirth(nr))
            }
            pid if pid > 0 => {
                // Mold: the passed fds close on drop; report the pid.
                tracing::info!(nr, pid, generation = self.generation + 1, "spawned worker");
                if let Err(e) = self.channel.send_spawned(nr, pid as u32) {
                    tracing::error!(nr, pid, error = %e, "failed to report spawn");
                }
                None
            }
            _ => {
                tracing::error!(nr, error = %io::Error::last_os_error(), "fork failed");
                None
            }
        }
    }

    /// Turn this (forked) process image back into a serving worker of the
    /// next generation.
    fn rebirth(&mut self, nr: u32) -> i32 {
        self.nr = nr;
        self.generation += 1;
        self.requests = 0;
        // The inherited epoll fd is shared with the mold; use a fresh one.
        self.waiter = Waiter::new();
        self.signals = match WorkerSignals::install() {
            Ok(signals) => signals,
            Err(e) => {
                tracing::error!(nr, error = %e, "worker signal setup failed");
                return 1;
            }
        };
        let ident = WorkerIdent {
            nr,
            pid: std::process::id(),
            generation: self.generation,
        };
        if let Some(hook) = &self.config.hooks.after_fork {
            hook(&ident);
        }
        self.app = (self.config.app_factory)();
        self.run()
    }
}

enum CtrlOutcome {
    Continue,
    Stop,
    Mold,
}
