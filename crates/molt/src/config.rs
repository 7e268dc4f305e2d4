//! Resolved server configuration.
//!
//! [`Config`] is the already-parsed form the core consumes; reading a
//! configuration file or command line into it is the embedding binary's
//! business. Built with `with_*` methods around a required application
//! factory.
//!
//! Lifecycle hooks run synchronously in a well-defined process. Hooks
//! running in the master treat errors as fatal to the cluster; hook panics
//! in a worker crash that worker, which is then respawned.

use crate::app::AppFactory;
use crate::listener::{ListenerAddress, ListenerOptions};
use crate::reader::{RequestReader, DEFAULT_CLIENT_BODY_BUFFER_SIZE};
use crate::refork::MoldSelector;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Worker identity passed to lifecycle hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdent {
    /// Slot number.
    pub nr: u32,
    /// Process id (0 in `before_fork`, where no child exists yet).
    pub pid: u32,
    /// Generation.
    pub generation: u64,
}

type WorkerHook = Box<dyn Fn(&WorkerIdent) + Send + Sync>;
type ExitHook = Box<dyn Fn(&WorkerIdent, i32) + Send + Sync>;
type LogReopenHook = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Lifecycle hook set. All hooks are optional.
#[derive(Default)]
pub struct Hooks {
    /// In the master, before each fork.
    pub before_fork: Option<WorkerHook>,
    /// In the child, immediately after fork.
    pub after_fork: Option<WorkerHook>,
    /// In the promoted worker as it becomes the mold.
    pub after_promotion: Option<WorkerHook>,
    /// In the worker, once its accept loop is entered.
    pub after_worker_ready: Option<WorkerHook>,
    /// In the master, after reaping a worker; receives the wait status.
    pub after_worker_exit: Option<ExitHook>,
    /// In any process on log rotation. A `PermissionDenied` error makes a
    /// worker exit with code 77.
    pub log_reopen: Option<LogReopenHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_fork", &self.before_fork.is_some())
            .field("after_fork", &self.after_fork.is_some())
            .field("after_promotion", &self.after_promotion.is_some())
            .field("after_worker_ready", &self.after_worker_ready.is_some())
            .field("after_worker_exit", &self.after_worker_exit.is_some())
            .field("log_reopen", &self.log_reopen.is_some())
            .finish()
    }
}

/// Fully resolved server configuration.
pub struct Config {
    /// Number of worker slots.
    pub worker_processes: usize,
    /// Liveness deadline: a worker silent for this long is killed.
    pub timeout: Duration,
    /// Listener addresses with their options.
    pub listeners: Vec<(ListenerAddress, ListenerOptions)>,
    /// Per-generation request thresholds driving reforking.
    pub refork_after: Vec<u64>,
    /// Stage bodies rewindably (tee) vs forward-only.
    pub rewindable_input: bool,
    /// In-memory body cap before spilling to a temp file.
    pub client_body_buffer_size: usize,
    /// Probe the client socket before invoking the application.
    pub check_client_connection: bool,
    /// Install the `103 Early Hints` emitter into request environments.
    pub early_hints: bool,
    /// Spawn workers by exec'ing the current binary instead of plain fork.
    pub spawn_via_exec: bool,
    /// Lifecycle hooks.
    pub hooks: Hooks,
    /// Mold selection override; `None` uses the private-memory default.
    pub mold_selector: Option<Box<MoldSelector>>,
    /// Builds the per-worker application.
    pub app_factory: Arc<AppFactory>,
}

impl Config {
    /// Start from defaults with the given application factory.
    pub fn new<F>(app_factory: F) -> Self
    where
        F: Fn() -> Box<dyn crate::app::App> + Send + Sync + 'static,
    {
        Self {
            worker_processes: 1,
            timeout: Duration::from_secs(20),
            listeners: Vec::new(),
            refork_after: Vec::new(),
            rewindable_input: true,
            client_body_buffer_size: DEFAULT_CLIENT_BODY_BUFFER_SIZE,
            check_client_connection: false,
            early_hints: false,
            spawn_via_exec: false,
            hooks: Hooks::default(),
            mold_selector: None,
            app_factory: Arc::new(app_factory),
        }
    }

    /// Set the worker count.
    #[must_use]
    pub fn with_worker_processes(mut self, count: usize) -> Self {
        self.worker_processes = count;
        self
    }

    /// Set the liveness timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a listener by address string with default options.
    ///
    /// # Errors
    ///
    /// Fails when the address does not parse.
    pub fn with_listener(mut self, address: &str) -> Result<Self, crate::error::Error> {
        let addr = ListenerAddress::parse(address)?;
        self.listeners.push((addr, ListenerOptions::default()));
        Ok(self)
    }

    /// Add a listener with explicit options.
    #[must_use]
    pub fn with_listener_opts(mut self, addr: ListenerAddress, opts: ListenerOptions) -> Self {
        self.listeners.push((addr, opts));
        self
    }

    /// Set the refork thresholds.
    #[must_use]
    pub fn with_refork_after(mut self, thresholds: Vec<u64>) -> Self {
        self.refork_after = thresholds;
        self
    }

    /// Toggle rewindable body staging.
    #[must_use]
    pub fn with_rewindable_input(mut self, rewindable: bool) -> Self {
        self.rewindable_input = rewindable;
        self
    }

    /// Set the in-memory body cap.
    #[must_use]
    pub fn with_client_body_buffer_size(mut self, size: usize) -> Self {
        self.client_body_buffer_size = size;
        self
    }

    /// Toggle the pre-dispatch client liveness probe.
    #[must_use]
    pub fn with_check_client_connection(mut self, enabled: bool) -> Self {
        self.check_client_connection = enabled;
        self
    }

    /// Toggle the early-hints emitter.
    #[must_use]
    pub fn with_early_hints(mut self, enabled: bool) -> Self {
        self.early_hints = enabled;
        self
    }

    /// Replace the hook set.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Install a mold selector.
    #[must_use]
    pub fn with_mold_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&[crate::refork::WorkerSnapshot]) -> Option<u32> + Send + Sync + 'static,
    {
        self.mold_selector = Some(Box::new(selector));
        self
    }

    /// The request reader matching this configuration.
    #[must_use]
    pub fn reader(&self) -> RequestReader {
        RequestReader {
            rewindable_input: self.rewindable_input,
            client_body_buffer_size: self.client_body_buffer_size,
            ..RequestReader::default()
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("worker_processes", &self.worker_processes)
            .field("timeout", &self.timeout)
            .field("listeners", &self.listeners)
            .field("refork_after", &self.refork_after)
            .field("rewindable_input", &self.rewindable_input)
            .field("client_body_buffer_size", &self.client_body_buffer_size)
            .field("check_client_connection", &self.check_client_connection)
            .field("early_hints", &self.early_hints)
            .field("spawn_via_exec", &self.spawn_via_exec)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppResponse;

    fn test_config() -> Config {
        Config::new(|| {
            Box::new(|_env: &mut crate::env::RequestEnv| Ok(AppResponse::text("ok")))
                as Box<dyn crate::app::App>
        })
    }

    #[test]
    fn defaults() {
        let config = test_config();
        assert_eq!(config.worker_processes, 1);
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(config.rewindable_input);
        assert_eq!(config.client_body_buffer_size, DEFAULT_CLIENT_BODY_BUFFER_SIZE);
        assert!(config.refork_after.is_empty());
    }

    #[test]
    fn builder_chains() {
        let config = test_config()
            .with_worker_processes(4)
            .with_timeout(Duration::from_secs(30))
            .with_listener("127.0.0.1:0")
            .unwrap()
            .with_refork_after(vec![100, 200])
            .with_early_hints(true);

        assert_eq!(config.worker_processes, 4);
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.refork_after, vec![100, 200]);
        assert!(config.early_hints);
    }

    #[test]
    fn reader_reflects_body_settings() {
        let config = test_config()
            .with_rewindable_input(false)
            .with_client_body_buffer_size(64);
        let reader = config.reader();
        assert!(!reader.rewindable_input);
        assert_eq!(reader.client_body_buffer_size, 64);
    }
}
