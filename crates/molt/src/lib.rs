//! molt: a preforking HTTP/1.1 application server with a generational
//! reforking worker lifecycle.
//!
//! A [`master::Server`] binds the listeners, forks `worker_processes`
//! single-threaded workers, and supervises them: liveness ticks, timeout
//! kills, reaping, respawning, and signal-driven shutdown. Workers accept
//! one connection at a time, stage the request through the parser and the
//! tee input, and invoke the configured application.
//!
//! The distinguishing mechanism is **reforking**: once a worker has served
//! enough requests (per [`Config::refork_after`]), it is promoted to a
//! *mold* — a non-serving process that forks the next generation of
//! workers, so their copy-on-write pages come from a warmed-up image
//! instead of the cold master.
//!
//! # Example
//!
//! ```no_run
//! use molt::{App, AppResponse, Config, RequestEnv, Server};
//!
//! fn hello(_env: &mut RequestEnv) -> Result<AppResponse, molt::AppError> {
//!     Ok(AppResponse::text("hello"))
//! }
//!
//! fn main() -> Result<(), molt::Error> {
//!     let config = Config::new(|| Box::new(hello) as Box<dyn App>)
//!         .with_listener("127.0.0.1:8080")?
//!         .with_worker_processes(2)
//!         .with_refork_after(vec![1000, 10_000]);
//!
//!     Server::new(config)?.run()
//! }
//! ```
//!
//! # Process model
//!
//! One master, `worker_processes` workers, and at most one mold. Each
//! process is single-threaded; the only shared resources are the listener
//! sockets (inherited by fork) and the per-worker side-band channels. The
//! master's signal surface: QUIT (graceful stop), TERM/INT (immediate),
//! USR1 (log rotation), USR2 (force a refork), TTIN/TTOU (resize the
//! pool).

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]

pub mod app;
pub mod config;
mod ctrl;
pub mod env;
pub mod error;
pub mod listener;
pub mod master;
pub mod memstats;
pub mod reader;
pub mod refork;
mod signals;
pub mod tee;
mod waiter;
mod worker;

pub use app::{App, AppBody, AppError, AppFactory, AppResponse};
pub use config::{Config, Hooks, WorkerIdent};
pub use env::{EarlyHints, RequestEnv};
pub use error::Error;
pub use listener::{Connection, ListenerAddress, ListenerOptions, ListenerSet};
pub use master::{worker_from_env, Server};
pub use memstats::MemStats;
pub use reader::{RequestReader, DEFAULT_CLIENT_BODY_BUFFER_SIZE, SERVER_SOFTWARE};
pub use refork::{default_mold_selector, ReforkPolicy, WorkerSnapshot};
pub use tee::{BodyInput, StreamInput, TeeInput};
pub use worker::EXIT_LOG_REOPEN_FAILED;
