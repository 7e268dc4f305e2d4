//! Minimal molt server: two workers, reforking as the pool warms up.
//!
//! Run with `cargo run --example hello`, then:
//!
//! ```text
//! curl -v http://127.0.0.1:8080/
//! curl -v -T /etc/hosts http://127.0.0.1:8080/upload
//! ```

use molt::{AppResponse, Config, RequestEnv, Server};
use std::io::Read;

fn app(env: &mut RequestEnv) -> Result<AppResponse, molt::AppError> {
    let method = env.method().to_string();
    let path = env.path().to_string();
    match path.as_str() {
        "/upload" => {
            let mut body = Vec::new();
            if let Some(input) = env.input() {
                input.read_to_end(&mut body).map_err(molt::AppError::new)?;
            }
            Ok(AppResponse::text(format!("received {} bytes\n", body.len())))
        }
        _ => Ok(AppResponse::text(format!("{method} {path}\n"))),
    }
}

fn main() -> Result<(), molt::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Exec-spawned workers re-enter main; hand control to the worker loop.
    let build = || Config::new(|| Box::new(app) as Box<dyn molt::App>).with_worker_processes(2);
    if let Some(code) = molt::worker_from_env(build()) {
        std::process::exit(code);
    }

    let config = build()
        .with_listener("127.0.0.1:8080")?
        .with_refork_after(vec![500, 5_000]);
    Server::new(config)?.run()
}
