//! Server-side wiring: configuration, the server wrapper that owns the
//! delegator and sampler tasks, and the per-host worker runtime.

pub mod config;
pub mod server;
pub mod worker_runtime;

pub use config::{ConfigError, ServerConfig};
pub use server::ServerWrapper;
pub use worker_runtime::WorkerRuntime;

/// Map the numeric `--log-level` flag onto a tracing filter: 0 warn, 1 info,
/// 2 debug, 3+ trace. `RUST_LOG` still wins when set.
pub fn init_logging(level: u8) {
    let default = match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
