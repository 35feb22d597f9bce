// src/infra/logger.rs — Structured logging with tracing

use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging(level: &str) {
    // RUST_LOG wins; otherwise the CLI level, with chatty HTTP internals
    // held at warn so request logs stay readable.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,reqwest=warn")));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
