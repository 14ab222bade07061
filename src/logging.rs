//! Structured logging (C2): JSON or text, with per-request correlation ids.
//!
//! The teacher pack's "monitoring" feature set (`tracing` + `tracing-subscriber`)
//! is load-bearing here rather than optional, since every stage of the
//! orchestrator logs duration and outcome through it.

use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. Call once at startup.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => {
            let _ = subscriber.json().try_init();
        }
        LogFormat::Text => {
            let _ = subscriber.try_init();
        }
    }
}

/// A correlation id threaded through one analysis request's tracing spans,
/// mirroring the Python logger's `request_id` extra field.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
