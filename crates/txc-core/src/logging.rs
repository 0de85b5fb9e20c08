//! Logging initialization using the `tracing` ecosystem.
//!
//! - Console output on stderr (stdout of proxy sessions is not a terminal)
//! - File output (daily rotation via `tracing-appender`)
//! - Level from `RUST_LOG`, falling back to the explicit parameter

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// - `log_level`: default filter if `RUST_LOG` is not set (e.g. `"info"`)
/// - `log_dir`: optional directory for daily-rotating log files
/// - `file_prefix`: log file prefix (e.g. `"txc-proxy"`, `"session-4242"`)
///
/// A second call is a no-op; the first subscriber stays installed.
pub fn init_logging(log_level: &str, log_dir: Option<&str>, file_prefix: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(true);

    let file_layer = log_dir.map(|dir| {
        fmt::layer()
            .with_writer(tracing_appender::rolling::daily(dir, file_prefix))
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_logging("debug", None, "test");
        init_logging("info", None, "test");
        tracing::info!("still logging");
    }
}
