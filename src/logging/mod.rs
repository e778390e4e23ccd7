//! Structured logging setup (ambient component K, SPEC_FULL §10).
//!
//! A headless `tracing-subscriber` registry: `EnvFilter` (RUST_LOG, falling
//! back to `[logging] level` from config) plus a stdout `fmt` layer, and
//! optionally a daily-rolling file layer under `{dataDir}/logs/agentd.log`
//! via `tracing-appender`. There is no TUI in this crate, so unlike a
//! `TuiLogLayer` that captures events to a buffer to avoid garbling an
//! alternate-screen display, logs simply go to stdout.

use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guard that must be kept alive for the lifetime of the process when file
/// logging is enabled; dropping it flushes and stops the background writer.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize the global tracing subscriber. `default_level` is the
/// `[logging] level` config value, used only when `RUST_LOG` is unset.
/// When `file` is true, a daily-rolling log file is also written under
/// `data_dir/logs/agentd.log`.
pub fn init(default_level: &str, file: bool, data_dir: &Path) -> LoggingGuard {
    let default_filter = format!("agentd={default_level},tower_http=info,axum=info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if file {
        let log_dir = data_dir.join("logs");
        let _ = std::fs::create_dir_all(&log_dir);
        let appender = tracing_appender::rolling::daily(&log_dir, "agentd.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
            .init();

        LoggingGuard {
            _file_guard: Some(guard),
        }
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();

        LoggingGuard { _file_guard: None }
    }
}
