//! Logging setup for the polling service
//!
//! Console output plus an optional daily rolling file, both in the
//! `timestamp [LEVEL] message` format.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{PollSrvError, Result};

/// Environment override for the log directory
pub const LOG_DIR_ENV: &str = "POLLSRV_LOG_DIR";

// File writer guard, kept for the life of the process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `2026-03-02T00:50:44.809123Z [INFO] message`
pub struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Logging options resolved from CLI and config
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset
    pub level: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_to_file: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "pollsrv".to_string(),
            level: None,
            log_dir: None,
            log_to_file: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Log directory: `POLLSRV_LOG_DIR`, then config, then `logs`
    pub fn resolve_log_dir(&self) -> PathBuf {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                self.log_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("logs"))
            })
    }

    /// Filter directives: `RUST_LOG`, then the CLI level, then the default
    pub fn filter_directives(&self) -> String {
        if let Ok(env) = std::env::var("RUST_LOG") {
            if !env.is_empty() {
                return env;
            }
        }
        match &self.level {
            Some(level) => format!("{level},fieldlink_core={level},fieldlink_protocols={level}"),
            None => "info,pollsrv=debug,fieldlink_core=debug".to_string(),
        }
    }
}

/// Install the global subscriber
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.filter_directives())
        .map_err(|e| PollSrvError::LoggingError(format!("Bad log filter: {e}")))?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.log_to_file {
        let dir = config.resolve_log_dir();
        std::fs::create_dir_all(&dir)?;
        let appender =
            tracing_appender::rolling::daily(&dir, format!("{}.log", config.service_name));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if FILE_GUARD.set(guard).is_err() {
            return Err(PollSrvError::LoggingError(
                "Logging already initialized".to_string(),
            ));
        }
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PollSrvError::LoggingError(e.to_string()))?;

    if config.log_to_file {
        tracing::info!("Logging to {}", config.resolve_log_dir().display());
    }
    Ok(())
}
