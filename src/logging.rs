use anyhow::Result;
use camino::Utf8PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Five-level log scale matching the historical CLI's `--loglevel 0-4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Detailed,
    Debug,
}

impl LogLevel {
    pub fn from_u8(level: u8) -> Self {
        match level.min(4) {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Detailed,
            _ => LogLevel::Debug,
        }
    }

    /// Maps onto `tracing`'s filter directives; `Detailed` shares `info` (the historical CLI's
    /// `logDetailed` sits between `logInfo` and `logDebug` with no `tracing::Level` counterpart).
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Detailed => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Injected log sink. No hidden global state: [`init_logging`] is called once by
/// [`crate::driver::Driver`] with an explicit [`LogConfig`] built from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub enum LogOutput {
    Console,
    File { path: Utf8PathBuf },
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
}

impl LogConfig {
    pub fn console(level: LogLevel) -> Self {
        Self {
            level,
            output: LogOutput::Console,
        }
    }

    pub fn file(level: LogLevel, path: Utf8PathBuf) -> Self {
        Self {
            level,
            output: LogOutput::File { path },
        }
    }
}

/// Guard returned by [`init_logging`] when logging to a file; holding onto it keeps the
/// non-blocking writer's background thread alive for the process lifetime.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::new(config.level.as_filter_str());

    let guard = match &config.output {
        LogOutput::Console => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_level(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
            None
        }
        LogOutput::File { path } => {
            let dir = path.parent().unwrap_or_else(|| camino::Utf8Path::new("."));
            let file_name = path.file_name().unwrap_or("fscrawl.log");
            let file_appender = tracing_appender::rolling::never(dir.as_std_path(), file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking);
            tracing_subscriber::registry().with(filter).with(layer).init();
            Some(guard)
        }
    };

    tracing::debug!(level = config.level.as_filter_str(), "logging initialized");
    Ok(LoggingGuard(guard))
}
