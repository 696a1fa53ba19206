//! Log output.
//!
//! Every command logs to stderr, filtered by `RUST_LOG`. `run` also keeps
//! rolling log files in `<data dir>/logs`.

use std::{fmt, path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use tracing::level_filters::LevelFilter;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::{Directive, ParseError},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Directory for log files inside the data directory.
pub const LOGS_DIR_NAME: &str = "logs";

/// Terminal filter when `RUST_LOG` is unset.
const TERMINAL_DEFAULT: &str = "at_mirror=info";

fn terminal_filter() -> EnvFilter {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let directives = match directives.trim() {
        "" => TERMINAL_DEFAULT,
        s => s,
    };
    EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(directives)
}

/// Logs to stderr.
pub fn init_terminal_logging() -> Result<()> {
    let terminal = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter());
    tracing_subscriber::registry().with(terminal).try_init()?;
    Ok(())
}

/// Logs to stderr and, unless [`Rotation::Off`], to files named
/// `at-mirror.<period>.log` in the logs directory of `data_dir`.
///
/// File logs are written by a background thread; drop the returned guard
/// last to flush them.
pub fn init_run_logging(config: &FileLogging, data_dir: &Path) -> Result<Option<WorkerGuard>> {
    let (file, guard) = match config.rotation.rolling() {
        Some(rotation) => {
            let dir = data_dir.join(LOGS_DIR_NAME);
            let appender = rolling::Builder::new()
                .rotation(rotation)
                .max_log_files(config.max_files.max(1))
                .filename_prefix("at-mirror")
                .filename_suffix("log")
                .build(&dir)
                .with_context(|| format!("failed to open log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_line_number(true)
                .with_writer(writer)
                .with_filter(config.filter.env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let terminal = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter());
    tracing_subscriber::registry()
        .with(file)
        .with(terminal)
        .try_init()?;
    Ok(guard)
}

/// Log files of long running commands.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileLogging {
    /// Directives in `RUST_LOG` syntax. Overridden by `AT_MIRROR_FILE_RUST_LOG`.
    pub filter: LogFilter,
    /// Files kept before the oldest is deleted.
    pub max_files: usize,
    pub rotation: Rotation,
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            filter: LogFilter::default(),
            max_files: 14,
            rotation: Rotation::Daily,
        }
    }
}

/// Filter directives, written as a comma separated list.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct LogFilter(Vec<Directive>);

impl LogFilter {
    fn env_filter(&self) -> EnvFilter {
        self.0.iter().cloned().fold(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .parse_lossy(""),
            EnvFilter::add_directive,
        )
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        // request and pacing decisions are logged at debug
        let directives = ["at_mirror=debug", "hyper=warn", "reqwest=warn", "info"];
        Self(directives.iter().filter_map(|d| d.parse().ok()).collect())
    }
}

impl FromStr for LogFilter {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let directives = s
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(Directive::from_str)
            .collect::<Result<_, _>>()?;
        Ok(Self(directives))
    }
}

impl fmt::Display for LogFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, directive) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{directive}")?;
        }
        Ok(())
    }
}

/// How often a new log file is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    #[default]
    Daily,
    /// A single file that grows forever.
    Never,
    /// No log files.
    Off,
}

impl Rotation {
    fn rolling(self) -> Option<rolling::Rotation> {
        match self {
            Rotation::Hourly => Some(rolling::Rotation::HOURLY),
            Rotation::Daily => Some(rolling::Rotation::DAILY),
            Rotation::Never => Some(rolling::Rotation::NEVER),
            Rotation::Off => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn filters_are_validated() {
        assert!(LogFilter::from_str("at_mirror::proxy=trace, warn").is_ok());
        assert!(LogFilter::from_str("at_mirror=loud").is_err());
        assert_eq!(LogFilter::default().0.len(), 4);
    }

    #[test]
    fn file_logging_from_toml() -> TestResult {
        let logs: FileLogging =
            toml::from_str("filter = \"at_mirror::plc=trace,warn\"\nrotation = \"off\"")?;
        assert_eq!(logs.filter.to_string(), "at_mirror::plc=trace,warn");
        assert_eq!(logs.rotation.rolling(), None);
        assert_eq!(logs.max_files, 14);

        let text = toml::to_string(&FileLogging::default())?;
        let back: FileLogging = toml::from_str(&text)?;
        assert_eq!(back, FileLogging::default());
        Ok(())
    }
}
