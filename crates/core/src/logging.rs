//! Log filter selection and the daily log file under the data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime logs every graph optimisation pass at info.
pub const ORT_NOISE_DIRECTIVE: &str = "ort=warn";
/// Per-volume plan and timing summaries are kept in the file even when the
/// console is quiet.
pub const FILE_DETAIL_DIRECTIVE: &str = "voxeval_core=debug";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_RETENTION_DAYS: usize = 14;
const LOG_FILE_PREFIX: &str = "voxeval";
const LOG_FILE_SUFFIX: &str = "log";

/// Where the user-facing log filter came from, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    /// `--log-filter`
    Cli(String),
    /// `-v` (debug) or `-vv` (trace)
    Verbosity(u8),
    /// `RUST_LOG`
    Env(String),
    Default,
}

impl FilterSource {
    pub fn select(cli: Option<&str>, verbose: u8, env: Option<&str>) -> Self {
        match (cli, verbose, env) {
            (Some(filter), _, _) => Self::Cli(filter.to_string()),
            (None, 1.., _) => Self::Verbosity(verbose),
            (None, 0, Some(filter)) if !filter.trim().is_empty() => Self::Env(filter.to_string()),
            _ => Self::Default,
        }
    }

    pub fn directive(&self) -> &str {
        match self {
            Self::Cli(filter) | Self::Env(filter) => filter,
            Self::Verbosity(1) => "debug",
            Self::Verbosity(_) => "trace",
            Self::Default => DEFAULT_LOG_FILTER,
        }
    }

    /// Explicit choices on the command line are taken verbatim.
    fn is_explicit(&self) -> bool {
        matches!(self, Self::Cli(_) | Self::Verbosity(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    pub fn for_source(source: &FilterSource) -> Self {
        let directive = source.directive();
        if source.is_explicit() {
            return Self {
                console: directive.to_string(),
                file: directive.to_string(),
            };
        }
        Self {
            console: format!("{ORT_NOISE_DIRECTIVE},{directive}"),
            file: format!("{ORT_NOISE_DIRECTIVE},{FILE_DETAIL_DIRECTIVE},{directive}"),
        }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Opens `<data_dir>/logs/voxeval.<date>.log`, rotated daily.
pub fn open_log_file(data_dir: &Path) -> Result<RollingFileAppender> {
    let dir = log_dir(data_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_DAYS)
        .build(&dir)
        .with_context(|| format!("failed to open log file in {}", dir.display()))
}
