//! Log filter selection and the persistent log file.
//!
//! The CLI installs one `EnvFilter` built from [`LogFilter::directives`] and
//! writes to stderr plus, when [`open_log_file`] succeeds, a daily rolling
//! file under `<data_dir>/logs`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime logs every session build at info level.
pub const RUNTIME_NOISE_FILTER: &str = "ort=error";
pub const LOG_RETENTION_FILES: usize = 14;

const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "tilescale";
const LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    /// `--log-filter`.
    Cli,
    /// `-v` or `-vv`.
    Verbose,
    /// `RUST_LOG`.
    Env,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub source: FilterSource,
    pub directives: String,
}

impl LogFilter {
    /// `--log-filter` wins over `-v`/`-vv`, which win over `RUST_LOG`.
    /// Runtime noise is muted unless the user asked for a level explicitly.
    pub fn select(cli_filter: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        let (source, user) = match (cli_filter, verbose, rust_log) {
            (Some(filter), _, _) => (FilterSource::Cli, filter.to_string()),
            (None, 2..=u8::MAX, _) => (FilterSource::Verbose, "trace".to_string()),
            (None, 1, _) => (FilterSource::Verbose, "debug".to_string()),
            (None, 0, Some(filter)) if !filter.trim().is_empty() => {
                (FilterSource::Env, filter.to_string())
            }
            _ => (FilterSource::Default, DEFAULT_LOG_FILTER.to_string()),
        };

        let directives = if source.is_explicit() {
            user
        } else {
            format!("{RUNTIME_NOISE_FILTER},{user}")
        };
        Self { source, directives }
    }
}

impl FilterSource {
    pub fn is_explicit(self) -> bool {
        matches!(self, Self::Cli | Self::Verbose)
    }
}

pub struct LogFile {
    pub dir: PathBuf,
    pub appender: RollingFileAppender,
}

/// Daily rolling `tilescale.<date>.log` under `<data_dir>/logs`, keeping
/// the newest [`LOG_RETENTION_FILES`] files.
pub fn open_log_file(data_dir: &Path) -> Result<LogFile> {
    let dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(&dir)
        .with_context(|| format!("failed to open rolling log file in {}", dir.display()))?;
    Ok(LogFile { dir, appender })
}
