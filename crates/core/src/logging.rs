//! Log filter selection and the persistent file sink.
//!
//! The library only plans; installing a subscriber is left to the binary.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

use crate::config::LoggingConfig;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "atrain";
pub const LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub env_filter: Option<String>,
    /// 0 selects [`DEFAULT_LOG_RETENTION_FILES`].
    pub retention_files: usize,
}

impl LoggingOptions {
    pub fn from_config(config: &LoggingConfig, data_dir: Option<&Path>) -> Self {
        Self {
            data_dir: data_dir.map(Path::to_path_buf),
            retention_files: config.retention_files,
            ..Self::default()
        }
    }

    pub fn with_cli(mut self, verbose: u8, filter: Option<&str>) -> Self {
        self.verbose = verbose;
        self.cli_filter = filter.map(str::to_string);
        self
    }

    pub fn with_env(mut self, rust_log: Option<String>) -> Self {
        self.env_filter = rust_log;
        self
    }

    fn retention(&self) -> usize {
        match self.retention_files {
            0 => DEFAULT_LOG_RETENTION_FILES,
            n => n,
        }
    }
}

/// Where the active filter directive came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Cli,
    Verbose(u8),
    Env,
    Default,
}

impl fmt::Display for FilterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => f.write_str("--log-filter"),
            Self::Verbose(n) => write!(f, "-{}", "v".repeat(usize::from(*n))),
            Self::Env => f.write_str("RUST_LOG"),
            Self::Default => f.write_str("default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub directive: String,
    pub source: FilterSource,
}

/// `--log-filter` > `-vv` > `-v` > `RUST_LOG` > `info`.
pub fn select_filter(options: &LoggingOptions) -> LogFilter {
    let (directive, source) = if let Some(cli) = options.cli_filter.as_deref() {
        (cli.to_string(), FilterSource::Cli)
    } else if options.verbose > 0 {
        let level = if options.verbose >= 2 { "trace" } else { "debug" };
        (level.to_string(), FilterSource::Verbose(options.verbose))
    } else if let Some(env) = options
        .env_filter
        .as_deref()
        .map(str::trim)
        .filter(|env| !env.is_empty())
    {
        (env.to_string(), FilterSource::Env)
    } else {
        (DEFAULT_LOG_FILTER.to_string(), FilterSource::Default)
    };
    LogFilter { directive, source }
}

#[derive(Debug, Error)]
pub enum FileSinkError {
    #[error("no data directory configured")]
    NoDataDir,
    #[error("cannot create log directory {}: {source}", dir.display())]
    CreateDir { dir: PathBuf, source: io::Error },
    #[error("cannot open rolling log file in {}: {source}", dir.display())]
    Appender { dir: PathBuf, source: InitError },
}

impl FileSinkError {
    pub fn attempted_dir(&self) -> Option<&Path> {
        match self {
            Self::NoDataDir => None,
            Self::CreateDir { dir, .. } | Self::Appender { dir, .. } => Some(dir),
        }
    }
}

#[derive(Debug)]
pub struct FileSink {
    pub dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Daily-rotated `atrain.*.log` files under `<data_dir>/logs`.
pub fn open_file_sink(options: &LoggingOptions) -> Result<FileSink, FileSinkError> {
    let data_dir = options.data_dir.as_deref().ok_or(FileSinkError::NoDataDir)?;
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|source| FileSinkError::CreateDir {
        dir: dir.clone(),
        source,
    })?;

    let retention_files = options.retention();
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&dir)
        .map_err(|source| FileSinkError::Appender {
            dir: dir.clone(),
            source,
        })?;

    Ok(FileSink {
        dir,
        retention_files,
        appender,
    })
}

#[derive(Debug)]
pub struct LoggingSetup {
    pub filter: LogFilter,
    pub file_sink: Result<FileSink, FileSinkError>,
}

pub fn plan_logging(options: &LoggingOptions) -> LoggingSetup {
    LoggingSetup {
        filter: select_filter(options),
        file_sink: open_file_sink(options),
    }
}
