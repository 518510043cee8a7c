//! Logger setup
//!
//! A console-only bootstrap logger is installed first so that messages from
//! configuration loading are not lost. Once the configuration is resolved the
//! bootstrap handle is switched to the full layout.
//!
//! An existing log4rs YAML file wins. Without one, a layout is built in code:
//! warnings and errors on stderr, every record at the configured level in a
//! size-rolled JSON file, and errors alone in a second JSON file. When log4rs
//! cannot start (for instance the log directory is not writable) logging
//! falls back to env_logger on stderr.

use std::fmt;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::json::JsonEncoder;
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::threshold::ThresholdFilter;
use log4rs::Handle;

use crate::config::LogSettings;

const ROLL_SIZE: u64 = 10 * 1024 * 1024;
const ROLL_COUNT: u32 = 5;
const CONSOLE_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l})} [{X(bucket)}/{X(key)}] {t} - {m}{n}";

/// Which process is logging; worker processes get their own files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    Single,
    Coordinator,
    Worker(usize),
}

impl LogRole {
    fn file_stem(&self) -> String {
        match self {
            LogRole::Single | LogRole::Coordinator => "document-service".to_string(),
            LogRole::Worker(index) => format!("document-service-worker-{}", index),
        }
    }
}

impl fmt::Display for LogRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRole::Single => write!(f, "single process"),
            LogRole::Coordinator => write!(f, "coordinator"),
            LogRole::Worker(index) => write!(f, "worker {}", index),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log level {0:?}")]
    Level(String),

    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to configure log4rs: {0}")]
    Setup(String),
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::Level(level.to_string()))
}

fn rolling_json(dir: &Path, name: &str) -> Result<RollingFileAppender, LoggingError> {
    let path = dir.join(format!("{}.json", name));
    let archive = dir.join(format!("{}.{{}}.json", name));
    let roller = FixedWindowRoller::builder()
        .build(&archive.to_string_lossy(), ROLL_COUNT)
        .map_err(|e| LoggingError::Setup(e.to_string()))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE)), Box::new(roller));

    RollingFileAppender::builder()
        .encoder(Box::new(JsonEncoder::new()))
        .build(&path, Box::new(policy))
        .map_err(|source| LoggingError::File { path, source })
}

/// log4rs configuration for `role` writing under `settings.dir`
pub fn build_config(settings: &LogSettings, role: LogRole) -> Result<Config, LoggingError> {
    let level = parse_level(&settings.level)?;
    let dir = Path::new(&settings.dir);
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::File {
        path: dir.to_path_buf(),
        source,
    })?;

    let stem = role.file_stem();
    let console = console_appender();
    let all = rolling_json(dir, &format!("{}-log", stem))?;
    let errors = rolling_json(dir, &format!("{}-errors", stem))?;

    Config::builder()
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Warn)))
                .build("console", Box::new(console)),
        )
        .appender(Appender::builder().build("file", Box::new(all)))
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Error)))
                .build("errors", Box::new(errors)),
        )
        .build(
            Root::builder()
                .appender("console")
                .appender("file")
                .appender("errors")
                .build(level),
        )
        .map_err(|e| LoggingError::Setup(e.to_string()))
}

fn console_appender() -> ConsoleAppender {
    ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build()
}

/// Console-only configuration used until the real one is known
pub fn bootstrap_config() -> Result<Config, LoggingError> {
    Config::builder()
        .appender(Appender::builder().build("console", Box::new(console_appender())))
        .build(Root::builder().appender("console").build(LevelFilter::Info))
        .map_err(|e| LoggingError::Setup(e.to_string()))
}

/// Install the bootstrap logger; `None` when a logger is already installed
pub fn init_bootstrap_logging() -> Option<Handle> {
    let config = bootstrap_config().ok()?;
    log4rs::init_config(config).ok()
}

fn load_config(settings: &LogSettings, role: LogRole) -> Result<Config, LoggingError> {
    if !settings.config_file.is_empty() && Path::new(&settings.config_file).exists() {
        return log4rs::config::load_config_file(&settings.config_file, Default::default())
            .map_err(|e| LoggingError::Setup(e.to_string()));
    }
    build_config(settings, role)
}

fn fall_back_to_env_logger(settings: &LogSettings, reason: &str) {
    let level = parse_level(&settings.level).unwrap_or(LevelFilter::Info);
    let installed = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .try_init()
        .is_ok();
    if installed {
        log::warn!("Falling back to stderr logging: {}", reason);
    }
}

/// Install the final logger for `role`
///
/// With a bootstrap handle the running logger is reconfigured in place; if the
/// configuration cannot be built the bootstrap console logger stays active.
pub fn init_logging(settings: &LogSettings, role: LogRole, bootstrap: Option<Handle>) {
    match (load_config(settings, role), bootstrap) {
        (Ok(config), Some(handle)) => handle.set_config(config),
        (Ok(config), None) => {
            if let Err(e) = log4rs::init_config(config) {
                fall_back_to_env_logger(settings, &e.to_string());
            }
        }
        (Err(e), Some(_)) => log::warn!("Keeping console logging: {}", e),
        (Err(e), None) => fall_back_to_env_logger(settings, &e.to_string()),
    }
}
