//! Shared building blocks for the index benchmark workspace.
//!
//! - [`types`] holds the data model produced by a measured query run: the
//!   EXPLAIN plan tree, buffer counters, SQL parameter values and the
//!   per-run measurement record.
//! - [`initialize_logger`] wires the `log` facade to log4rs for every
//!   executable in the workspace.

use anyhow::Context;
use log::{Level, LevelFilter, Record};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::{Encode, pattern::PatternEncoder},
    filter::threshold::ThresholdFilter,
};
use std::{backtrace::Backtrace, env};

pub mod types;

const LOGGING_PATTERN: &str = "{d} {l} {f}:{L} - {m}\n";

/// `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE` set to anything but `0`.
fn backtraces_requested() -> bool {
    ["RUST_BACKTRACE", "RUST_LIB_BACKTRACE"]
        .iter()
        .any(|var| env::var(var).is_ok_and(|v| v.trim() != "0"))
}

/// Pattern encoder that appends a backtrace to `Error` records, so a failed
/// variant apply or aborted load can be traced from the run's log file.
#[derive(Debug)]
struct ErrorTraceEncoder {
    inner: PatternEncoder,
    trace_errors: bool,
}

impl ErrorTraceEncoder {
    fn new(pattern: &str, trace_errors: bool) -> Self {
        Self {
            inner: PatternEncoder::new(pattern),
            trace_errors,
        }
    }
}

impl Encode for ErrorTraceEncoder {
    fn encode(&self, w: &mut dyn log4rs::encode::Write, record: &Record<'_>) -> anyhow::Result<()> {
        if !self.trace_errors || record.level() != Level::Error {
            return self.inner.encode(w, record);
        }
        let trace = Backtrace::force_capture();
        self.inner.encode(
            w,
            &Record::builder()
                .args(format_args!("{}\nBacktrace:\n{trace}", record.args()))
                .level(record.level())
                .target(record.target())
                .module_path(record.module_path())
                .file(record.file())
                .line(record.line())
                .build(),
        )
    }
}

/// Install the global logger.
///
/// stderr only shows records at or above `log_level`; the optional log file
/// receives the same records so an experiment run leaves a trail next to its
/// results.
pub fn initialize_logger(log_level: LevelFilter, file_path: Option<&str>) -> anyhow::Result<()> {
    let trace_errors = backtraces_requested();
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(ErrorTraceEncoder::new(LOGGING_PATTERN, trace_errors)))
        .build();

    let mut config_builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(log_level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = file_path {
        let logfile = FileAppender::builder()
            .encoder(Box::new(ErrorTraceEncoder::new(LOGGING_PATTERN, trace_errors)))
            .build(path)
            .with_context(|| format!("failed to open log file {path}"))?;
        config_builder =
            config_builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let config = config_builder
        .build(root.build(log_level))
        .context("invalid log4rs configuration")?;

    log4rs::init_config(config).context("logger already initialised")?;
    Ok(())
}

/// Parse a textual level such as `info` or `WARN`.
pub fn parse_log_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Level from the environment variable `var`, falling back to `Info`.
pub fn resolve_log_level(var: &str) -> LevelFilter {
    env::var(var)
        .ok()
        .as_deref()
        .and_then(parse_log_level)
        .unwrap_or(LevelFilter::Info)
}

/// Log file path from the environment variable `var`.
///
/// Unset means `default`; an empty value or `none` disables file logging.
pub fn resolve_log_file(var: &str, default: &str) -> Option<String> {
    match env::var(var) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => Some(default.to_string()),
    }
}
