//! Logging configuration and initialization
//!
//! The pipeline binary initializes `tracing` once through [`init_logging`].
//!
//! - Console output goes to **stderr**; stdout carries the run summary.
//! - Optional daily-rotating file output via `tracing-appender`.
//! - Text or JSON lines.
//! - `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX` and
//!   `LOG_FILTER` override whatever the binary chose.
//!
//! HTTP client internals (`hyper`, `h2`, `reqwest`, `rustls`) are capped at
//! `warn` unless `LOG_FILTER` names them explicitly.
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! let dataset = "findings";
//! info!(dataset, rows = 1200, "Fetched dataset");
//! warn!(dataset, column = "type_requirement", "Expected column missing");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fac_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::builder()
//!         .level(LogLevel::Debug)
//!         .log_file_prefix("fac-pipeline")
//!         .build()
//!         .with_env_overrides()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("Pipeline started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Dependencies whose debug output drowns the pipeline's own events
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls"];

/// Minimum severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_tracing(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Accepted spellings, matched case-insensitively
trait Named: Sized + Copy + 'static {
    const KIND: &'static str;
    const NAMES: &'static [(&'static str, Self)];

    fn parse_name(value: &str) -> Result<Self> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, v)| *v)
            .ok_or_else(|| anyhow!("invalid log {} '{}'", Self::KIND, value))
    }
}

impl Named for LogLevel {
    const KIND: &'static str = "level";
    const NAMES: &'static [(&'static str, Self)] = &[
        ("trace", LogLevel::Trace),
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("warning", LogLevel::Warn),
        ("error", LogLevel::Error),
    ];
}

impl Named for LogOutput {
    const KIND: &'static str = "output";
    const NAMES: &'static [(&'static str, Self)] = &[
        ("console", LogOutput::Console),
        ("stderr", LogOutput::Console),
        ("file", LogOutput::File),
        ("both", LogOutput::Both),
    ];
}

impl Named for LogFormat {
    const KIND: &'static str = "format";
    const NAMES: &'static [(&'static str, Self)] =
        &[("text", LogFormat::Text), ("pretty", LogFormat::Text), ("json", LogFormat::Json)];
}

macro_rules! impl_from_str {
    ($($ty:ty),*) => {$(
        impl std::str::FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                <$ty as Named>::parse_name(s)
            }
        }
    )*};
}

impl_from_str!(LogLevel, LogOutput, LogFormat);

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,

    /// Directory for log files when output includes a file
    pub log_dir: PathBuf,

    /// File name prefix; the appender adds `.<date>`
    pub log_file_prefix: String,

    /// Extra `EnvFilter` directives, comma separated
    pub filter_directives: Option<String>,

    /// Include file and line of each event
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "fac-pipeline".to_string(),
            filter_directives: None,
            include_location: false,
        }
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Apply `LOG_*` environment variables on top of this configuration
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`; unset names leave the value untouched
    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: Named>(name: &str, value: Option<String>) -> Result<Option<T>> {
            value
                .map(|v| T::parse_name(&v).with_context(|| format!("{} is invalid", name)))
                .transpose()
        }

        if let Some(level) = parsed("LOG_LEVEL", lookup("LOG_LEVEL"))? {
            self.level = level;
        }
        if let Some(output) = parsed("LOG_OUTPUT", lookup("LOG_OUTPUT"))? {
            self.output = output;
        }
        if let Some(format) = parsed("LOG_FORMAT", lookup("LOG_FORMAT"))? {
            self.format = format;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = lookup("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = lookup("LOG_FILTER").filter(|f| !f.trim().is_empty()) {
            self.filter_directives = Some(filter);
        }
        Ok(self)
    }

    /// Path the appender writes to for a given date (`YYYY-MM-DD`)
    pub fn log_file_for(&self, date: &str) -> PathBuf {
        self.log_dir.join(format!("{}.{}", self.log_file_prefix, date))
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.as_tracing().into());

        let extra: Vec<&str> = self
            .filter_directives
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .collect();

        for target in QUIET_TARGETS {
            let named = extra
                .iter()
                .any(|d| d.split('=').next() == Some(*target));
            if !named {
                filter = filter.add_directive(format!("{}=warn", target).parse()?);
            }
        }
        for directive in extra {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("invalid filter directive '{}'", directive))?,
            );
        }
        Ok(filter)
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn include_location(mut self, include: bool) -> Self {
        self.config.include_location = include;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the non-blocking file writer alive
///
/// Dropping it flushes buffered lines; do so before `process::exit`.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber; call once at startup
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = config.env_filter()?;

    let console_layer = config
        .output
        .console()
        .then(|| fmt_layer(config, std::io::stderr, true));

    let (file_layer, file_guard) = if config.output.file() {
        let (writer, guard) = file_writer(&config.log_dir, &config.log_file_prefix)?;
        (Some(fmt_layer(config, writer, false)), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("a tracing subscriber is already installed")?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

fn file_writer(
    dir: &Path,
    prefix: &str,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create log directory '{}'", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, prefix);
    Ok(tracing_appender::non_blocking(appender))
}

fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    // Span close events carry stage timings at debug and below
    let spans = if config.level <= LogLevel::Debug {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.level <= LogLevel::Debug)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(spans)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
