use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_rolling_file::RollingFileAppenderBase;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{
    config::ConfigPrefix,
    error::{InjectError, Result},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level for every target.
    level: Level,
    /// `EnvFilter` directives, e.g. `beaver_inject=trace`; override `level`.
    filter: Option<String>,
    console: ConsoleAppenderConfig,
    file: Option<FileAppenderConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::default(),
            filter: None,
            console: ConsoleAppenderConfig::default(),
            file: None,
        }
    }
}

impl ConfigPrefix for LoggingConfig {
    const PREFIX: &'static str = "logging";
}

impl LoggingConfig {
    pub fn level(&self) -> Level {
        self.level
    }

    pub fn console(&self) -> &ConsoleAppenderConfig {
        &self.console
    }

    pub fn file(&self) -> Option<&FileAppenderConfig> {
        self.file.as_ref()
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives).map_err(|e| {
                InjectError::InvalidConfigValueError(format!(
                    "logging.filter={:?}: {}",
                    directives, e
                ))
            }),
            None => Ok(EnvFilter::default()
                .add_directive(self.level.as_tracing_level_filter().into())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleAppenderConfig {
    enable: bool,
    ansi: bool,
}

impl Default for ConsoleAppenderConfig {
    fn default() -> Self {
        Self {
            enable: true,
            ansi: true,
        }
    }
}

impl ConsoleAppenderConfig {
    pub fn enable(&self) -> bool {
        self.enable
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileAppenderConfig {
    #[serde(default = "enabled")]
    enable: bool,
    #[serde(deserialize_with = "crate::serde::non_empty")]
    file_path: String,
    #[serde(default = "default_max_count")]
    file_max_count: usize,
    #[serde(default = "default_max_size")]
    file_max_size: u64,
}

fn enabled() -> bool {
    true
}

fn default_max_count() -> usize {
    7
}

fn default_max_size() -> u64 {
    64 * 1024 * 1024
}

impl FileAppenderConfig {
    pub fn enable(&self) -> bool {
        self.enable
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn file_max_count(&self) -> usize {
        self.file_max_count
    }

    pub fn file_max_size(&self) -> u64 {
        self.file_max_size
    }
}

/// Keeps the non-blocking writers flushing; logging stops when dropped.
pub struct AppenderGuard {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<AppenderGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    if config.console.enable {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(config.console.ansi)
                .with_writer(writer)
                .with_filter(config.env_filter()?)
                .boxed(),
        );
        guards.push(guard);
    }
    if let Some(file) = config.file.as_ref().filter(|file| file.enable) {
        let appender = RollingFileAppenderBase::builder()
            .filename(file.file_path.clone())
            .max_filecount(file.file_max_count)
            .condition_max_file_size(file.file_max_size)
            .condition_daily()
            .build()
            .map_err(|e| InjectError::LogFileCreationError(e.to_string().into()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(config.env_filter()?)
                .boxed(),
        );
        guards.push(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| InjectError::TracingSubscriberInitError(e.to_string().into()))?;
    Ok(AppenderGuard { _guards: guards })
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Level {
    /// The "trace" level.
    Trace,
    /// The "debug" level.
    Debug,
    /// The "info" level.
    #[default]
    Info,
    /// The "warn" level.
    Warn,
    /// The "error" level.
    Error,
    /// Off level.
    Off,
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        const VARIANTS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| <D::Error as serde::de::Error>::unknown_variant(&s, &VARIANTS))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct ParseLevelError;

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("trace") => Ok(Level::Trace),
            s if s.eq_ignore_ascii_case("debug") => Ok(Level::Debug),
            s if s.eq_ignore_ascii_case("info") => Ok(Level::Info),
            s if s.eq_ignore_ascii_case("warn") => Ok(Level::Warn),
            s if s.eq_ignore_ascii_case("error") => Ok(Level::Error),
            s if s.eq_ignore_ascii_case("off") => Ok(Level::Off),
            _ => Err(ParseLevelError),
        }
    }
}

impl Level {
    pub fn as_tracing_level_filter(&self) -> tracing::level_filters::LevelFilter {
        match self {
            Level::Trace => tracing::level_filters::LevelFilter::TRACE,
            Level::Debug => tracing::level_filters::LevelFilter::DEBUG,
            Level::Info => tracing::level_filters::LevelFilter::INFO,
            Level::Warn => tracing::level_filters::LevelFilter::WARN,
            Level::Error => tracing::level_filters::LevelFilter::ERROR,
            Level::Off => tracing::level_filters::LevelFilter::OFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};
    use rstest::rstest;

    use super::*;
    use crate::config::Config;

    fn logging_of(toml: &str) -> std::result::Result<LoggingConfig, config::ConfigError> {
        Config::new(
            config::Config::builder()
                .add_source(File::from_str(toml, FileFormat::Toml))
                .build()?,
        )
        .get::<LoggingConfig>()
    }

    #[rstest]
    #[case("trace", Level::Trace)]
    #[case("DEBUG", Level::Debug)]
    #[case("Info", Level::Info)]
    #[case("warn", Level::Warn)]
    #[case("error", Level::Error)]
    #[case("off", Level::Off)]
    fn levels_parse_case_insensitively(#[case] input: &str, #[case] expected: Level) {
        assert_eq!(input.parse::<Level>().unwrap(), expected);
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert!("verbose".parse::<Level>().is_err());
        assert!(logging_of("[logging]\nlevel = \"verbose\"").is_err());
    }

    #[rstest]
    #[case(Level::Trace, tracing::level_filters::LevelFilter::TRACE)]
    #[case(Level::Off, tracing::level_filters::LevelFilter::OFF)]
    fn levels_map_to_tracing_filters(
        #[case] level: Level,
        #[case] expected: tracing::level_filters::LevelFilter,
    ) {
        assert_eq!(level.as_tracing_level_filter(), expected);
    }

    #[test]
    fn defaults_log_info_to_the_console_only() {
        let logging = logging_of("").unwrap();
        assert_eq!(logging.level(), Level::Info);
        assert!(logging.console().enable());
        assert!(logging.file().is_none());
        assert!(logging.env_filter().is_ok());
    }

    #[rstest]
    #[case("", tracing::level_filters::LevelFilter::INFO)]
    #[case("[logging]\nlevel = \"debug\"", tracing::level_filters::LevelFilter::DEBUG)]
    #[case("[logging]\nlevel = \"off\"", tracing::level_filters::LevelFilter::OFF)]
    #[case(
        "[logging]\nlevel = \"error\"\nfilter = \"beaver_inject=trace\"",
        tracing::level_filters::LevelFilter::TRACE
    )]
    fn filter_follows_the_configured_level(
        #[case] toml: &str,
        #[case] expected: tracing::level_filters::LevelFilter,
    ) {
        let filter = logging_of(toml).unwrap().env_filter().unwrap();
        assert_eq!(filter.max_level_hint(), Some(expected));
    }

    #[test]
    fn file_appender_is_read_with_defaults() {
        let logging = logging_of(
            "[logging]\nlevel = \"debug\"\n[logging.file]\nfile_path = \"logs/beaver.log\"",
        )
        .unwrap();
        let file = logging.file().unwrap();
        assert!(file.enable());
        assert_eq!(file.file_path(), "logs/beaver.log");
        assert_eq!(file.file_max_count(), 7);
        assert_eq!(file.file_max_size(), 64 * 1024 * 1024);
    }

    #[test]
    fn blank_file_path_is_rejected() {
        assert!(logging_of("[logging.file]\nfile_path = \"  \"").is_err());
    }

    #[test]
    fn malformed_filter_is_an_invalid_config_value() {
        let logging = logging_of("[logging]\nfilter = \"beaver_inject=loud\"").unwrap();
        assert!(matches!(
            logging.env_filter(),
            Err(InjectError::InvalidConfigValueError(_))
        ));
    }
}
