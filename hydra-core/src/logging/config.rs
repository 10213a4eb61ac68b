//! Logging configuration.

use std::env;
use std::io::IsTerminal;
use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for structured logging.
    Json,
    /// Human-readable pretty format with colors.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::default(),
        })
    }
}

/// Configuration for the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    log_format: LogFormat,
    log_filter: String,
    include_location: bool,
    include_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info".to_string(),
            include_location: false,
            include_thread_names: false,
        }
    }
}

impl LoggingConfig {
    /// Create a new builder.
    pub fn builder() -> LoggingConfigBuilder {
        LoggingConfigBuilder::default()
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HYDRA_LOG_FORMAT`: "json", "pretty", or "compact"
    /// - `HYDRA_LOG_LEVEL` or `RUST_LOG`: Log filter string
    /// - `HYDRA_LOG_LOCATION`: "true" to include file and line
    /// - `HYDRA_LOG_THREAD_NAMES`: "true" to include thread names
    ///
    /// Without `HYDRA_LOG_FORMAT`, terminals get the pretty format and
    /// everything else JSON.
    pub fn from_env() -> Self {
        let default_format = if std::io::stdout().is_terminal() {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        };
        Self::from_lookup(default_format, |name| env::var(name).ok())
    }

    /// Create configuration from variables resolved by `lookup`, using
    /// `default_format` when no format is set.
    pub fn from_lookup(
        default_format: LogFormat,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let flag = |name: &str| {
            lookup(name)
                .map(|s| s.eq_ignore_ascii_case("true") || s == "1")
                .unwrap_or(false)
        };

        Self {
            log_format: lookup("HYDRA_LOG_FORMAT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(default_format),
            log_filter: lookup("HYDRA_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),
            include_location: flag("HYDRA_LOG_LOCATION"),
            include_thread_names: flag("HYDRA_LOG_THREAD_NAMES"),
        }
    }

    /// Get the log format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Get the log filter.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Check if source location should be included.
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /// Check if thread names should be included.
    pub fn include_thread_names(&self) -> bool {
        self.include_thread_names
    }
}

/// Builder for LoggingConfig.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfigBuilder {
    log_format: Option<LogFormat>,
    log_filter: Option<String>,
    include_location: Option<bool>,
    include_thread_names: Option<bool>,
}

impl LoggingConfigBuilder {
    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Set the log filter.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Include source location in logs.
    pub fn include_location(mut self, include: bool) -> Self {
        self.include_location = Some(include);
        self
    }

    /// Include thread names in logs.
    pub fn include_thread_names(mut self, include: bool) -> Self {
        self.include_thread_names = Some(include);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> LoggingConfig {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            log_format: self.log_format.unwrap_or(defaults.log_format),
            log_filter: self.log_filter.unwrap_or(defaults.log_filter),
            include_location: self.include_location.unwrap_or(defaults.include_location),
            include_thread_names: self
                .include_thread_names
                .unwrap_or(defaults.include_thread_names),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn from_lookup_reads_hydra_variables() {
        let config = LoggingConfig::from_lookup(
            LogFormat::Pretty,
            lookup(&[
                ("HYDRA_LOG_FORMAT", "json"),
                ("HYDRA_LOG_LEVEL", "hydra_automaton=debug"),
                ("RUST_LOG", "trace"),
                ("HYDRA_LOG_LOCATION", "1"),
                ("HYDRA_LOG_THREAD_NAMES", "TRUE"),
            ]),
        );

        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.log_filter(), "hydra_automaton=debug");
        assert!(config.include_location());
        assert!(config.include_thread_names());
    }

    #[test]
    fn from_lookup_falls_back() {
        let config = LoggingConfig::from_lookup(LogFormat::Pretty, lookup(&[("RUST_LOG", "warn")]));
        assert_eq!(config.log_format(), LogFormat::Pretty);
        assert_eq!(config.log_filter(), "warn");
        assert!(!config.include_location());

        let config = LoggingConfig::from_lookup(LogFormat::Json, lookup(&[]));
        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("other".parse::<LogFormat>().unwrap(), LogFormat::Compact);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = LoggingConfig::builder()
            .log_format(LogFormat::Json)
            .log_filter("debug,hydra_automaton=trace")
            .include_location(true)
            .build();

        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.log_filter(), "debug,hydra_automaton=trace");
        assert!(config.include_location());
        assert!(!config.include_thread_names());
    }
}
