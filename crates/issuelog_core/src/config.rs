//! Client configuration.
//!
//! # Responsibility
//! - Describe where the database lives and how sessions, topics and logging
//!   behave.
//! - Load settings from TOML with every section defaulted.
//!
//! # Invariants
//! - A validated config has non-zero intervals and buffers and non-empty
//!   topic, producer and consumer names.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STATUS_TOPIC: &str = "task_status";
pub const DEFAULT_STATUS_PRODUCER_ID: &str = "producer-task-status";
pub const DEFAULT_STATUS_CONSUMER: &str = "email";
pub const DEFAULT_CHANGEFEED_TOPIC: &str = "issues/updates";
pub const DEFAULT_CHANGEFEED_CONSUMER: &str = "test";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config file: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse(value)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub database: DatabaseConfig,
    pub topics: TopicConfig,
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path cannot be empty".to_string()));
        }
        self.topics.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Default settings for the database file at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("issuelog.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Delay between polls while a reader waits for new messages.
    pub poll_interval_ms: u64,
    /// Back-off before a worker retries after a failed read or handler.
    pub retry_delay_ms: u64,
    /// Writes buffered before the writer flushes on its own.
    pub writer_max_buffered: usize,
    pub status_topic: String,
    pub status_producer_id: String,
    pub status_consumer: String,
    pub changefeed_topic: String,
    pub changefeed_consumer: String,
}

impl TopicConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "topics.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.retry_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "topics.retry_delay_ms must be positive".to_string(),
            ));
        }
        if self.writer_max_buffered == 0 {
            return Err(ConfigError::Invalid(
                "topics.writer_max_buffered must be positive".to_string(),
            ));
        }
        for (key, value) in [
            ("status_topic", &self.status_topic),
            ("status_producer_id", &self.status_producer_id),
            ("status_consumer", &self.status_consumer),
            ("changefeed_topic", &self.changefeed_topic),
            ("changefeed_consumer", &self.changefeed_consumer),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("topics.{key} cannot be empty")));
            }
        }
        Ok(())
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            retry_delay_ms: 200,
            writer_max_buffered: 16,
            status_topic: DEFAULT_STATUS_TOPIC.to_string(),
            status_producer_id: DEFAULT_STATUS_PRODUCER_ID.to_string(),
            status_consumer: DEFAULT_STATUS_CONSUMER.to_string(),
            changefeed_topic: DEFAULT_CHANGEFEED_TOPIC.to_string(),
            changefeed_consumer: DEFAULT_CHANGEFEED_CONSUMER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute directory for rolling log files; stderr when absent.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientConfig, ConfigError, DEFAULT_STATUS_TOPIC};
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.topics.status_topic, DEFAULT_STATUS_TOPIC);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            [database]
            path = "/var/lib/issuelog/issues.db"

            [topics]
            poll_interval_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(
            config.database.path,
            PathBuf::from("/var/lib/issuelog/issues.db")
        );
        assert_eq!(config.database.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.topics.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.topics.writer_max_buffered, 16);
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let err = ClientConfig::from_toml_str("[topics]\nwriter_max_buffered = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("writer_max_buffered")));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = ClientConfig::from_toml_str("[database\npath = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
