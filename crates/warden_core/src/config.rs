//! Kernel options.
//!
//! # Responsibility
//! - Describe the knobs a host sets when building a registry.
//! - Parse those knobs from JSON; component registrations are not config.
//!
//! # Invariants
//! - Every field has a default, so `{}` is a complete document.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Tie-break among several valid handlers for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Latest registration wins.
    #[default]
    MostRecent,
    /// Earliest registration wins.
    FirstRegistered,
}

impl SelectionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MostRecent => "most_recent",
            Self::FirstRegistered => "first_registered",
        }
    }
}

/// Logger bootstrap options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute directory for rotating log files; stderr when absent.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub selection: SelectionPolicy,
    pub logging: LoggingConfig,
}

impl KernelConfig {
    /// Parses kernel options from a JSON document.
    ///
    /// # Errors
    /// - `ConfigError::Parse` for malformed JSON or unknown enum values.
    /// - `ConfigError::Invalid` for an empty log level.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "logging.level",
                message: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(message) => write!(f, "invalid kernel config: {message}"),
            Self::Invalid { field, message } => {
                write!(f, "invalid kernel config field `{field}`: {message}")
            }
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::{ConfigError, KernelConfig, SelectionPolicy};
    use std::path::PathBuf;

    #[test]
    fn empty_document_uses_defaults() {
        let config = KernelConfig::from_json_str("{}").expect("empty config parses");
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.selection, SelectionPolicy::MostRecent);
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn fields_parse_from_snake_case() {
        let config = KernelConfig::from_json_str(
            r#"{"selection":"first_registered","logging":{"level":"warn","log_dir":"/var/log/warden"}}"#,
        )
        .expect("config parses");
        assert_eq!(config.selection, SelectionPolicy::FirstRegistered);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/var/log/warden")));
    }

    #[test]
    fn unknown_policy_and_blank_level_are_rejected() {
        let parse = KernelConfig::from_json_str(r#"{"selection":"random"}"#)
            .expect_err("unknown policy");
        assert!(matches!(parse, ConfigError::Parse(_)));

        let invalid = KernelConfig::from_json_str(r#"{"logging":{"level":"  "}}"#)
            .expect_err("blank level");
        assert!(invalid.to_string().contains("logging.level"));
    }
}
