//! Machine configuration errors

use thiserror::Error;

/// Loading, saving or checking a machine configuration failed
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Reading the configuration file failed
    #[error("Cannot read machine configuration {0}")]
    LoadError(String),

    /// Writing the configuration file failed
    #[error("Cannot write machine configuration {0}")]
    SaveError(String),

    /// Two settings contradict each other
    #[error("Setting '{key}' rejected: {reason}")]
    InvalidSetting { key: String, reason: String },

    /// No usable configuration directory
    #[error("Configuration directory unavailable: {0}")]
    ConfigDirectory(String),

    #[error("Malformed JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed TOML configuration: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Cannot encode configuration as TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A single value is unusable
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Only `.toml` and `.json` files are understood
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("'{key}' out of range: {value}")]
    ValueOutOfRange { key: String, value: String },

    /// An instruction the machine must be able to send is blank
    #[error("'{0}' needs an instruction")]
    EmptyInstruction(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_setting() {
        let err = ConfigError::ValueOutOfRange {
            key: "protocol.max_buffer_size".to_string(),
            value: "4".to_string(),
        };
        assert_eq!(err.to_string(), "'protocol.max_buffer_size' out of range: 4");

        let err: SettingsError =
            ConfigError::EmptyInstruction("protocol.temperature_query".to_string()).into();
        assert_eq!(
            err.to_string(),
            "'protocol.temperature_query' needs an instruction"
        );
    }

    #[test]
    fn test_parse_errors_convert() {
        let err: SettingsError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(err, SettingsError::JsonError(_)));
        assert!(err.to_string().starts_with("Malformed JSON configuration"));
    }
}
