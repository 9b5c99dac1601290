//! Configuration errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sources could not be read or merged
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config_crate::ConfigError),

    /// A value is out of its accepted range
    #[error("Invalid configuration: {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    /// A path contains an unresolvable variable
    #[error("Failed to expand {key}: {message}")]
    Expand { key: &'static str, message: String },

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
