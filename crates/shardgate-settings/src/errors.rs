//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to serialize defaults.
    #[error("failed to encode settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Layer merge or extraction failed (bad JSON, wrong types).
    #[error("failed to load settings: {0}")]
    Figment(Box<figment::Error>),
    /// A value was outside its allowed range.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

impl From<figment::Error> for SettingsError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
