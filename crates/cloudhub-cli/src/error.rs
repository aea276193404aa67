//! Error handling for the CloudHub CLI

use std::path::PathBuf;

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("CloudHub error: {0}")]
    Hub(#[from] cloudhub_core::HubError),

    #[error("Configuration error: {0}")]
    Config(#[from] cloudhub_core::ConfigError),

    #[error("Failed to read configuration file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("At least one transport must be enabled")]
    NoTransports,
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
