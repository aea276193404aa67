//! CloudHub CLI Configuration Management
//!
//! The effective [`HubConfig`] is layered with this priority order:
//! 1. Command line flags (highest priority)
//! 2. Configuration file (TOML)
//! 3. Default values (lowest priority)
//!
//! Every configuration struct deserializes with defaults, so a file only
//! names the values it changes.

use std::path::Path;

use cloudhub_core::HubConfig;
use tracing::info;

use crate::cli::Cli;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

/// Build the effective configuration for this invocation
pub fn load_configuration(cli: &Cli) -> Result<HubConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_from_file(path)?
        }
        None => {
            info!("Using default configuration");
            HubConfig::default()
        }
    };

    apply_overrides(&mut config, cli);
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific file path
pub fn load_from_file(path: &Path) -> Result<HubConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::ConfigFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text)
}

/// Parse a TOML configuration document
pub fn parse_config(text: &str) -> Result<HubConfig> {
    Ok(toml::from_str(text)?)
}

/// Apply command line flags on top of the loaded configuration
pub fn apply_overrides(config: &mut HubConfig, cli: &Cli) {
    if cli.no_websocket {
        config.websocket.enabled = false;
    }
    if cli.no_quic {
        config.quic.enabled = false;
    }
    if let Some(ca) = &cli.ca {
        config.credentials.ca = Some(ca.clone());
    }
    if let Some(cert) = &cli.cert {
        config.credentials.cert = Some(cert.clone());
    }
    if let Some(key) = &cli.key {
        config.credentials.key = Some(key.clone());
    }
}

/// Render a configuration as TOML
pub fn render_config(config: &HubConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
