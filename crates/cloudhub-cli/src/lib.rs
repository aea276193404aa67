//! CloudHub CLI library
//!
//! Argument parsing, configuration loading and hub assembly for the
//! `cloudhub` binary.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;

pub use app::HubApp;
pub use cli::{Cli, Commands};
pub use error::{CliError, Result};
