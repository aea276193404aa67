//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Disable the WebSocket protocol server
    #[arg(long)]
    pub no_websocket: bool,

    /// Disable the QUIC protocol server
    #[arg(long)]
    pub no_quic: bool,

    /// CA certificate used to verify edge nodes
    #[arg(long, value_name = "PATH")]
    pub ca: Option<PathBuf>,

    /// Server certificate chain
    #[arg(long, value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// Server private key
    #[arg(long, value_name = "PATH")]
    pub key: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the hub until interrupted (default)
    Serve,
    /// Print the effective configuration as TOML and exit
    ShowConfig,
}

impl Cli {
    /// The command to run, `serve` when none was given
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Serve)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_is_the_default_command() {
        let cli = Cli::parse_from(["cloudhub"]);
        assert_eq!(cli.command(), Commands::Serve);
        assert!(!cli.no_websocket);

        let cli = Cli::parse_from(["cloudhub", "--no-quic", "-v", "show-config"]);
        assert_eq!(cli.command(), Commands::ShowConfig);
        assert!(cli.no_quic);
        assert!(cli.verbose);
    }

    #[test]
    fn test_credential_flags() {
        let cli = Cli::parse_from(["cloudhub", "--ca", "/tmp/ca.pem", "--key", "/tmp/key.pem"]);
        assert_eq!(cli.ca, Some(PathBuf::from("/tmp/ca.pem")));
        assert_eq!(cli.cert, None);
        assert_eq!(cli.key, Some(PathBuf::from("/tmp/key.pem")));
    }
}
