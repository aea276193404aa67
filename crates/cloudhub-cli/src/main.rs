//! CloudHub - edge hub entry point

use std::io::IsTerminal;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use cloudhub_cli::{
    app::HubApp,
    cli::{Cli, Commands},
    config::{load_configuration, render_config},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if cli.command() == Commands::ShowConfig {
        println!("{}", render_config(&config)?);
        return Ok(());
    }

    // Credentials must be loadable before any listener is bound
    let app = match HubApp::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to start CloudHub: {}", e);
            std::process::exit(1);
        }
    };

    let report = app
        .run(shutdown_signal())
        .await
        .context("CloudHub failed")?;

    if report.aborted_tasks > 0 {
        warn!("{} tasks were aborted during shutdown", report.aborted_tasks);
    }
    if report.unfinished_sessions > 0 {
        warn!(
            "{} sessions were still closing at exit",
            report.unfinished_sessions
        );
    }
    info!(
        "CloudHub exited with {} undelivered envelopes across {} nodes",
        report.total_undelivered(),
        report.undelivered.len()
    );
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Resolve on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
