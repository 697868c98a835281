mod cli;
mod commands;
mod config;
mod embedding;
mod error;
mod gateway;
mod model;
mod util;

#[cfg(test)]
mod test_support;

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::{Cli, Commands};
use crate::commands::sync::RunOutcome;

const EXIT_FATAL: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.command.verbose(), cli.log_file.as_deref()) {
        eprintln!("error: {err:#}");
        std::process::exit(EXIT_FATAL);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match run(cli, cancel).await {
        Ok(RunOutcome::Completed) => {}
        Ok(RunOutcome::Cancelled) => {
            warn!("interrupted by user");
            std::process::exit(EXIT_CANCELLED);
        }
        Err(err) => {
            error!(error = %err, "command failed");
            for cause in err.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            std::process::exit(EXIT_FATAL);
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<RunOutcome> {
    match cli.command {
        Commands::Sync(args) => commands::sync::run(args, cancel).await,
        Commands::Status(args) => {
            commands::status::run(args).await?;
            Ok(RunOutcome::Completed)
        }
    }
}

fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(util::open_append(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    warn!("shutdown requested; finishing the current step");
    cancel.cancel();
}
