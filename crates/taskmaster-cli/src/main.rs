// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 Schwimmbeck Dominik

//! Taskmaster daemon binary entrypoint: parses the catalog, boots the
//! supervision engine, and exposes the REPL, line socket, and HTTP
//! control surfaces over it.

mod commands;
mod format;
mod http;
mod logging;
mod repl;
mod socket;

use anyhow::Context;
use clap::Parser;
use commands::CommandContext;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use taskmaster_core::signal::NixSignalPort;
use taskmaster_core::{SignalPort, Supervisor};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Taskmaster — launches, monitors, and restarts programs from a
/// declarative catalog.
#[derive(Parser)]
#[command(name = "taskmaster", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML program catalog.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Run without attaching the interactive REPL to stdin.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Positional alternative to `--config`.
    path: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("taskmaster: failed to start async runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("taskmaster: {e:?}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .or(cli.path)
        .unwrap_or_else(|| PathBuf::from("taskmaster.yaml"));

    let catalog = taskmaster_config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    logging::init(catalog.global.loglevel);
    for warning in &catalog.warnings {
        warn!(%warning, "program dropped from catalog at startup");
    }

    let signal_port: Arc<dyn SignalPort> = Arc::new(NixSignalPort);
    let supervisor = Arc::new(Supervisor::new(signal_port));
    supervisor.boot(catalog.programs).await;
    info!(config = %config_path.display(), "taskmaster booted");

    let shutdown = CancellationToken::new();
    let ctx = CommandContext {
        supervisor: supervisor.clone(),
        config_path: config_path.clone(),
        shutdown: shutdown.clone(),
    };

    let control_addr = SocketAddr::from(([127, 0, 0, 1], catalog.global.control_port));
    let http_addr = SocketAddr::from(([127, 0, 0, 1], catalog.global.http_port));

    let socket_task = tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if let Err(e) = socket::serve(control_addr, ctx).await {
                error!(error = %e, "control socket exited");
            }
        }
    });

    let http_task = tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if let Err(e) = http::serve(http_addr, ctx).await {
                error!(error = %e, "HTTP API exited");
            }
        }
    });

    let signal_task = tokio::spawn(daemon_signal_loop(ctx.clone()));

    if cli.daemon {
        shutdown.cancelled().await;
    } else {
        repl::run(ctx.clone()).await;
        shutdown.cancel();
    }

    socket_task.abort();
    http_task.abort();
    signal_task.abort();

    supervisor.shutdown().await;
    info!("taskmaster shut down cleanly");

    Ok(())
}

/// Daemon-level signal bindings: HUP reloads the catalog, TERM/INT
/// request a clean shutdown, USR1 dumps worker status to the log.
async fn daemon_signal_loop(ctx: CommandContext) {
    let Ok(mut hup) = signal(SignalKind::hangup()) else {
        error!("failed to install SIGHUP handler");
        return;
    };
    let Ok(mut term) = signal(SignalKind::terminate()) else {
        error!("failed to install SIGTERM handler");
        return;
    };
    let Ok(mut int) = signal(SignalKind::interrupt()) else {
        error!("failed to install SIGINT handler");
        return;
    };
    let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
        error!("failed to install SIGUSR1 handler");
        return;
    };

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            _ = hup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match taskmaster_config::load(&ctx.config_path) {
                    Ok(catalog) => {
                        for warning in &catalog.warnings {
                            warn!(%warning, "program dropped during reload");
                        }
                        ctx.supervisor.reload(catalog.programs).await;
                    }
                    Err(e) => error!(error = %e, "reload on SIGHUP failed"),
                }
            }
            _ = term.recv() => {
                info!("SIGTERM received, shutting down");
                ctx.shutdown.cancel();
            }
            _ = int.recv() => {
                info!("SIGINT received, shutting down");
                ctx.shutdown.cancel();
            }
            _ = usr1.recv() => {
                match ctx.supervisor.status(None).await {
                    Ok(statuses) => {
                        for program in statuses {
                            for worker in &program.workers {
                                info!("{}", format::format_status_line(&program.name, worker));
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "SIGUSR1 status dump failed"),
                }
            }
        }
    }
}
