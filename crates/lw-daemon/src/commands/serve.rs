//! Serve command: run the hub and both supervisors until interrupted

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use loopwatch_core::config::LwConfig;
use loopwatch_core::launcher::{ProcessLauncher, WorkerLauncher};
use loopwatch_core::task_context::{CommandTaskSource, NoTaskContext, TaskContextSource};
use loopwatch_core::{BroadcastHub, ConversationSupervisor, StartOptions, WorkerSupervisor};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::Bridge;

/// Run the observer hub
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address for WebSocket observers (overrides `hub.bind`)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Worker executable (overrides `worker.command`)
    #[arg(long, value_name = "CMD")]
    pub worker_command: Option<String>,

    /// Start the worker immediately instead of waiting for an observer
    #[arg(long)]
    pub autostart: bool,

    /// Pass `--watch` to the autostarted worker
    #[arg(long, requires = "autostart")]
    pub watch: bool,

    /// Iteration limit for the autostarted worker
    #[arg(
        long,
        value_name = "N",
        requires = "autostart",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub iterations: Option<u32>,
}

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: LwConfig) -> Result<()> {
    info!("loopwatch daemon starting...");

    let launcher: Arc<dyn WorkerLauncher> = Arc::new(ProcessLauncher);
    let tasks: Arc<dyn TaskContextSource> = if config.tasks.enabled {
        info!(command = %config.tasks.command, "task context enabled");
        Arc::new(CommandTaskSource::new(&config.tasks))
    } else {
        Arc::new(NoTaskContext)
    };

    let worker = WorkerSupervisor::new(config.worker.clone(), Arc::clone(&launcher));
    let chat = ConversationSupervisor::new(config.conversation.clone(), launcher, tasks);
    let hub = BroadcastHub::new(&config.hub);

    let listener = TcpListener::bind(&config.hub.bind)
        .await
        .with_context(|| format!("Failed to bind observer hub on {}", config.hub.bind))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let hub_cancel = CancellationToken::new();
    let server = tokio::spawn(Arc::clone(&hub).serve(listener, hub_cancel.clone()));

    let commands = hub
        .inbound()
        .context("Observer command channel already taken")?;
    let bridge_cancel = CancellationToken::new();
    let bridge_task = Bridge::new(worker.clone(), chat.clone(), Arc::clone(&hub))
        .spawn(commands, bridge_cancel.clone());

    if args.autostart {
        let options = StartOptions {
            watch: args.watch,
            iterations: args.iterations,
        };
        match worker.start(options).await {
            Ok(()) => info!(command = %config.worker.command, "worker autostarted"),
            Err(e) => warn!(error = %e, "worker autostart failed"),
        }
    }

    shutdown.cancelled().await;
    info!("shutting down");

    if let Err(e) = worker.shutdown().await {
        warn!(error = %e, "worker shutdown failed");
    }
    if chat.cancel() {
        info!("cancelled in-flight chat message");
    }

    bridge_cancel.cancel();
    if let Err(e) = bridge_task.await {
        warn!(error = %e, "bridge task failed");
    }

    hub_cancel.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "observer hub stopped with an error"),
        Err(e) => warn!(error = %e, "observer hub task failed"),
    }

    info!("loopwatch daemon shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler; only Ctrl+C stops the daemon");
                    if let Err(e) = ctrl_c.await {
                        warn!(error = %e, "failed to listen for Ctrl+C");
                        return;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            match ctrl_c.await {
                Ok(()) => info!("Received Ctrl+C"),
                Err(e) => {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                    return;
                }
            }
        }

        cancel.cancel();
    });
}
