//! Docker Image Watch entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use env_logger::Env;
use log::{error, info};
use tokio::signal;

mod classifier;
mod config;
mod cycle;
mod detector;
mod identity;
mod recreate;
mod report;
mod runtime;
mod scheduler;
mod types;
mod webhook;

use config::Config;
use cycle::{CycleContext, Orchestrator, UpdateCycle};
use runtime::{ContainerRuntime, DockerRuntime};
use scheduler::{Schedule, Scheduler};
use webhook::WebhookNotifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cfg = Config::load()?;
    let webhook = cfg.webhook();
    info!("Docker Image Watch - Starting");
    info!("Update schedule: {}", cfg.update_schedule);
    info!("Run on startup: {}", cfg.run_on_startup);
    if webhook.enabled() {
        info!(
            "Webhook notifications: enabled (format: {})",
            webhook.effective_format().as_str()
        );
    } else {
        info!("Webhook notifications: disabled");
    }

    let schedule = Schedule::parse_or_default(&cfg.update_schedule);

    // Without a reachable daemon there is nothing to watch.
    let runtime: Arc<dyn ContainerRuntime> = match DockerRuntime::connect().await {
        Ok(docker) => Arc::new(docker),
        Err(e) => {
            error!("Failed to connect to Docker: {:#}", e);
            return Err(e);
        }
    };

    let hostname = cfg.host_identity();
    let self_name =
        identity::resolve_self(runtime.as_ref(), &hostname, cfg.container_name.as_deref()).await;

    let notifier = Arc::new(WebhookNotifier::new(webhook)?);
    let orchestrator = Orchestrator::new(runtime, notifier);
    let context = CycleContext::new(hostname, self_name, cfg.disable_label.clone());
    let mut cycle = UpdateCycle::new(orchestrator, context);

    let running = Arc::new(AtomicBool::new(true));
    let signal_flag = Arc::clone(&running);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown requested, finishing current work...");
        signal_flag.store(false, Ordering::SeqCst);
    });

    Scheduler::new(schedule, cfg.run_on_startup, running)
        .run(&mut cycle)
        .await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Unable to listen for SIGTERM: {}", e);
            if let Err(e) = signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {}", e);
            }
            return;
        }
    };
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {}", e);
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
}
