//! One pass over every running container.
//!
//! Containers are handled strictly one at a time.  Our own container is
//! checked like any other but never recreated: an available update only
//! marks the context, and the restart happens after the report has been
//! delivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Local;
use log::{debug, error, info};

use crate::config::is_truthy;
use crate::detector;
use crate::identity;
use crate::recreate;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::scheduler::Cycle;
use crate::types::{
    CheckOutcome, Container, ContainerReport, ContainerStatus, CycleReport, PruneStats,
};
use crate::webhook::ReportSink;

const SELF_STOP_GRACE: Duration = Duration::from_secs(10);
const LOG_FLUSH_DELAY: Duration = Duration::from_secs(1);
const BANNER: &str = "============================================================";

/// State carried from one cycle to the next.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub hostname: String,
    /// Our own container name, resolved once at startup.
    pub self_name: Option<String>,
    pub disable_label: String,
    /// Set when our own image has an update; cleared at cycle start.
    pub self_update_pending: bool,
    /// The container to stop once the report is out.
    pub self_container: Option<String>,
}

impl CycleContext {
    pub fn new(hostname: String, self_name: Option<String>, disable_label: String) -> Self {
        Self {
            hostname,
            self_name,
            disable_label,
            self_update_pending: false,
            self_container: None,
        }
    }

    fn is_disabled(&self, container: &Container) -> bool {
        container
            .labels()
            .get(&self.disable_label)
            .is_some_and(|v| is_truthy(v))
    }
}

fn record(report: &mut CycleReport, entry: ContainerReport, checked: bool) {
    debug!("{}: {}", entry.name, entry.status.as_str());
    if checked {
        report.containers_checked += 1;
    }
    match entry.status {
        ContainerStatus::Updated => report.containers_updated += 1,
        ContainerStatus::Skipped => report.containers_skipped += 1,
        ContainerStatus::Error => report.containers_failed += 1,
        ContainerStatus::UpToDate | ContainerStatus::PendingRestart => {}
    }
    report.container_reports.push(entry);
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    sink: Arc<dyn ReportSink>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, sink: Arc<dyn ReportSink>) -> Self {
        Self { runtime, sink }
    }

    /// Run a full cycle: check, update, clean up, report, then restart
    /// ourselves if our own image changed.
    pub async fn run_cycle(&self, ctx: &mut CycleContext) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            ctx.hostname.as_str(),
        );

        info!("{}", BANNER);
        info!("Starting update cycle...");
        info!("{}", BANNER);

        ctx.self_update_pending = false;
        ctx.self_container = None;

        if let Err(e) = self.process_containers(ctx, &mut report).await {
            let message = format!("Docker API error during update cycle: {}", e);
            error!("{}", message);
            report.errors.push(message);
        }

        report.duration_seconds = started.elapsed().as_secs_f64();
        self.sink.deliver(&report).await;

        if ctx.self_update_pending {
            self.restart_self(ctx).await;
        }
        report
    }

    async fn process_containers(
        &self,
        ctx: &mut CycleContext,
        report: &mut CycleReport,
    ) -> Result<(), RuntimeError> {
        let containers = self.runtime.list_running().await?;
        if containers.is_empty() {
            info!("No running containers found");
            return Ok(());
        }
        info!("Found {} running container(s)", containers.len());

        for container in &containers {
            if identity::is_self(container, ctx.self_name.as_deref(), &ctx.hostname) {
                self.check_self(ctx, container, report).await;
            } else {
                self.check_container(ctx, container, report).await;
            }
        }

        let stats = self.cleanup_images().await;
        report.images_cleaned = stats.images_deleted;
        report.space_reclaimed_mb = bytes_to_mb(stats.space_reclaimed);

        info!("{}", BANNER);
        let updated: Vec<&str> = report
            .with_status(ContainerStatus::Updated)
            .map(|c| c.name.as_str())
            .collect();
        if updated.is_empty() {
            info!("Update cycle complete. No containers were updated.");
        } else {
            info!("Update cycle complete. Updated containers: {}", updated.join(", "));
        }

        if ctx.self_update_pending {
            info!("Self-update pending - performing self-restart after reporting...");
            report.containers_updated += 1;
        }
        info!("{}", BANNER);
        Ok(())
    }

    async fn image_name(&self, container: &Container) -> Option<String> {
        detector::tagged_reference(self.runtime.as_ref(), container).await
    }

    async fn check_container(
        &self,
        ctx: &CycleContext,
        container: &Container,
        report: &mut CycleReport,
    ) {
        let reference = self.image_name(container).await;
        let image = reference.as_deref().unwrap_or("unknown");
        let name = container.name.as_str();

        if ctx.is_disabled(container) {
            info!("Skipping container (disabled by label): {}", name);
            let entry = ContainerReport::new(name, image, ContainerStatus::Skipped, "disabled by label");
            record(report, entry, true);
            return;
        }

        info!("Checking container: {}", name);
        let entry = match detector::check_for_update(self.runtime.as_ref(), container).await {
            CheckOutcome::UpdateAvailable => {
                if recreate::recreate(self.runtime.as_ref(), container, reference.as_deref()).await {
                    ContainerReport::new(name, image, ContainerStatus::Updated, "successfully updated")
                } else {
                    ContainerReport::new(
                        name,
                        image,
                        ContainerStatus::Error,
                        "failed to recreate container",
                    )
                }
            }
            CheckOutcome::UpToDate => ContainerReport::new(name, image, ContainerStatus::UpToDate, ""),
            CheckOutcome::Skipped(reason) => {
                ContainerReport::new(name, image, ContainerStatus::Skipped, reason.to_string())
            }
            CheckOutcome::Error(cause) => ContainerReport::new(
                name,
                image,
                ContainerStatus::Error,
                format!("error checking for updates: {}", cause),
            ),
        };
        record(report, entry, true);
    }

    async fn check_self(&self, ctx: &mut CycleContext, container: &Container, report: &mut CycleReport) {
        let image = self.image_name(container).await.unwrap_or_else(|| "unknown".to_string());
        let name = container.name.as_str();
        info!("Checking self-container: {}", name);

        let (entry, checked) = match detector::check_for_update(self.runtime.as_ref(), container).await {
            CheckOutcome::UpdateAvailable => {
                info!(
                    "Self-update available for {} - will restart after cycle completes",
                    name
                );
                ctx.self_update_pending = true;
                ctx.self_container = Some(container.name.clone());
                let entry = ContainerReport::new(
                    name,
                    image,
                    ContainerStatus::PendingRestart,
                    "self-update: restart required",
                );
                (entry, true)
            }
            CheckOutcome::UpToDate => {
                (ContainerReport::new(name, image, ContainerStatus::UpToDate, "(self)"), true)
            }
            CheckOutcome::Skipped(reason) => {
                let entry = ContainerReport::new(
                    name,
                    image,
                    ContainerStatus::Skipped,
                    format!("{} (self)", reason),
                );
                (entry, false)
            }
            CheckOutcome::Error(cause) => {
                let entry = ContainerReport::new(
                    name,
                    image,
                    ContainerStatus::Error,
                    format!("error checking for updates (self): {}", cause),
                );
                (entry, false)
            }
        };
        record(report, entry, checked);
    }

    /// Prune dangling images, then every unused image.
    async fn cleanup_images(&self) -> PruneStats {
        info!("Cleaning up unused images...");
        let mut total = PruneStats::default();

        for (dangling_only, kind) in [(true, "dangling"), (false, "unused")] {
            match self.runtime.prune_images(dangling_only).await {
                Ok(stats) => {
                    if stats.images_deleted > 0 {
                        info!(
                            "Removed {} {} images, reclaimed {:.2} MB",
                            stats.images_deleted,
                            kind,
                            bytes_to_mb(stats.space_reclaimed)
                        );
                    }
                    total.images_deleted += stats.images_deleted;
                    total.space_reclaimed += stats.space_reclaimed;
                }
                Err(e) => {
                    error!("Failed to cleanup images: {}", e);
                    return total;
                }
            }
        }

        if total.images_deleted == 0 {
            info!("No unused images to remove");
        }
        total
    }

    /// Stop our own container and let its restart policy bring it back on
    /// the new image.
    async fn restart_self(&self, ctx: &CycleContext) {
        let Some(name) = ctx.self_container.as_deref().or(ctx.self_name.as_deref()) else {
            error!("Cannot perform self-restart: own container name unknown");
            return;
        };

        let container = match self.runtime.inspect_container(name).await {
            Ok(c) => c,
            Err(e) => {
                error!("Self-restart failed: container '{}': {}", name, e);
                return;
            }
        };

        info!("{}", BANNER);
        info!("SELF-UPDATE: Restarting with new image...");
        info!("Container will be restarted by Docker's restart policy");
        info!("{}", BANNER);

        tokio::time::sleep(LOG_FLUSH_DELAY).await;

        if let Err(e) = self.runtime.stop_container(&container.id, SELF_STOP_GRACE).await {
            error!("Self-restart failed: {}", e);
        }
    }
}

/// An [`Orchestrator`] bundled with its context, as driven by the scheduler.
pub struct UpdateCycle {
    orchestrator: Orchestrator,
    context: CycleContext,
}

impl UpdateCycle {
    pub fn new(orchestrator: Orchestrator, context: CycleContext) -> Self {
        Self {
            orchestrator,
            context,
        }
    }
}

#[async_trait]
impl Cycle for UpdateCycle {
    async fn run(&mut self) -> anyhow::Result<()> {
        self.orchestrator.run_cycle(&mut self.context).await;
        Ok(())
    }
}
