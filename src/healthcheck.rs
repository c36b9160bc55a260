//! Health check loop for proxy instances
//!
//! Periodically asks every known instance for `/health` and stores the result.
//! An instance that reports `loading` has just started with no configuration;
//! it gets the current one pushed and is reloaded on its own.

use crate::api::BroadcastReport;
use crate::customconf::CustomConfigTree;
use crate::model::{Instance, InstanceStatus};
use crate::scheduler::reload_timeout;
use crate::ControlContext;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between rounds
    pub interval: Duration,
    /// Renderer output pushed to `/confs`
    pub rendered: PathBuf,
    /// Parent of the throwaway custom config trees built for bootstraps
    pub staging: PathBuf,
    /// Job cache pushed to `/cache`
    pub cache: PathBuf,
    pub reload_min_timeout: Duration,
    pub test_configuration: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            rendered: PathBuf::from("/etc/convoy/nginx"),
            staging: std::env::temp_dir(),
            cache: PathBuf::from("/var/cache/convoy"),
            reload_min_timeout: Duration::from_secs(5),
            test_configuration: true,
        }
    }
}

/// Map a `/health` outcome to a status
fn status_from(report: &BroadcastReport, hostname: &str) -> InstanceStatus {
    if report.errors.contains_key(hostname) {
        return InstanceStatus::Down;
    }
    match report.responses.get(hostname).and_then(|body| body.get("msg")).and_then(Value::as_str) {
        Some("loading") => InstanceStatus::Loading,
        _ => InstanceStatus::Up,
    }
}

/// Health checker that monitors instances
pub struct HealthChecker {
    ctx: Arc<ControlContext>,
    config: HealthCheckConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(ctx: Arc<ControlContext>, config: HealthCheckConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            config,
            shutdown_rx,
        }
    }

    /// Run the health checker
    pub async fn run(mut self) {
        info!(interval_secs = self.config.interval.as_secs(), "Health checker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.check_all_instances().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One round over every stored instance
    pub async fn check_all_instances(&self) {
        if self.ctx.is_applying() {
            debug!("Apply in progress, skipping health round");
            return;
        }

        let instances = match self.ctx.db.get_instances() {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "Failed to load instances");
                return;
            }
        };
        if instances.is_empty() {
            return;
        }

        let report = self.ctx.distributor.health(&instances).await;

        for instance in &instances {
            let status = status_from(&report, &instance.hostname);
            if status != instance.status {
                match status {
                    InstanceStatus::Down => warn!(
                        hostname = %instance.hostname,
                        error = %report.errors.get(&instance.hostname).map(|e| e.to_string()).unwrap_or_default(),
                        "Instance is down"
                    ),
                    _ => info!(hostname = %instance.hostname, status = %status, "Instance status changed"),
                }
            }
            if let Err(e) = self.ctx.db.update_instance_status(&instance.hostname, status) {
                error!(hostname = %instance.hostname, error = %e, "Failed to update instance status");
            }

            if status == InstanceStatus::Loading {
                self.bootstrap(instance).await;
            }
        }
    }

    /// Push the current configuration to one starting instance and reload it
    async fn bootstrap(&self, instance: &Instance) {
        info!(hostname = %instance.hostname, "Instance is loading, sending configuration");
        let target = std::slice::from_ref(instance);
        let distributor = &self.ctx.distributor;
        let mut ok = true;

        ok &= distributor.send_files(target, &self.config.rendered, "/confs").await.all_ok;

        // Private tree, removed on drop; the reconciler prunes the shared one
        let staging = std::fs::create_dir_all(&self.config.staging).and_then(|_| {
            tempfile::Builder::new()
                .prefix("bootstrap-")
                .tempdir_in(&self.config.staging)
        });
        match staging {
            Ok(dir) => {
                let tree = CustomConfigTree::new(dir.path());
                match self.ctx.db.get_custom_configs() {
                    Ok(configs) => ok &= tree.write(&configs).is_ok(),
                    Err(e) => {
                        warn!(error = %e, "Failed to read custom configs");
                        ok = false;
                    }
                }
                ok &= distributor.send_files(target, tree.root(), "/custom_configs").await.all_ok;
            }
            Err(e) => {
                warn!(path = %self.config.staging.display(), error = %e, "Failed to create staging tree");
                ok = false;
            }
        }

        ok &= distributor.send_files(target, &self.config.cache, "/cache").await.all_ok;

        let services = self
            .ctx
            .db
            .get_config(&self.ctx.catalog())
            .map(|env| env.services().len())
            .unwrap_or(0);
        let timeout = reload_timeout(self.config.reload_min_timeout, services);
        ok &= distributor
            .reload(target, self.config.test_configuration, timeout)
            .await
            .all_ok;

        if ok {
            info!(hostname = %instance.hostname, "Instance configured and reloaded");
            if let Err(e) = self.ctx.db.update_instance_status(&instance.hostname, InstanceStatus::Up) {
                error!(hostname = %instance.hostname, error = %e, "Failed to update instance status");
            }
        } else {
            error!(hostname = %instance.hostname, "Failed to configure loading instance");
        }
    }
}

/// Builder for configuring and running the health checker
pub struct HealthCheckerBuilder {
    ctx: Option<Arc<ControlContext>>,
    config: HealthCheckConfig,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl HealthCheckerBuilder {
    pub fn new() -> Self {
        Self {
            ctx: None,
            config: HealthCheckConfig::default(),
            shutdown_rx: None,
        }
    }

    pub fn context(mut self, ctx: Arc<ControlContext>) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn config(mut self, config: HealthCheckConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shutdown_receiver(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(rx);
        self
    }

    pub fn build(self) -> Option<HealthChecker> {
        Some(HealthChecker::new(self.ctx?, self.config, self.shutdown_rx?))
    }
}

impl Default for HealthCheckerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
