//! Watch, diff and apply loop
//!
//! Each tick observes the fleet source. When the observed triad matches the
//! last applied one nothing happens. Otherwise [`Reconciler::apply`] runs every
//! step in order; a failing step is logged and the remaining steps still run.
//! The result is the AND of all steps.

use crate::customconf::CustomConfigTree;
use crate::error::FleetError;
use crate::fleet::{service_variables, FleetSource};
use crate::model::{Method, Triad};
use crate::render::Renderer;
use crate::resolver::EffectiveConfig;
use crate::scheduler::{reload_timeout, SchedulerHandle};
use crate::ControlContext;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Computing,
    Applying,
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Root of the transient custom-config tree
    pub custom_configs: PathBuf,
    /// Variables snapshot handed to the renderer
    pub variables: PathBuf,
    /// Renderer output, pushed to `/confs`
    pub rendered: PathBuf,
    pub reload_min_timeout: Duration,
    pub test_configuration: bool,
    /// Skip distribution when rendering failed
    pub abort_on_failure: bool,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            custom_configs: PathBuf::from("/etc/convoy/configs"),
            variables: PathBuf::from("/var/tmp/convoy/variables.env"),
            rendered: PathBuf::from("/etc/convoy/nginx"),
            reload_min_timeout: Duration::from_secs(5),
            test_configuration: true,
            abort_on_failure: false,
        }
    }
}

pub struct Reconciler {
    ctx: Arc<ControlContext>,
    renderer: Arc<dyn Renderer>,
    scheduler: Option<SchedulerHandle>,
    options: ReconcilerOptions,
    tree: CustomConfigTree,
    last_applied: Option<Triad>,
    state: ReconcilerState,
}

impl Reconciler {
    pub fn new(ctx: Arc<ControlContext>, renderer: Arc<dyn Renderer>, options: ReconcilerOptions) -> Self {
        Self {
            tree: CustomConfigTree::new(options.custom_configs.clone()),
            ctx,
            renderer,
            scheduler: None,
            options,
            last_applied: None,
            state: ReconcilerState::Idle,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn last_applied(&self) -> Option<&Triad> {
        self.last_applied.as_ref()
    }

    /// Forget the last applied triad so the next tick applies unconditionally
    pub fn invalidate(&mut self) {
        self.last_applied = None;
    }

    /// Observe the source and apply if anything changed.
    ///
    /// Returns `None` when the triad is unchanged, otherwise the apply result.
    pub async fn tick(&mut self, source: &dyn FleetSource) -> Result<Option<bool>, FleetError> {
        self.state = ReconcilerState::Computing;
        let triad = match source.observe().await {
            Ok(triad) => triad,
            Err(e) => {
                self.state = ReconcilerState::Idle;
                return Err(e);
            }
        };

        if self.last_applied.as_ref().is_some_and(|last| last.same_as(&triad)) {
            debug!(source = source.name(), "No changes detected");
            self.state = ReconcilerState::Idle;
            return Ok(None);
        }

        info!(
            source = source.name(),
            instances = triad.instances.len(),
            services = triad.services.len(),
            custom_configs = triad.custom_configs.len(),
            "Change detected, applying configuration"
        );
        Ok(Some(self.apply(triad).await))
    }

    /// Apply a triad. Always records it as the last applied one.
    pub async fn apply(&mut self, triad: Triad) -> bool {
        let apply_id = Uuid::new_v4();
        let span = info_span!("apply", apply_id = %apply_id);
        self.run_apply(triad).instrument(span).await
    }

    async fn run_apply(&mut self, triad: Triad) -> bool {
        self.state = ReconcilerState::Applying;
        let ctx = self.ctx.clone();
        let _guard = ctx.begin_apply();
        let catalog = ctx.catalog();
        let mut success = true;

        if let Some(scheduler) = &self.scheduler {
            success &= step("stop scheduler", scheduler.stop().await.map_err(|e| e.to_string()));
        }

        success &= step("persist fleet", self.persist(&triad));

        let configs = match ctx.db.get_custom_configs() {
            Ok(configs) => configs,
            Err(e) => {
                success = false;
                error!(error = %e, "Failed to read custom configs, writing the observed ones");
                triad.custom_configs.clone()
            }
        };
        let written = self.tree.write(&configs);
        success &= step(
            "write custom configs",
            if written.is_ok() {
                Ok(())
            } else {
                Err(format!("failed: {}", written.failed.join(", ")))
            },
        );

        let env = match ctx.db.get_config(&catalog) {
            Ok(env) => env,
            Err(e) => {
                success = false;
                error!(error = %e, "Failed to resolve configuration");
                EffectiveConfig::default()
            }
        };
        success &= step(
            "write variables",
            env.write_snapshot(&self.options.variables).map_err(|e| e.to_string()),
        );

        if let Some(scheduler) = &self.scheduler {
            let reloaded = scheduler
                .reload(env.clone(), triad.instances.clone(), None)
                .await
                .map_err(|e| e.to_string())
                .and_then(|ok| if ok { Ok(()) } else { Err("jobs failed".to_string()) });
            success &= step("reload scheduler", reloaded);
        }

        let rendered = self
            .renderer
            .render(&self.options.variables, &self.options.rendered)
            .await
            .map_err(|e| e.to_string());
        let render_ok = step("render", rendered);
        success &= render_ok;

        if !render_ok && self.options.abort_on_failure {
            warn!("Rendering failed, not distributing configuration");
            success = false;
        } else {
            success &= self.distribute(&triad, &env).await;
        }

        success &= step(
            "prune custom configs",
            self.tree.prune(&written.written).map_err(|e| e.to_string()),
        );

        if success {
            info!("Configuration applied");
        } else {
            warn!("Configuration applied with errors, it may not work as expected");
        }
        self.last_applied = Some(triad);
        self.state = ReconcilerState::Idle;
        success
    }

    /// Store the observed triad as autoconf-owned rows
    fn persist(&self, triad: &Triad) -> Result<(), String> {
        let catalog = self.ctx.catalog();
        let db = &self.ctx.db;

        db.save_instances(&triad.instances, Method::Autoconf)
            .map_err(|e| format!("instances: {e:#}"))?;

        let violations = db
            .save_config(&catalog, &service_variables(triad), Method::Autoconf, false)
            .map_err(|e| format!("config: {e:#}"))?;
        if !violations.is_empty() {
            warn!(dropped = violations.len(), "Some service settings were dropped");
        }

        let skipped = db
            .save_custom_configs(&triad.custom_configs, Method::Autoconf)
            .map_err(|e| format!("custom configs: {e:#}"))?;
        if skipped > 0 {
            warn!(skipped, "Some custom configs are owned by another method and were kept");
        }
        Ok(())
    }

    async fn distribute(&self, triad: &Triad, env: &EffectiveConfig) -> bool {
        if triad.instances.is_empty() {
            debug!("No instances to distribute to");
            return true;
        }
        let distributor = &self.ctx.distributor;
        let mut success = true;

        let confs = distributor
            .send_files(&triad.instances, &self.options.rendered, "/confs")
            .await;
        success &= step("push configuration", report_result(&confs));

        let custom = distributor
            .send_files(&triad.instances, self.tree.root(), "/custom_configs")
            .await;
        success &= step("push custom configs", report_result(&custom));

        let timeout = reload_timeout(self.options.reload_min_timeout, env.services().len());
        let reload = distributor
            .reload(&triad.instances, self.options.test_configuration, timeout)
            .await;
        success &= step("reload instances", report_result(&reload));

        success
    }
}

fn report_result(report: &crate::api::BroadcastReport) -> Result<(), String> {
    if report.all_ok {
        Ok(())
    } else {
        Err(format!("failed on {}", report.failed_hosts().join(", ")))
    }
}

fn step(name: &str, result: Result<(), String>) -> bool {
    match result {
        Ok(()) => {
            debug!(step = name, "Step succeeded");
            true
        }
        Err(e) => {
            error!(step = name, error = %e, "Step failed");
            false
        }
    }
}

/// Tick the reconciler every `interval` until shutdown
pub async fn run(
    mut reconciler: Reconciler,
    source: Arc<dyn FleetSource>,
    interval: Duration,
    mut force_rx: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(source = source.name(), interval_secs = interval.as_secs(), "Reconciler started");

    loop {
        match reconciler.tick(source.as_ref()).await {
            Ok(Some(false)) => warn!("Last apply had failures"),
            Ok(_) => {}
            Err(e) => error!(source = source.name(), error = %e, "Failed to observe fleet"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = force_rx.changed() => {
                if changed.is_ok() {
                    info!("Forced re-apply requested");
                    reconciler.invalidate();
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    }
}
