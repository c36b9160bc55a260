//! Job scheduler for plugin maintenance jobs
//!
//! [`JobScheduler`] holds the schedule and runs jobs. It is owned by a single
//! task spawned with [`spawn`]; everything else talks to it through a
//! [`SchedulerHandle`]. The task either runs a tick or handles one command at a
//! time, so a reload can never overlap a tick that is in progress.
//!
//! Jobs are subprocesses. Exit code 0 means success, 1 means success and the
//! instances need a reload (if the job declares `reload`), anything else is a
//! failure. A failing job never stops its siblings.

use crate::api::Distributor;
use crate::catalog::{Catalog, JobSpec, Plugin, SettingType};
use crate::db::Database;
use crate::error::SchedulerError;
use crate::model::{Instance, JobRun};
use crate::resolver::EffectiveConfig;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source of "now" for cadence decisions
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No jobs registered
    Stopped,
    /// Jobs registered, waiting for the next tick
    Armed,
    /// A tick or a run is executing
    Running,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    pub max_job_runs: usize,
    pub reload_min_timeout: Duration,
    /// Ask instances to test the configuration before reloading
    pub test_configuration: bool,
    /// Pushed to `/cache` before a job-triggered reload
    pub cache_dir: PathBuf,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_job_runs: 10_000,
            reload_min_timeout: Duration::from_secs(5),
            test_configuration: true,
            cache_dir: PathBuf::from("/var/cache/convoy"),
        }
    }
}

#[derive(Debug, Clone)]
struct RunnableJob {
    name: String,
    plugin_id: String,
    path: PathBuf,
    reload: bool,
    run_async: bool,
}

impl RunnableJob {
    fn new(plugin: &Plugin, spec: &JobSpec) -> Option<Self> {
        let path = plugin.job_path(spec)?;
        Some(Self {
            name: spec.name.clone(),
            plugin_id: plugin.id.clone(),
            path,
            reload: spec.reload,
            run_async: spec.run_async,
        })
    }
}

#[derive(Debug, Clone)]
struct ScheduledJob {
    job: RunnableJob,
    period: chrono::Duration,
    next_run: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct JobOutcome {
    name: String,
    success: bool,
    wants_reload: bool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

pub struct JobScheduler {
    catalog: Arc<Catalog>,
    db: Database,
    distributor: Arc<dyn Distributor>,
    options: SchedulerOptions,
    clock: Clock,
    env: EffectiveConfig,
    instances: Vec<Instance>,
    jobs: Vec<ScheduledJob>,
    state: SchedulerState,
    reload_pending: bool,
}

impl JobScheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        db: Database,
        distributor: Arc<dyn Distributor>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            catalog,
            db,
            distributor,
            options,
            clock: Arc::new(Utc::now),
            env: EffectiveConfig::default(),
            instances: Vec::new(),
            jobs: Vec::new(),
            state: SchedulerState::Stopped,
            reload_pending: false,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_env(mut self, env: EffectiveConfig, instances: Vec<Instance>) -> Self {
        self.env = env;
        self.instances = instances;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Names of the jobs registered for periodic runs
    pub fn scheduled_jobs(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.job.name.as_str()).collect()
    }

    pub fn set_catalog(&mut self, catalog: Arc<Catalog>) {
        self.catalog = catalog;
    }

    /// Register every periodic job of every enabled plugin
    pub fn setup(&mut self) {
        let now = (self.clock)();
        self.jobs.clear();

        for plugin in self.catalog.plugins() {
            if !plugin_enabled(plugin, &self.env) {
                debug!(plugin = %plugin.id, "Plugin disabled by configuration, skipping its jobs");
                continue;
            }
            for spec in &plugin.jobs {
                let Some(period) = spec.every.period() else {
                    continue;
                };
                let Some(job) = RunnableJob::new(plugin, spec) else {
                    warn!(plugin = %plugin.id, job = %spec.name, "Plugin has no directory, skipping job");
                    continue;
                };
                let period = chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::hours(1));
                self.jobs.push(ScheduledJob {
                    job,
                    period,
                    next_run: now + period,
                });
            }
        }

        self.state = SchedulerState::Armed;
        info!(jobs = self.jobs.len(), "Scheduler armed");
    }

    /// Cancel every registered job
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.state = SchedulerState::Stopped;
        debug!("Scheduler cleared");
    }

    /// Run every job whose cadence has elapsed at `now`.
    ///
    /// Returns false if any job failed.
    pub async fn run_pending_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == SchedulerState::Stopped {
            return true;
        }

        let mut due = Vec::new();
        for scheduled in &mut self.jobs {
            if scheduled.next_run <= now {
                due.push(scheduled.job.clone());
                scheduled.next_run = now + scheduled.period;
            }
        }
        if due.is_empty() {
            return true;
        }

        self.state = SchedulerState::Running;
        debug!(jobs = due.len(), "Running pending jobs");
        let env = &self.env;
        let outcomes = join_all(due.iter().map(|job| run_job(job, env))).await;
        let success = self.finish_round(outcomes).await;
        self.state = SchedulerState::Armed;
        success
    }

    /// Run one tick against the scheduler clock
    pub async fn run_pending(&mut self) -> bool {
        let now = (self.clock)();
        self.run_pending_at(now).await
    }

    /// Run every job of the given plugins (all enabled plugins when empty)
    /// regardless of cadence.
    ///
    /// Jobs of one plugin run in manifest order; plugins run concurrently and
    /// `async` jobs run on their own.
    pub async fn run_once(&mut self, plugins: &[String]) -> bool {
        let previous = self.state;
        self.state = SchedulerState::Running;

        let mut groups: BTreeMap<String, Vec<RunnableJob>> = BTreeMap::new();
        let mut independent = Vec::new();
        for plugin in self.catalog.plugins() {
            if !plugins.is_empty() && !plugins.contains(&plugin.id) {
                continue;
            }
            if !plugin_enabled(plugin, &self.env) {
                debug!(plugin = %plugin.id, "Plugin disabled by configuration, skipping its jobs");
                continue;
            }
            for spec in &plugin.jobs {
                let Some(job) = RunnableJob::new(plugin, spec) else {
                    warn!(plugin = %plugin.id, job = %spec.name, "Plugin has no directory, skipping job");
                    continue;
                };
                if job.run_async {
                    independent.push(job);
                } else {
                    groups.entry(plugin.id.clone()).or_default().push(job);
                }
            }
        }

        let env = &self.env;
        let mut tasks: Vec<BoxFuture<'_, Vec<JobOutcome>>> = Vec::new();
        for jobs in groups.values() {
            tasks.push(
                async move {
                    let mut outcomes = Vec::with_capacity(jobs.len());
                    for job in jobs {
                        outcomes.push(run_job(job, env).await);
                    }
                    outcomes
                }
                .boxed(),
            );
        }
        for job in &independent {
            tasks.push(async move { vec![run_job(job, env).await] }.boxed());
        }

        let outcomes: Vec<JobOutcome> = join_all(tasks).await.into_iter().flatten().collect();
        info!(jobs = outcomes.len(), "Run-once finished");
        let success = self.finish_round(outcomes).await;

        self.state = if previous == SchedulerState::Running {
            SchedulerState::Armed
        } else {
            previous
        };
        success
    }

    /// Run a single job by name
    pub async fn run_single(&mut self, job_name: &str) -> Result<bool, SchedulerError> {
        let job = self
            .catalog
            .jobs()
            .find(|(_, spec)| spec.name == job_name)
            .and_then(|(plugin, spec)| RunnableJob::new(plugin, spec))
            .ok_or_else(|| SchedulerError::UnknownJob(job_name.to_string()))?;

        let outcome = run_job(&job, &self.env).await;
        Ok(self.finish_round(vec![outcome]).await)
    }

    /// Replace the environment and instance set, then rebuild the schedule.
    ///
    /// When `run_plugins` is set, the jobs of those plugins (all when empty)
    /// run once before the schedule is armed again.
    pub async fn reload(
        &mut self,
        env: EffectiveConfig,
        instances: Vec<Instance>,
        run_plugins: Option<&[String]>,
    ) -> bool {
        self.env = env;
        self.instances = instances;
        self.clear();

        let success = match run_plugins {
            Some(plugins) => self.run_once(plugins).await,
            None => true,
        };

        self.setup();
        success
    }

    /// Persist outcomes, push cache and reload when asked, prune history
    async fn finish_round(&mut self, outcomes: Vec<JobOutcome>) -> bool {
        let mut success = true;
        for outcome in &outcomes {
            success &= outcome.success;
            self.reload_pending |= outcome.wants_reload;
            let run = JobRun {
                job_name: outcome.name.clone(),
                success: outcome.success,
                start_date: outcome.start,
                end_date: Some(outcome.end),
            };
            if let Err(e) = self.db.add_job_run(&run) {
                warn!(job = %outcome.name, error = %e, "Failed to record job run");
            }
        }

        if self.reload_pending {
            self.reload_pending = false;
            success &= self.reload_instances().await;
        }

        if let Err(e) = self.db.cleanup_job_runs(self.options.max_job_runs) {
            warn!(error = %e, "Failed to prune job run history");
        }
        success
    }

    async fn reload_instances(&self) -> bool {
        if self.instances.is_empty() {
            debug!("Reload requested by a job but no instances are known");
            return true;
        }

        let cache = self
            .distributor
            .send_files(&self.instances, &self.options.cache_dir, "/cache")
            .await;
        if !cache.all_ok {
            warn!(failed = ?cache.failed_hosts(), "Cache push failed on some instances");
        }

        let timeout = reload_timeout(self.options.reload_min_timeout, self.env.services().len());
        let report = self
            .distributor
            .reload(&self.instances, self.options.test_configuration, timeout)
            .await;
        if report.all_ok {
            info!(instances = self.instances.len(), "Instances reloaded after job run");
        } else {
            error!(failed = ?report.failed_hosts(), "Reload after job run failed on some instances");
        }
        cache.all_ok && report.all_ok
    }
}

/// `max(minimum, 2s per service)`
pub fn reload_timeout(minimum: Duration, services: usize) -> Duration {
    minimum.max(Duration::from_secs(2 * services as u64))
}

/// A plugin with `USE_*` check settings is disabled when every one of them is
/// `no`, globally and for every service. Plugins without such settings always run.
pub fn plugin_enabled(plugin: &Plugin, env: &EffectiveConfig) -> bool {
    let switches: Vec<&str> = plugin
        .settings
        .iter()
        .filter(|s| s.id.starts_with("USE_") && s.setting_type == SettingType::Check)
        .map(|s| s.id.as_str())
        .collect();
    if switches.is_empty() {
        return true;
    }

    let services = env.services();
    switches.iter().any(|id| {
        env.get(id) == Some("yes") || services.iter().any(|service| env.service_value(service, id) == Some("yes"))
    })
}

/// Interpreter for a job file, picked by extension
fn job_command(path: &Path) -> Command {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => {
            let mut cmd = Command::new("python3");
            cmd.arg(path);
            cmd
        }
        Some("sh") => {
            let mut cmd = Command::new("sh");
            cmd.arg(path);
            cmd
        }
        _ => Command::new(path),
    }
}

async fn run_job(job: &RunnableJob, env: &EffectiveConfig) -> JobOutcome {
    let start = Utc::now();
    let mut cmd = job_command(&job.path);
    cmd.envs(env.iter())
        .env("PLUGIN_ID", &job.plugin_id)
        .env("JOB_NAME", &job.name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(job = %job.name, plugin = %job.plugin_id, "Starting job");
    let (success, wants_reload) = match cmd.output().await {
        Ok(output) => match output.status.code() {
            Some(0) => {
                info!(job = %job.name, plugin = %job.plugin_id, "Job succeeded");
                (true, false)
            }
            Some(1) => {
                info!(job = %job.name, plugin = %job.plugin_id, "Job succeeded and changed state");
                (true, job.reload)
            }
            code => {
                error!(
                    job = %job.name,
                    plugin = %job.plugin_id,
                    code = ?code,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Job failed"
                );
                (false, false)
            }
        },
        Err(e) => {
            let e = SchedulerError::Spawn {
                job: job.name.clone(),
                source: e,
            };
            error!(plugin = %job.plugin_id, error = %e, "Job failed");
            (false, false)
        }
    };

    JobOutcome {
        name: job.name.clone(),
        success,
        wants_reload,
        start,
        end: Utc::now(),
    }
}

enum SchedulerCommand {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    SetCatalog(Arc<Catalog>, oneshot::Sender<()>),
    Reload {
        env: EffectiveConfig,
        instances: Vec<Instance>,
        run_plugins: Option<Vec<String>>,
        reply: oneshot::Sender<bool>,
    },
    RunOnce(Vec<String>, oneshot::Sender<bool>),
    RunSingle(String, oneshot::Sender<Result<bool, SchedulerError>>),
    State(oneshot::Sender<SchedulerState>),
}

/// Cloneable handle to the scheduler task
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Register jobs and start ticking
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.request(SchedulerCommand::Start).await
    }

    /// Cancel every job. Returns once any tick in progress has finished.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.request(SchedulerCommand::Stop).await
    }

    pub async fn set_catalog(&self, catalog: Arc<Catalog>) -> Result<(), SchedulerError> {
        self.request(|reply| SchedulerCommand::SetCatalog(catalog, reply)).await
    }

    /// Swap environment and instances, optionally run jobs once, re-arm
    pub async fn reload(
        &self,
        env: EffectiveConfig,
        instances: Vec<Instance>,
        run_plugins: Option<Vec<String>>,
    ) -> Result<bool, SchedulerError> {
        self.request(|reply| SchedulerCommand::Reload {
            env,
            instances,
            run_plugins,
            reply,
        })
        .await
    }

    pub async fn run_once(&self, plugins: Vec<String>) -> Result<bool, SchedulerError> {
        self.request(|reply| SchedulerCommand::RunOnce(plugins, reply)).await
    }

    pub async fn run_single(&self, job_name: impl Into<String>) -> Result<bool, SchedulerError> {
        let job_name = job_name.into();
        self.request(|reply| SchedulerCommand::RunSingle(job_name, reply)).await?
    }

    pub async fn state(&self) -> Result<SchedulerState, SchedulerError> {
        self.request(SchedulerCommand::State).await
    }
}

/// Move the scheduler into its own task and return a handle to it
pub fn spawn(mut scheduler: JobScheduler, mut shutdown_rx: watch::Receiver<bool>) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(16);
    let tick_interval = scheduler.options.tick_interval;

    let task = tokio::spawn(async move {
        info!(tick_ms = tick_interval.as_millis() as u64, "Scheduler started");
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if scheduler.state != SchedulerState::Stopped {
                        scheduler.run_pending().await;
                    }
                }
                command = rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    handle_command(&mut scheduler, command).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        scheduler.clear();
        info!("Scheduler shutting down");
    });

    (SchedulerHandle { tx }, task)
}

async fn handle_command(scheduler: &mut JobScheduler, command: SchedulerCommand) {
    match command {
        SchedulerCommand::Start(reply) => {
            scheduler.setup();
            let _ = reply.send(());
        }
        SchedulerCommand::Stop(reply) => {
            scheduler.clear();
            let _ = reply.send(());
        }
        SchedulerCommand::SetCatalog(catalog, reply) => {
            scheduler.set_catalog(catalog);
            let _ = reply.send(());
        }
        SchedulerCommand::Reload {
            env,
            instances,
            run_plugins,
            reply,
        } => {
            let success = scheduler.reload(env, instances, run_plugins.as_deref()).await;
            let _ = reply.send(success);
        }
        SchedulerCommand::RunOnce(plugins, reply) => {
            let success = scheduler.run_once(&plugins).await;
            let _ = reply.send(success);
        }
        SchedulerCommand::RunSingle(job, reply) => {
            let result = scheduler.run_single(&job).await;
            let _ = reply.send(result);
        }
        SchedulerCommand::State(reply) => {
            let _ = reply.send(scheduler.state());
        }
    }
}
