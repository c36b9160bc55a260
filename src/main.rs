use anyhow::Context;
use clap::Parser;
use convoy::api::FleetClient;
use convoy::catalog::Catalog;
use convoy::config::{Config, FleetKind};
use convoy::db::Database;
use convoy::fleet::{DockerSource, FleetSource, PodSource, StaticFileSource};
use convoy::healthcheck::HealthCheckerBuilder;
use convoy::plugins::PluginInstaller;
use convoy::reconciler::{self, Reconciler};
use convoy::render::CommandRenderer;
use convoy::resolver::{read_variables, Snapshot};
use convoy::scheduler::{self, JobScheduler};
use convoy::ControlContext;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "convoy.toml";

/// Control plane for a fleet of reverse-proxy instances
#[derive(Parser, Debug)]
#[command(name = "convoy", version, about)]
struct Cli {
    /// Daemon configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run every job once and exit
    #[arg(long)]
    run: bool,

    /// Use a static KEY=value file instead of the database
    #[arg(long, value_name = "PATH")]
    variables: Option<PathBuf>,

    /// Download and install external plugins from a gzip tarball, then exit
    #[arg(long, value_name = "URL", conflicts_with_all = ["run", "variables"])]
    install_plugin: Option<String>,

    /// Log level for convoy (overrides the config file)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().map(|c| c.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to load configuration");
            return ExitCode::from(1);
        }
    };

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Fatal error");
            ExitCode::from(1)
        }
    }
}

fn init_logging(level: &str) {
    let directive = format!("convoy={}", level.to_lowercase());
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .unwrap_or_else(|_| "convoy=info".parse().expect("valid log directive")),
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// An explicit path must exist; the default one falls back to built-in defaults
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("Cannot load {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load(DEFAULT_CONFIG),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<ExitCode> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting convoy");

    let _pid_lock = config.pid_file.as_deref().map(PidLock::acquire).transpose()?;

    let sources = config.catalog_sources();
    let catalog = Catalog::load(&sources.core_settings, &sources.core_plugins, &sources.external_plugins)
        .context("Failed to load setting catalog")?
        .with_ignore_regex_check(config.ignore_regex_check);

    if let Some(path) = &cli.variables {
        return run_with_variables(&config, catalog, path, cli.run).await;
    }

    let db = Database::connect_with_retry(
        &config.database.path,
        config.database.retry_attempts,
        Duration::from_secs(config.database.retry_backoff_secs),
    )
    .await?;
    db.sync_plugins(catalog.plugins())?;

    let distributor = Arc::new(FleetClient::new(config.client_options()).context("Failed to build API client")?);
    let ctx = Arc::new(ControlContext::new(catalog, db.clone(), distributor).with_sources(sources));

    if let Some(url) = &cli.install_plugin {
        let installed = PluginInstaller::new(&config.paths.external_plugins)?
            .install_from_url(&ctx, url)
            .await?;
        for plugin in &installed {
            info!(plugin = %plugin.id, version = %plugin.version, "Plugin installed");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let env = db.get_config(&ctx.catalog())?;
    let instances = db.get_instances()?;
    let mut job_scheduler = JobScheduler::new(
        ctx.catalog(),
        db.clone(),
        ctx.distributor.clone(),
        config.scheduler_options(),
    )
    .with_env(env, instances);

    if cli.run {
        let ok = job_scheduler.run_once(&[]).await;
        info!(success = ok, "Jobs executed once");
        return Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(1) });
    }

    if !job_scheduler.run_once(&[]).await {
        warn!("Some jobs failed during the first run");
    }

    let source = build_source(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (force_tx, force_rx) = watch::channel(0u64);

    let (scheduler_handle, scheduler_task) = scheduler::spawn(job_scheduler, shutdown_rx.clone());
    scheduler_handle.start().await?;

    let renderer = Arc::new(CommandRenderer::new(config.renderer.command.clone(), config.renderer_timeout()));
    let reconciler =
        Reconciler::new(ctx.clone(), renderer, config.reconciler_options()).with_scheduler(scheduler_handle.clone());
    let reconciler_task = tokio::spawn(reconciler::run(
        reconciler,
        source,
        config.poll_interval(),
        force_rx,
        shutdown_rx.clone(),
    ));

    let health_task = if config.healthcheck.enabled {
        HealthCheckerBuilder::new()
            .context(ctx.clone())
            .config(config.health_config())
            .shutdown_receiver(shutdown_rx.clone())
            .build()
            .map(|checker| tokio::spawn(checker.run()))
    } else {
        None
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading plugins...");
                    match ctx.reload_catalog() {
                        Ok(catalog) => {
                            if let Err(e) = scheduler_handle.set_catalog(catalog).await {
                                error!(error = %e, "Failed to hand new catalog to scheduler");
                            }
                            force_tx.send_modify(|n| *n += 1);
                        }
                        Err(e) => error!(error = %format!("{e:#}"), "Failed to reload plugins"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = reconciler_task.await;
        let _ = scheduler_task.await;
        if let Some(handle) = health_task {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Validate and resolve a static variables file, write the snapshot and
/// optionally run the jobs against it
async fn run_with_variables(config: &Config, catalog: Catalog, path: &Path, run_jobs: bool) -> anyhow::Result<ExitCode> {
    let vars = read_variables(path).with_context(|| format!("Cannot read variables file {}", path.display()))?;
    let (snapshot, violations) = Snapshot::from_variables(&catalog, &vars);
    if !violations.is_empty() {
        for violation in &violations {
            error!(key = %violation.key, reason = %violation.reason, "Invalid variable");
        }
        anyhow::bail!("{} invalid variable(s) in {}", violations.len(), path.display());
    }

    let env = snapshot.resolve(&catalog);
    env.write_snapshot(&config.paths.variables)
        .with_context(|| format!("Cannot write {}", config.paths.variables.display()))?;
    info!(keys = env.len(), path = %config.paths.variables.display(), "Variables resolved");

    if !run_jobs {
        return Ok(ExitCode::SUCCESS);
    }

    let db = Database::open_in_memory()?;
    db.sync_plugins(catalog.plugins())?;
    let distributor = Arc::new(FleetClient::new(config.client_options())?);
    let mut job_scheduler = JobScheduler::new(Arc::new(catalog), db, distributor, config.scheduler_options())
        .with_env(env, Vec::new());
    let ok = job_scheduler.run_once(&[]).await;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

fn build_source(config: &Config) -> anyhow::Result<Arc<dyn FleetSource>> {
    let defaults = config.instance_defaults();
    let namespaces = config.fleet.namespaces.clone();
    let source: Arc<dyn FleetSource> = match config.fleet.source {
        FleetKind::Static => Arc::new(StaticFileSource::new(config.fleet.static_file.clone(), defaults)),
        FleetKind::Docker => Arc::new(DockerSource::connect(config.fleet.docker_host.as_deref(), defaults, namespaces)?),
        FleetKind::Pods => match &config.fleet.kubernetes_api {
            Some(url) => Arc::new(PodSource::with_url(url.clone(), defaults, namespaces)?),
            None => Arc::new(PodSource::in_cluster(defaults, namespaces)?),
        },
    };
    info!(source = source.name(), "Fleet source configured");
    Ok(source)
}

/// Exclusive claim on the PID file for the lifetime of the daemon.
///
/// Released and removed on drop.
struct PidLock {
    path: PathBuf,
    #[cfg(unix)]
    _file: std::fs::File,
}

impl PidLock {
    #[cfg(unix)]
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        // Truncate only once the lock is held so a running daemon keeps its PID
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Cannot open PID file {}", path.display()))?;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("convoy is already running ({} is locked)", path.display());
            }
            return Err(err).with_context(|| format!("Cannot lock PID file {}", path.display()));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        info!(path = %path.display(), pid = std::process::id(), "PID file locked");
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    #[cfg(not(unix))]
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Cannot write PID file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}
