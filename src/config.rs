use crate::api::ClientOptions;
use crate::fleet::InstanceDefaults;
use crate::healthcheck::HealthCheckConfig;
use crate::reconciler::ReconcilerOptions;
use crate::scheduler::SchedulerOptions;
use crate::CatalogSources;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Default log level for the `convoy` target
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to PID file (optional)
    pub pid_file: Option<PathBuf>,

    /// Disable value regex checks for every setting
    #[serde(default)]
    pub ignore_regex_check: bool,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub renderer: RendererConfig,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub healthcheck: HealthCheckSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Global settings manifest, loaded as plugin `general`
    #[serde(default = "default_core_settings")]
    pub core_settings: PathBuf,

    #[serde(default = "default_core_plugins")]
    pub core_plugins: PathBuf,

    #[serde(default = "default_external_plugins")]
    pub external_plugins: PathBuf,

    /// Transient custom-config tree
    #[serde(default = "default_custom_configs")]
    pub custom_configs: PathBuf,

    /// Effective-config snapshot read by the renderer
    #[serde(default = "default_variables")]
    pub variables: PathBuf,

    /// Renderer output, pushed to `/confs`
    #[serde(default = "default_rendered")]
    pub rendered: PathBuf,

    /// Job cache, pushed to `/cache`
    #[serde(default = "default_cache")]
    pub cache: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Job run history rows kept
    #[serde(default = "default_max_job_runs")]
    pub max_job_runs: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Control API port of instances that do not override it
    #[serde(default = "default_api_port")]
    pub http_port: u16,

    /// Host header of instances that do not override it
    #[serde(default = "default_api_server_name")]
    pub server_name: String,

    /// Bearer token sent with every call (optional)
    pub token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_reload_min_timeout")]
    pub reload_min_timeout_secs: u64,

    /// Reload with `test=no`
    #[serde(default)]
    pub disable_configuration_testing: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RendererConfig {
    #[serde(default = "default_renderer_command")]
    pub command: String,

    #[serde(default = "default_renderer_timeout")]
    pub timeout_secs: u64,

    /// Skip distribution when rendering fails
    #[serde(default)]
    pub abort_on_failure: bool,
}

/// Backend that enumerates the fleet
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FleetKind {
    #[default]
    Static,
    Docker,
    Pods,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FleetConfig {
    #[serde(default)]
    pub source: FleetKind,

    #[serde(default = "default_static_file")]
    pub static_file: PathBuf,

    /// Docker endpoint: `unix:///path/to/socket` or `tcp://host:port`
    pub docker_host: Option<String>,

    /// Kubernetes API URL; in-cluster settings are used when unset
    pub kubernetes_api: Option<String>,

    /// Only watch these namespaces (all when empty)
    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pid_file: None,
            ignore_regex_check: false,
            paths: PathsConfig::default(),
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
            scheduler: SchedulerConfig::default(),
            renderer: RendererConfig::default(),
            fleet: FleetConfig::default(),
            healthcheck: HealthCheckSection::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            core_settings: default_core_settings(),
            core_plugins: default_core_plugins(),
            external_plugins: default_external_plugins(),
            custom_configs: default_custom_configs(),
            variables: default_variables(),
            rendered: default_rendered(),
            cache: default_cache(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            max_job_runs: default_max_job_runs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_api_port(),
            server_name: default_api_server_name(),
            token: None,
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            reload_min_timeout_secs: default_reload_min_timeout(),
            disable_configuration_testing: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            command: default_renderer_command(),
            timeout_secs: default_renderer_timeout(),
            abort_on_failure: false,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            source: FleetKind::Static,
            static_file: default_static_file(),
            docker_host: None,
            kubernetes_api: None,
            namespaces: Vec::new(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_core_settings() -> PathBuf {
    PathBuf::from("/usr/share/convoy/settings.json")
}

fn default_core_plugins() -> PathBuf {
    PathBuf::from("/usr/share/convoy/core")
}

fn default_external_plugins() -> PathBuf {
    PathBuf::from("/etc/convoy/plugins")
}

fn default_custom_configs() -> PathBuf {
    PathBuf::from("/etc/convoy/configs")
}

fn default_variables() -> PathBuf {
    PathBuf::from("/var/tmp/convoy/variables.env")
}

fn default_rendered() -> PathBuf {
    PathBuf::from("/etc/convoy/nginx")
}

fn default_cache() -> PathBuf {
    PathBuf::from("/var/cache/convoy")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/convoy/db.sqlite3")
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_backoff() -> u64 {
    5
}

fn default_max_job_runs() -> usize {
    10_000
}

fn default_api_port() -> u16 {
    5000
}

fn default_api_server_name() -> String {
    "bwapi".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_reload_min_timeout() -> u64 {
    5
}

fn default_tick_interval() -> u64 {
    1000 // 1 second
}

fn default_renderer_command() -> String {
    "/usr/share/convoy/gen/main.py --templates /usr/share/convoy/confs".to_string()
}

fn default_renderer_timeout() -> u64 {
    60
}

fn default_static_file() -> PathBuf {
    PathBuf::from("/etc/convoy/fleet.toml")
}

fn default_poll_interval() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            errors.push(format!(
                "log_level '{}' must be one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            ));
        }
        if self.database.retry_attempts == 0 {
            errors.push("database.retry_attempts must be greater than 0".to_string());
        }
        if self.api.http_port == 0 {
            errors.push("api.http_port must be greater than 0".to_string());
        }
        if self.api.server_name.trim().is_empty() {
            errors.push("api.server_name must not be empty".to_string());
        }
        if self.api.request_timeout_secs == 0 {
            errors.push("api.request_timeout_secs must be greater than 0".to_string());
        }
        if self.scheduler.tick_interval_ms == 0 {
            errors.push("scheduler.tick_interval_ms must be greater than 0".to_string());
        }
        if self.renderer.command.trim().is_empty() {
            errors.push("renderer.command must not be empty".to_string());
        } else if let Err(e) = shell_words::split(&self.renderer.command) {
            errors.push(format!("renderer.command is not a valid command line: {}", e));
        }
        if self.renderer.timeout_secs == 0 {
            errors.push("renderer.timeout_secs must be greater than 0".to_string());
        }
        if self.fleet.poll_interval_secs == 0 {
            errors.push("fleet.poll_interval_secs must be greater than 0".to_string());
        }
        if self.healthcheck.enabled && self.healthcheck.interval_secs == 0 {
            errors.push("healthcheck.interval_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn catalog_sources(&self) -> CatalogSources {
        CatalogSources {
            core_settings: self.paths.core_settings.clone(),
            core_plugins: self.paths.core_plugins.clone(),
            external_plugins: self.paths.external_plugins.clone(),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            token: self.api.token.clone(),
            request_timeout: Duration::from_secs(self.api.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.api.connect_timeout_secs),
        }
    }

    pub fn instance_defaults(&self) -> InstanceDefaults {
        InstanceDefaults {
            port: self.api.http_port,
            server_name: self.api.server_name.clone(),
        }
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            custom_configs: self.paths.custom_configs.clone(),
            variables: self.paths.variables.clone(),
            rendered: self.paths.rendered.clone(),
            reload_min_timeout: Duration::from_secs(self.api.reload_min_timeout_secs),
            test_configuration: !self.api.disable_configuration_testing,
            abort_on_failure: self.renderer.abort_on_failure,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            tick_interval: Duration::from_millis(self.scheduler.tick_interval_ms),
            max_job_runs: self.database.max_job_runs,
            reload_min_timeout: Duration::from_secs(self.api.reload_min_timeout_secs),
            test_configuration: !self.api.disable_configuration_testing,
            cache_dir: self.paths.cache.clone(),
        }
    }

    pub fn health_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_secs(self.healthcheck.interval_secs),
            rendered: self.paths.rendered.clone(),
            staging: std::env::temp_dir(),
            cache: self.paths.cache.clone(),
            reload_min_timeout: Duration::from_secs(self.api.reload_min_timeout_secs),
            test_configuration: !self.api.disable_configuration_testing,
        }
    }

    pub fn renderer_timeout(&self) -> Duration {
        Duration::from_secs(self.renderer.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.fleet.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
log_level = "debug"
pid_file = "/run/convoy.pid"

[paths]
core_settings = "/opt/convoy/settings.json"
variables = "/tmp/vars.env"

[database]
path = "/tmp/convoy.db"
retry_attempts = 2

[api]
http_port = 5001
server_name = "edge-api"
token = "secret"
disable_configuration_testing = true

[renderer]
command = "python3 /opt/gen/main.py --templates '/opt/my confs'"
abort_on_failure = true

[fleet]
source = "docker"
docker_host = "unix:///var/run/docker.sock"
namespaces = ["prod"]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.pid_file, Some(PathBuf::from("/run/convoy.pid")));
        assert_eq!(config.paths.core_settings, PathBuf::from("/opt/convoy/settings.json"));
        assert_eq!(config.paths.custom_configs, PathBuf::from("/etc/convoy/configs"));
        assert_eq!(config.database.retry_attempts, 2);
        assert_eq!(config.database.retry_backoff_secs, 5);
        assert_eq!(config.fleet.source, FleetKind::Docker);
        assert_eq!(config.fleet.namespaces, vec!["prod".to_string()]);

        let defaults = config.instance_defaults();
        assert_eq!(defaults.port, 5001);
        assert_eq!(defaults.server_name, "edge-api");

        let options = config.reconciler_options();
        assert!(!options.test_configuration);
        assert!(options.abort_on_failure);
        assert_eq!(options.variables, PathBuf::from("/tmp/vars.env"));

        assert_eq!(config.client_options().token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.database.retry_attempts, 5);
        assert_eq!(config.database.max_job_runs, 10_000);
        assert_eq!(config.api.http_port, 5000);
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.fleet.source, FleetKind::Static);
        assert!(config.healthcheck.enabled);
        assert!(config.scheduler_options().test_configuration);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.api.server_name, "bwapi");
        assert_eq!(config.renderer.timeout_secs, 60);
    }

    #[test]
    fn test_validation_collects_errors() {
        let config: Config = toml::from_str(
            r#"
log_level = "loud"

[api]
http_port = 0

[renderer]
command = "gen 'unterminated"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.starts_with("Configuration errors:"));
        assert!(err.contains("log_level 'loud'"));
        assert!(err.contains("api.http_port"));
        assert!(err.contains("renderer.command"));
    }

    #[test]
    fn test_unknown_fleet_source_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[fleet]
source = "nomad"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("convoy.toml");
        std::fs::write(&path, "[scheduler]\ntick_interval_ms = 0\n").unwrap();
        assert!(Config::load(&path).is_err());

        std::fs::write(&path, "[scheduler]\ntick_interval_ms = 250\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.scheduler_options().tick_interval, Duration::from_millis(250));
    }
}
