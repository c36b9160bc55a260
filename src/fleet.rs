//! Fleet sources: where instances, services and custom configs come from
//!
//! Every backend produces the same [`Triad`]. The reconciler only sees the
//! [`FleetSource`] trait.
//!
//! Container and pod backends read `convoy.*` labels (or annotations):
//! - `convoy.INSTANCE`: marks a proxy instance
//! - `convoy.API_HTTP_PORT`, `convoy.API_SERVER_NAME`: per-instance API overrides
//! - `convoy.SERVER_NAME`: marks a service; its first name is the service id
//! - `convoy.NAMESPACE`: namespace used for filtering
//! - `convoy.CUSTOM_CONF_<TYPE>_<NAME>`: inline custom config for the service
//! - any other `convoy.<SETTING>`: a setting of the service

use crate::error::FleetError;
use crate::model::{CustomConfig, CustomConfigType, Instance, Method, ServiceSpec, Triad};
use async_trait::async_trait;
use base64::Engine;
use bollard::container::ListContainersOptions;
use bollard::Docker;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const LABEL_PREFIX: &str = "convoy.";

const CUSTOM_CONF_PREFIX: &str = "CUSTOM_CONF_";

/// Produces the current triad from an orchestration backend
#[async_trait]
pub trait FleetSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn observe(&self) -> Result<Triad, FleetError>;
}

/// Values used for instances that do not override them
#[derive(Debug, Clone)]
pub struct InstanceDefaults {
    pub port: u16,
    pub server_name: String,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            port: 5000,
            server_name: "bwapi".to_string(),
        }
    }
}

// ==================== Static file ====================

#[derive(Debug, Deserialize)]
struct FleetFile {
    #[serde(default)]
    instances: Vec<FleetInstance>,
    #[serde(default)]
    services: Vec<ServiceSpec>,
    #[serde(default)]
    custom_configs: Vec<FleetCustomConfig>,
}

#[derive(Debug, Deserialize)]
struct FleetInstance {
    hostname: String,
    port: Option<u16>,
    server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FleetCustomConfig {
    #[serde(rename = "type")]
    config_type: String,
    name: String,
    service: Option<String>,
    data: Option<String>,
    /// Read the payload from a file, relative to the fleet file
    file: Option<PathBuf>,
}

/// Fleet described by a TOML file, re-read on every observation
pub struct StaticFileSource {
    path: PathBuf,
    defaults: InstanceDefaults,
}

impl StaticFileSource {
    pub fn new(path: impl Into<PathBuf>, defaults: InstanceDefaults) -> Self {
        Self {
            path: path.into(),
            defaults,
        }
    }

    fn parse(&self, content: &str) -> Result<Triad, FleetError> {
        let file: FleetFile = toml::from_str(content)?;
        let base = self.path.parent().unwrap_or_else(|| Path::new("."));

        let instances = file
            .instances
            .into_iter()
            .map(|i| {
                let mut instance = Instance::new(
                    i.hostname,
                    i.port.unwrap_or(self.defaults.port),
                    i.server_name.unwrap_or_else(|| self.defaults.server_name.clone()),
                );
                instance.method = Method::Autoconf;
                instance
            })
            .collect();

        let mut custom_configs = Vec::with_capacity(file.custom_configs.len());
        for raw in file.custom_configs {
            let config_type = CustomConfigType::parse(&raw.config_type).ok_or_else(|| {
                FleetError::Invalid(format!("unknown custom config type {}", raw.config_type))
            })?;
            let data = match (raw.data, raw.file) {
                (Some(data), None) => data.into_bytes(),
                (None, Some(file)) => std::fs::read(base.join(file))?,
                _ => {
                    return Err(FleetError::Invalid(format!(
                        "custom config {} needs exactly one of data or file",
                        raw.name
                    )))
                }
            };
            custom_configs.push(CustomConfig::new(raw.service, config_type, &raw.name, data, Method::Autoconf));
        }

        Ok(Triad::new(instances, file.services, custom_configs))
    }
}

#[async_trait]
impl FleetSource for StaticFileSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn observe(&self) -> Result<Triad, FleetError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        self.parse(&content)
    }
}

// ==================== Labels ====================

/// A labelled workload: container, pod or ingress
#[derive(Debug, Clone, Default)]
pub struct Workload {
    pub name: String,
    /// Address used to reach its control API
    pub address: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Split `TYPE_NAME` from a `CUSTOM_CONF_` label into a type and a name
fn parse_custom_conf_key(rest: &str) -> Option<(CustomConfigType, &str)> {
    CustomConfigType::ALL
        .into_iter()
        .filter_map(|t| {
            let prefix = format!("{}_", t.as_str().to_uppercase().replace('-', "_"));
            rest.strip_prefix(&prefix).map(|name| (t, name, prefix.len()))
        })
        .filter(|(_, name, _)| !name.is_empty())
        .max_by_key(|(_, _, len)| *len)
        .map(|(t, name, _)| (t, name))
}

fn in_namespaces(labels: &HashMap<String, String>, namespaces: &[String]) -> bool {
    if namespaces.is_empty() {
        return true;
    }
    labels
        .get(&format!("{LABEL_PREFIX}NAMESPACE"))
        .is_some_and(|ns| namespaces.contains(ns))
}

/// Build a triad from labelled workloads
pub fn triad_from_workloads(workloads: &[Workload], defaults: &InstanceDefaults, namespaces: &[String]) -> Triad {
    let mut instances = Vec::new();
    let mut services = Vec::new();
    let mut custom_configs = Vec::new();

    for workload in workloads {
        if !in_namespaces(&workload.labels, namespaces) {
            continue;
        }
        let label = |key: &str| workload.labels.get(&format!("{LABEL_PREFIX}{key}"));

        if label("INSTANCE").is_some() {
            let Some(address) = workload.address.clone() else {
                warn!(workload = %workload.name, "Instance has no reachable address, skipping");
                continue;
            };
            let port = match label("API_HTTP_PORT").map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => port,
                Some(Err(_)) => {
                    warn!(workload = %workload.name, "Invalid API_HTTP_PORT label, using default port");
                    defaults.port
                }
                None => defaults.port,
            };
            let server_name = label("API_SERVER_NAME")
                .cloned()
                .unwrap_or_else(|| defaults.server_name.clone());
            let mut instance = Instance::new(address, port, server_name);
            instance.method = Method::Autoconf;
            instances.push(instance);
            continue;
        }

        let Some(server_name) = label("SERVER_NAME") else {
            continue;
        };
        let Some(id) = server_name.split_whitespace().next() else {
            warn!(workload = %workload.name, "Empty SERVER_NAME label, skipping service");
            continue;
        };

        let mut spec = ServiceSpec::new(id);
        let mut keys: Vec<(&String, &String)> = workload.labels.iter().collect();
        keys.sort();
        for (key, value) in keys {
            let Some(key) = key.strip_prefix(LABEL_PREFIX) else {
                continue;
            };
            if matches!(key, "SERVER_NAME" | "NAMESPACE") {
                continue;
            }
            if let Some(rest) = key.strip_prefix(CUSTOM_CONF_PREFIX) {
                match parse_custom_conf_key(rest) {
                    Some((config_type, name)) => custom_configs.push(CustomConfig::new(
                        Some(id.to_string()),
                        config_type,
                        name,
                        value.as_bytes(),
                        Method::Autoconf,
                    )),
                    None => warn!(workload = %workload.name, label = %key, "Invalid custom config label"),
                }
                continue;
            }
            spec.settings.insert(key.to_string(), value.clone());
        }
        services.push(spec);
    }

    Triad::new(instances, services, custom_configs)
}

// ==================== Docker ====================

/// Containers of the local Docker daemon
pub struct DockerSource {
    client: Docker,
    defaults: InstanceDefaults,
    namespaces: Vec<String>,
}

impl DockerSource {
    /// Connect to `docker_host` (`unix://` or `tcp://`), or to the local defaults
    pub fn connect(docker_host: Option<&str>, defaults: InstanceDefaults, namespaces: Vec<String>) -> Result<Self, FleetError> {
        let client = match docker_host {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host.trim_start_matches("unix://"), 120, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) => {
                return Err(FleetError::Invalid(format!(
                    "invalid docker_host '{host}', expected 'unix:///path/to/socket' or 'tcp://host:port'"
                )))
            }
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self {
            client,
            defaults,
            namespaces,
        })
    }
}

#[async_trait]
impl FleetSource for DockerSource {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn observe(&self) -> Result<Triad, FleetError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_PREFIX}INSTANCE")]);
        let mut workloads = self.list(filters).await?;

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_PREFIX}SERVER_NAME")]);
        workloads.extend(self.list(filters).await?);

        debug!(containers = workloads.len(), "Observed Docker containers");
        Ok(triad_from_workloads(&workloads, &self.defaults, &self.namespaces))
    }
}

impl DockerSource {
    async fn list(&self, filters: HashMap<String, Vec<String>>) -> Result<Vec<Workload>, FleetError> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Workload {
                    address: (!name.is_empty()).then(|| name.clone()),
                    name,
                    labels: c.labels.unwrap_or_default(),
                }
            })
            .collect())
    }
}

// ==================== Kubernetes ====================

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Pods, ingresses and config maps read from the Kubernetes API.
///
/// Instances are pods annotated `convoy.INSTANCE`. Services come from ingress
/// rules, one service per host. Custom configs come from config maps labelled
/// `convoy.CONFIG_TYPE` (optionally `convoy.CONFIG_SITE`).
pub struct PodSource {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    defaults: InstanceDefaults,
    namespaces: Vec<String>,
}

impl PodSource {
    /// Client for the API server the process runs in
    pub fn in_cluster(defaults: InstanceDefaults, namespaces: Vec<String>) -> Result<Self, FleetError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| FleetError::Kubernetes("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))?;
        let ca = std::fs::read(dir.join("ca.crt"))?;

        let client = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
            defaults,
            namespaces,
        })
    }

    /// Client for an explicit API URL, e.g. a `kubectl proxy`
    pub fn with_url(api_url: impl Into<String>, defaults: InstanceDefaults, namespaces: Vec<String>) -> Result<Self, FleetError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: None,
            defaults,
            namespaces,
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<Value>, FleetError> {
        let mut request = self.client.get(format!("{}{}", self.api_url, path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FleetError::Kubernetes(format!("GET {path} returned {}", response.status())));
        }
        let body: Value = response.json().await?;
        Ok(body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn pod_workload(pod: &Value) -> Workload {
    let metadata = pod.get("metadata");
    let mut labels = string_map(metadata.and_then(|m| m.get("annotations")));
    if let Some(ns) = metadata.and_then(|m| m.get("namespace")).and_then(Value::as_str) {
        labels.entry(format!("{LABEL_PREFIX}NAMESPACE")).or_insert_with(|| ns.to_string());
    }
    Workload {
        name: metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        address: pod
            .pointer("/status/podIP")
            .and_then(Value::as_str)
            .map(str::to_string),
        labels,
    }
}

/// One workload per ingress rule host. Paths become reverse proxy settings
/// pointing at the backend service.
fn ingress_workloads(ingress: &Value) -> Vec<Workload> {
    let metadata = ingress.get("metadata");
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or("default");
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let annotations = string_map(metadata.and_then(|m| m.get("annotations")));

    let rules = ingress
        .pointer("/spec/rules")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut workloads = Vec::new();
    for rule in rules {
        let Some(host) = rule.get("host").and_then(Value::as_str) else {
            warn!(ingress = %name, "Ingress rule without host, skipping");
            continue;
        };
        let mut labels = annotations.clone();
        labels.entry(format!("{LABEL_PREFIX}NAMESPACE")).or_insert_with(|| namespace.to_string());
        labels.insert(format!("{LABEL_PREFIX}SERVER_NAME"), host.to_string());

        let paths = rule
            .pointer("/http/paths")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut suffix = 0;
        for path in paths {
            let Some(service) = path.pointer("/backend/service/name").and_then(Value::as_str) else {
                continue;
            };
            let port = path
                .pointer("/backend/service/port/number")
                .and_then(Value::as_u64)
                .unwrap_or(80);
            let url = path.get("path").and_then(Value::as_str).unwrap_or("/");
            labels.insert(format!("{LABEL_PREFIX}USE_REVERSE_PROXY"), "yes".to_string());
            labels.insert(
                format!("{LABEL_PREFIX}REVERSE_PROXY_HOST_{suffix}"),
                format!("http://{service}.{namespace}.svc.cluster.local:{port}"),
            );
            labels.insert(format!("{LABEL_PREFIX}REVERSE_PROXY_URL_{suffix}"), url.to_string());
            suffix += 1;
        }

        workloads.push(Workload {
            name: format!("{name}/{host}"),
            address: None,
            labels,
        });
    }
    workloads
}

fn configmap_configs(configmap: &Value, namespaces: &[String]) -> Vec<CustomConfig> {
    let metadata = configmap.get("metadata");
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut labels = string_map(metadata.and_then(|m| m.get("labels")));
    labels.extend(string_map(metadata.and_then(|m| m.get("annotations"))));
    if let Some(ns) = metadata.and_then(|m| m.get("namespace")).and_then(Value::as_str) {
        labels.entry(format!("{LABEL_PREFIX}NAMESPACE")).or_insert_with(|| ns.to_string());
    }
    if !in_namespaces(&labels, namespaces) {
        return Vec::new();
    }

    let Some(raw_type) = labels.get(&format!("{LABEL_PREFIX}CONFIG_TYPE")) else {
        return Vec::new();
    };
    let Some(config_type) = CustomConfigType::parse(raw_type) else {
        warn!(configmap = %name, config_type = %raw_type, "Unknown custom config type, skipping");
        return Vec::new();
    };
    let site = labels.get(&format!("{LABEL_PREFIX}CONFIG_SITE")).cloned();

    let mut configs = Vec::new();
    for (key, value) in string_map(configmap.get("data")) {
        configs.push(CustomConfig::new(site.clone(), config_type, &key, value.into_bytes(), Method::Autoconf));
    }
    for (key, value) in string_map(configmap.get("binaryData")) {
        match base64::engine::general_purpose::STANDARD.decode(value.as_bytes()) {
            Ok(data) => configs.push(CustomConfig::new(site.clone(), config_type, &key, data, Method::Autoconf)),
            Err(e) => warn!(configmap = %name, key = %key, error = %e, "Invalid base64 in config map"),
        }
    }
    configs
}

#[async_trait]
impl FleetSource for PodSource {
    fn name(&self) -> &'static str {
        "pods"
    }

    async fn observe(&self) -> Result<Triad, FleetError> {
        let pods = self.list("/api/v1/pods").await?;
        let ingresses = self.list("/apis/networking.k8s.io/v1/ingresses").await?;
        let configmaps = self.list("/api/v1/configmaps").await?;

        let mut workloads: Vec<Workload> = pods.iter().map(pod_workload).collect();
        workloads.extend(ingresses.iter().flat_map(ingress_workloads));

        let mut triad = triad_from_workloads(&workloads, &self.defaults, &self.namespaces);
        triad
            .custom_configs
            .extend(configmaps.iter().flat_map(|cm| configmap_configs(cm, &self.namespaces)));

        debug!(
            pods = pods.len(),
            ingresses = ingresses.len(),
            configmaps = configmaps.len(),
            "Observed Kubernetes resources"
        );
        Ok(triad)
    }
}

/// Group settings into a flat `{service}_{key}` map plus `SERVER_NAME`
pub fn service_variables(triad: &Triad) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert(crate::resolver::SERVER_NAME.to_string(), triad.server_names());
    for service in &triad.services {
        for (key, value) in &service.settings {
            vars.insert(format!("{}_{}", service.id, key), value.clone());
        }
    }
    vars
}
