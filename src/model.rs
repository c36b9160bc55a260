//! Core entities shared by the resolver, the reconciler and the scheduler
//!
//! Everything here is plain data. Persistence lives in `db`, validation in
//! `catalog` and `resolver`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Subsystem that last wrote a value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Default,
    Ui,
    Scheduler,
    Autoconf,
    Manual,
    Wizard,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "default" => Some(Self::Default),
            "ui" => Some(Self::Ui),
            "scheduler" => Some(Self::Scheduler),
            "autoconf" => Some(Self::Autoconf),
            "manual" => Some(Self::Manual),
            "wizard" => Some(Self::Wizard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Ui => "ui",
            Self::Scheduler => "scheduler",
            Self::Autoconf => "autoconf",
            Self::Manual => "manual",
            Self::Wizard => "wizard",
        }
    }

    /// Whether a write from `self` may replace a value owned by `owner`.
    ///
    /// Default-owned values are free for anyone. Otherwise only the owner
    /// (the UI and the setup wizard count as one interactive owner) or the
    /// orchestrator watcher may overwrite.
    pub fn may_overwrite(self, owner: Method) -> bool {
        if owner == Method::Default || self == owner {
            return true;
        }
        match (self, owner) {
            (Method::Autoconf, _) => true,
            (Method::Ui, Method::Wizard) | (Method::Wizard, Method::Ui) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a setting may be overridden per service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingContext {
    #[default]
    Global,
    Multisite,
}

impl SettingContext {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "multisite" => Some(Self::Multisite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Multisite => "multisite",
        }
    }
}

/// A virtual host, identified by its primary server name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub is_draft: bool,
}

impl Service {
    pub fn new(id: impl Into<String>, method: Method) -> Self {
        Self {
            id: id.into(),
            method,
            is_draft: false,
        }
    }
}

/// Persisted global override of a setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalValue {
    pub setting_id: String,
    pub suffix: u32,
    pub value: String,
    pub method: Method,
}

impl GlobalValue {
    pub fn new(setting_id: impl Into<String>, suffix: u32, value: impl Into<String>, method: Method) -> Self {
        Self {
            setting_id: setting_id.into(),
            suffix,
            value: value.into(),
            method,
        }
    }
}

/// Per-service override of a multisite setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSetting {
    pub service_id: String,
    pub setting_id: String,
    pub suffix: u32,
    pub value: String,
    pub method: Method,
}

impl ServiceSetting {
    pub fn new(
        service_id: impl Into<String>,
        setting_id: impl Into<String>,
        suffix: u32,
        value: impl Into<String>,
        method: Method,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            setting_id: setting_id.into(),
            suffix,
            value: value.into(),
            method,
        }
    }
}

/// Kinds of raw configuration snippets an instance can include
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CustomConfigType {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "server-http")]
    ServerHttp,
    #[serde(rename = "server-stream")]
    ServerStream,
    #[serde(rename = "default-server-http")]
    DefaultServerHttp,
    #[serde(rename = "default-server-stream")]
    DefaultServerStream,
    #[serde(rename = "modsec")]
    Modsec,
    #[serde(rename = "modsec-crs")]
    ModsecCrs,
    #[serde(rename = "crs-plugins-before")]
    CrsPluginsBefore,
    #[serde(rename = "crs-plugins-after")]
    CrsPluginsAfter,
}

impl CustomConfigType {
    pub const ALL: [CustomConfigType; 10] = [
        Self::Http,
        Self::Stream,
        Self::ServerHttp,
        Self::ServerStream,
        Self::DefaultServerHttp,
        Self::DefaultServerStream,
        Self::Modsec,
        Self::ModsecCrs,
        Self::CrsPluginsBefore,
        Self::CrsPluginsAfter,
    ];

    /// Accepts both `server-http` and `SERVER_HTTP` spellings
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|t| t.as_str() == normalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Stream => "stream",
            Self::ServerHttp => "server-http",
            Self::ServerStream => "server-stream",
            Self::DefaultServerHttp => "default-server-http",
            Self::DefaultServerStream => "default-server-stream",
            Self::Modsec => "modsec",
            Self::ModsecCrs => "modsec-crs",
            Self::CrsPluginsBefore => "crs-plugins-before",
            Self::CrsPluginsAfter => "crs-plugins-after",
        }
    }
}

impl fmt::Display for CustomConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw snippet attached to one service, or to every service when `service_id` is `None`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomConfig {
    pub service_id: Option<String>,
    pub config_type: CustomConfigType,
    pub name: String,
    pub data: Vec<u8>,
    pub checksum: String,
    pub method: Method,
}

impl CustomConfig {
    /// Build a custom config, computing its content checksum.
    ///
    /// A trailing `.conf` on the name is dropped; the on-disk writer adds it back.
    pub fn new(
        service_id: Option<String>,
        config_type: CustomConfigType,
        name: &str,
        data: impl Into<Vec<u8>>,
        method: Method,
    ) -> Self {
        let data = data.into();
        let name = name.strip_suffix(".conf").unwrap_or(name).to_string();
        Self {
            service_id,
            config_type,
            name,
            checksum: checksum(&data),
            data,
            method,
        }
    }

    fn sort_key(&self) -> (CustomConfigType, Option<&str>, &str) {
        (self.config_type, self.service_id.as_deref(), self.name.as_str())
    }
}

/// Hex-encoded sha256 of a payload
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Health of a proxy instance as last observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Loading,
    Up,
    Down,
}

impl InstanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loading" => Some(Self::Loading),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running proxy instance reachable over its control API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub hostname: String,
    pub port: u16,
    /// Host header sent with every control call
    pub server_name: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(hostname: impl Into<String>, port: u16, server_name: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            server_name: server_name.into(),
            method: Method::Default,
            status: InstanceStatus::Loading,
            last_seen: None,
        }
    }

    /// Base URL of the control API
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }

    /// Fields that define "the same instance" across observations.
    /// Status and last-seen churn on every poll and are ignored.
    fn identity(&self) -> (&str, u16, &str) {
        (self.hostname.as_str(), self.port, self.server_name.as_str())
    }
}

/// A service as observed by a fleet source, with its unprefixed variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// One execution of a scheduled job; append-only history
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub job_name: String,
    pub success: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

/// The (instances, services, custom configs) tuple compared across reconciliation ticks
#[derive(Debug, Clone, Default)]
pub struct Triad {
    pub instances: Vec<Instance>,
    pub services: Vec<ServiceSpec>,
    pub custom_configs: Vec<CustomConfig>,
}

impl Triad {
    pub fn new(instances: Vec<Instance>, services: Vec<ServiceSpec>, custom_configs: Vec<CustomConfig>) -> Self {
        Self {
            instances,
            services,
            custom_configs,
        }
    }

    /// Order-insensitive structural equality of all three members
    pub fn same_as(&self, other: &Triad) -> bool {
        let mut a: Vec<_> = self.instances.iter().map(Instance::identity).collect();
        let mut b: Vec<_> = other.instances.iter().map(Instance::identity).collect();
        a.sort_unstable();
        b.sort_unstable();
        if a != b {
            return false;
        }

        let mut a: Vec<_> = self.services.iter().collect();
        let mut b: Vec<_> = other.services.iter().collect();
        a.sort_by(|x, y| x.id.cmp(&y.id));
        b.sort_by(|x, y| x.id.cmp(&y.id));
        if a != b {
            return false;
        }

        let mut a: Vec<_> = self.custom_configs.iter().collect();
        let mut b: Vec<_> = other.custom_configs.iter().collect();
        a.sort_by(|x, y| x.sort_key().cmp(&y.sort_key()));
        b.sort_by(|x, y| x.sort_key().cmp(&y.sort_key()));
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| x.sort_key() == y.sort_key() && x.checksum == y.checksum)
    }

    /// Space-joined primary server names
    pub fn server_names(&self) -> String {
        self.services
            .iter()
            .map(|s| s.id.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
