//! Setting catalog: the schema of every configuration key
//!
//! The catalog is built from the global `settings.json` manifest (loaded as
//! plugin `general`) plus every `*/plugin.json` found in the core and external
//! plugin directories. A plugin that fails validation is skipped with a warning;
//! the rest of the catalog still loads.

use crate::error::CatalogError;
use crate::model::{Method, SettingContext};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Id under which the global settings manifest is registered
pub const GENERAL_PLUGIN: &str = "general";

macro_rules! static_regex {
    ($name:ident, $re:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| {
                regex::RegexBuilder::new($re)
                    .size_limit(64 * (1 << 20))
                    .build()
                    .expect("static regex")
            })
        }
    };
}

static_regex!(plugin_id_re, r"^[\w.-]{1,64}$");
static_regex!(plugin_version_re, r"^\d+\.\d+(\.\d+)?$");
static_regex!(setting_id_re, r"^[A-Z0-9_]{1,256}$");
static_regex!(multiple_re, r"^[\w.-]{1,128}$");
static_regex!(job_name_re, r"^[\w.-]{1,128}$");
static_regex!(job_file_re, r"^[\w./-]{1,256}$");

/// Input widget type of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    Password,
    Text,
    Number,
    Check,
    Select,
    Multiselect,
    Multivalue,
}

/// One declared configuration key
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub id: String,
    pub plugin_id: String,
    pub context: SettingContext,
    pub default: String,
    pub help: String,
    pub label: String,
    pub regex: String,
    pub setting_type: SettingType,
    /// Group name when the setting may repeat as `ID_0`, `ID_1`, ...
    pub multiple: Option<String>,
    pub separator: Option<String>,
    pub select: Vec<String>,
}

impl Setting {
    pub fn new(id: impl Into<String>, context: SettingContext, default: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin_id: GENERAL_PLUGIN.to_string(),
            context,
            default: default.into(),
            help: String::new(),
            label: String::new(),
            regex: String::from("^.*$"),
            setting_type: SettingType::Text,
            multiple: None,
            separator: None,
            select: Vec::new(),
        }
    }

    pub fn with_regex(mut self, regex: impl Into<String>) -> Self {
        self.regex = regex.into();
        self
    }

    pub fn with_multiple(mut self, group: impl Into<String>) -> Self {
        self.multiple = Some(group.into());
        self
    }

    pub fn with_type(mut self, setting_type: SettingType) -> Self {
        self.setting_type = setting_type;
        self
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple.is_some()
    }

    pub fn is_multisite(&self) -> bool {
        self.context == SettingContext::Multisite
    }
}

/// How often a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Once,
    Minute,
    Hour,
    Day,
    Week,
}

impl Cadence {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(Self::Once),
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }

    /// Interval between runs; `None` for jobs that only run on run-once
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Once => None,
            Self::Minute => Some(Duration::from_secs(60)),
            Self::Hour => Some(Duration::from_secs(3600)),
            Self::Day => Some(Duration::from_secs(86_400)),
            Self::Week => Some(Duration::from_secs(604_800)),
        }
    }
}

/// A maintenance job declared by a plugin
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub plugin_id: String,
    /// Path relative to `{plugin_dir}/jobs/`
    pub file: String,
    pub every: Cadence,
    pub reload: bool,
    pub run_async: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, file: impl Into<String>, every: Cadence) -> Self {
        Self {
            name: name.into(),
            plugin_id: String::new(),
            file: file.into(),
            every,
            reload: false,
            run_async: false,
        }
    }

    pub fn with_reload(mut self, reload: bool) -> Self {
        self.reload = reload;
        self
    }

    pub fn with_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }
}

/// A loaded plugin with its settings and jobs
#[derive(Debug, Clone, PartialEq)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub stream: String,
    pub external: bool,
    pub method: Method,
    /// Directory holding `plugin.json` and `jobs/`
    pub path: Option<PathBuf>,
    pub checksum: Option<String>,
    pub settings: Vec<Setting>,
    pub jobs: Vec<JobSpec>,
}

impl Plugin {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: version.into(),
            stream: "no".to_string(),
            external: false,
            method: Method::Default,
            path: None,
            checksum: None,
            settings: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn with_setting(mut self, mut setting: Setting) -> Self {
        setting.plugin_id = self.id.clone();
        self.settings.push(setting);
        self
    }

    pub fn with_job(mut self, mut job: JobSpec) -> Self {
        job.plugin_id = self.id.clone();
        self.jobs.push(job);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Absolute path of a job artifact
    pub fn job_path(&self, job: &JobSpec) -> Option<PathBuf> {
        self.path.as_ref().map(|p| p.join("jobs").join(&job.file))
    }

    /// Read and validate a `plugin.json` manifest
    pub fn from_manifest(path: &Path, external: bool) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawPlugin = serde_json::from_str(&content).map_err(|source| CatalogError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let mut plugin = raw.validate()?;
        plugin.external = external;
        plugin.method = if external { Method::Manual } else { Method::Default };
        plugin.path = path.parent().map(Path::to_path_buf);
        Ok(plugin)
    }
}

#[derive(Debug, Deserialize)]
struct RawSetting {
    context: String,
    #[serde(default)]
    default: String,
    #[serde(default)]
    help: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    regex: String,
    #[serde(rename = "type")]
    setting_type: String,
    #[serde(default)]
    multiple: Option<String>,
    #[serde(default)]
    separator: Option<String>,
    #[serde(default)]
    select: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    name: String,
    file: String,
    every: String,
    #[serde(default)]
    reload: bool,
    #[serde(default, rename = "async")]
    run_async: bool,
}

#[derive(Debug, Deserialize)]
struct RawPlugin {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    version: String,
    #[serde(default = "default_stream")]
    stream: String,
    #[serde(default)]
    settings: BTreeMap<String, RawSetting>,
    #[serde(default)]
    jobs: Vec<RawJob>,
}

fn default_stream() -> String {
    "no".to_string()
}

impl RawPlugin {
    fn validate(self) -> Result<Plugin, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidPlugin {
            plugin: self.id.clone(),
            reason,
        };

        if !plugin_id_re().is_match(&self.id) {
            return Err(invalid("invalid id".to_string()));
        }
        if self.name.is_empty() || self.name.chars().count() > 128 {
            return Err(invalid("name must be 1 to 128 characters".to_string()));
        }
        if self.description.chars().count() > 256 {
            return Err(invalid("description longer than 256 characters".to_string()));
        }
        if !plugin_version_re().is_match(&self.version) {
            return Err(invalid(format!("invalid version {}", self.version)));
        }
        if !matches!(self.stream.as_str(), "yes" | "no" | "partial") {
            return Err(invalid(format!("invalid stream value {}", self.stream)));
        }

        let mut settings = Vec::with_capacity(self.settings.len());
        for (id, raw) in &self.settings {
            settings.push(validate_setting(&self.id, id, raw).map_err(invalid)?);
        }

        let mut jobs = Vec::with_capacity(self.jobs.len());
        for raw in &self.jobs {
            jobs.push(validate_job(&self.id, raw).map_err(invalid)?);
        }

        Ok(Plugin {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            stream: self.stream.clone(),
            external: false,
            method: Method::Default,
            path: None,
            checksum: None,
            settings,
            jobs,
        })
    }
}

fn validate_setting(plugin_id: &str, id: &str, raw: &RawSetting) -> Result<Setting, String> {
    if !setting_id_re().is_match(id) {
        return Err(format!("invalid setting id {id}"));
    }
    let context = SettingContext::parse(&raw.context)
        .ok_or_else(|| format!("setting {id} has invalid context {}", raw.context))?;
    if raw.default.chars().count() > 4096 {
        return Err(format!("setting {id} default longer than 4096 characters"));
    }
    if raw.help.chars().count() > 512 {
        return Err(format!("setting {id} help longer than 512 characters"));
    }
    if raw.label.chars().count() > 256 {
        return Err(format!("setting {id} label longer than 256 characters"));
    }
    if raw.regex.chars().count() > 1024 {
        return Err(format!("setting {id} regex longer than 1024 characters"));
    }
    let setting_type: SettingType = serde_json::from_value(serde_json::Value::String(raw.setting_type.clone()))
        .map_err(|_| format!("setting {id} has invalid type {}", raw.setting_type))?;
    if let Some(group) = &raw.multiple {
        if !multiple_re().is_match(group) {
            return Err(format!("setting {id} has invalid multiple group {group}"));
        }
    }
    let separator = if setting_type == SettingType::Multivalue {
        let sep = raw.separator.clone().unwrap_or_else(|| " ".to_string());
        if sep.is_empty() || sep.chars().count() > 10 {
            return Err(format!("setting {id} separator must be 1 to 10 characters"));
        }
        Some(sep)
    } else {
        raw.separator.clone()
    };

    Ok(Setting {
        id: id.to_string(),
        plugin_id: plugin_id.to_string(),
        context,
        default: raw.default.clone(),
        help: raw.help.clone(),
        label: raw.label.clone(),
        regex: raw.regex.clone(),
        setting_type,
        multiple: raw.multiple.clone(),
        separator,
        select: raw.select.clone(),
    })
}

fn validate_job(plugin_id: &str, raw: &RawJob) -> Result<JobSpec, String> {
    if !job_name_re().is_match(&raw.name) {
        return Err(format!("invalid job name {}", raw.name));
    }
    if !job_file_re().is_match(&raw.file) || raw.file.split('/').any(|part| part == "..") {
        return Err(format!("job {} has invalid file {}", raw.name, raw.file));
    }
    let every = Cadence::parse(&raw.every)
        .ok_or_else(|| format!("job {} has invalid cadence {}", raw.name, raw.every))?;
    Ok(JobSpec {
        name: raw.name.clone(),
        plugin_id: plugin_id.to_string(),
        file: raw.file.clone(),
        every,
        reload: raw.reload,
        run_async: raw.run_async,
    })
}

/// All loaded plugins and their settings, indexed by setting id
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    plugins: Vec<Plugin>,
    settings: BTreeMap<String, Setting>,
    /// `None` when the declared regex does not compile
    regexes: HashMap<String, Option<Regex>>,
    ignore_regex_check: bool,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from already validated plugins
    pub fn from_plugins(plugins: Vec<Plugin>) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for plugin in plugins {
            catalog.add_plugin(plugin)?;
        }
        Ok(catalog)
    }

    /// Load the global settings manifest and every plugin directory.
    ///
    /// A missing or unreadable global manifest is an error; individual plugins
    /// that fail validation are skipped.
    pub fn load(core_settings: &Path, core_plugins: &Path, external_plugins: &Path) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        catalog.add_plugin(load_general(core_settings)?)?;

        for (dir, external) in [(core_plugins, false), (external_plugins, true)] {
            for manifest in plugin_manifests(dir) {
                match Plugin::from_manifest(&manifest, external) {
                    Ok(plugin) => {
                        let id = plugin.id.clone();
                        if let Err(e) = catalog.add_plugin(plugin) {
                            warn!(plugin = %id, error = %e, "Skipping plugin");
                        }
                    }
                    Err(e) => warn!(path = %manifest.display(), error = %e, "Skipping invalid plugin manifest"),
                }
            }
        }

        if catalog.settings.is_empty() {
            return Err(CatalogError::Empty);
        }

        info!(
            plugins = catalog.plugins.len(),
            settings = catalog.settings.len(),
            "Setting catalog loaded"
        );
        Ok(catalog)
    }

    /// Register a plugin; rejects it whole if any of its setting ids is taken
    pub fn add_plugin(&mut self, plugin: Plugin) -> Result<(), CatalogError> {
        if self.plugins.iter().any(|p| p.id == plugin.id) {
            return Err(CatalogError::DuplicatePlugin(plugin.id));
        }
        for setting in &plugin.settings {
            if let Some(existing) = self.settings.get(&setting.id) {
                return Err(CatalogError::DuplicateSetting {
                    setting: setting.id.clone(),
                    plugin: plugin.id.clone(),
                    owner: existing.plugin_id.clone(),
                });
            }
        }

        for setting in &plugin.settings {
            let compiled = match Regex::new(&setting.regex) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(
                        key = %setting.id,
                        plugin = %plugin.id,
                        error = %e,
                        "Setting regex does not compile, value checks skipped"
                    );
                    None
                }
            };
            self.regexes.insert(setting.id.clone(), compiled);
            self.settings.insert(setting.id.clone(), setting.clone());
        }

        debug!(plugin = %plugin.id, settings = plugin.settings.len(), jobs = plugin.jobs.len(), "Plugin registered");
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn with_ignore_regex_check(mut self, ignore: bool) -> Self {
        if ignore {
            warn!("Setting value regex checks are disabled");
        }
        self.ignore_regex_check = ignore;
        self
    }

    pub fn ignores_regex_check(&self) -> bool {
        self.ignore_regex_check
    }

    pub fn setting(&self, id: &str) -> Option<&Setting> {
        self.settings.get(id)
    }

    /// Settings ordered by id
    pub fn settings(&self) -> impl Iterator<Item = &Setting> {
        self.settings.values()
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn plugin(&self, id: &str) -> Option<&Plugin> {
        self.plugins.iter().find(|p| p.id == id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = (&Plugin, &JobSpec)> {
        self.plugins.iter().flat_map(|p| p.jobs.iter().map(move |j| (p, j)))
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Check a value against the setting's regex.
    ///
    /// Returns `None` when the check is skipped: unknown setting, regex checks
    /// disabled, or a regex that did not compile.
    pub fn value_matches(&self, setting_id: &str, value: &str) -> Option<bool> {
        if self.ignore_regex_check {
            return None;
        }
        self.regexes
            .get(setting_id)
            .and_then(Option::as_ref)
            .map(|re| re.is_match(value))
    }
}

fn load_general(path: &Path) -> Result<Plugin, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: BTreeMap<String, RawSetting> = serde_json::from_str(&content).map_err(|source| CatalogError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut plugin = Plugin::new(GENERAL_PLUGIN, "General", "1.0");
    for (id, raw_setting) in &raw {
        match validate_setting(GENERAL_PLUGIN, id, raw_setting) {
            Ok(setting) => plugin.settings.push(setting),
            Err(reason) => warn!(key = %id, reason = %reason, "Skipping invalid global setting"),
        }
    }
    Ok(plugin)
}

/// `plugin.json` files one level below `dir`, sorted by path
fn plugin_manifests(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Plugin directory not readable");
            return Vec::new();
        }
    };
    let mut manifests: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join("plugin.json"))
        .filter(|path| path.is_file())
        .collect();
    manifests.sort();
    manifests
}
