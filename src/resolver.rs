//! Config resolver: merges catalog defaults, global overrides and per-service
//! overrides into one flat key/value map.
//!
//! Multi-valued settings use an open-ended suffix protocol: values are stored as
//! `ID_0`, `ID_1`, ... and readers enumerate suffixes from 0 until the first
//! missing one. Nothing past a gap is ever read.
//!
//! Externally supplied variables go through [`Snapshot::apply_overrides`], which
//! validates every key against the catalog and reports problems as
//! [`Violation`]s. Offending keys are dropped; the rest still apply.

use crate::catalog::Catalog;
use crate::model::{GlobalValue, Method, Service, ServiceSetting};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Key synthesized from the list of primary service ids
pub const SERVER_NAME: &str = "SERVER_NAME";

/// Why a supplied variable was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationReason {
    /// No setting with this id, with or without a numeric suffix
    UnknownSetting,
    /// Numeric suffix on a setting that does not repeat
    NotMultiple,
    /// Value does not match the setting's validation regex
    RegexMismatch,
    /// Service prefix on a global setting
    ScopeConflict,
    /// Existing value is owned by a method the writer may not overwrite
    ProvenanceConflict { owner: Method },
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSetting => f.write_str("unknown setting"),
            Self::NotMultiple => f.write_str("setting does not accept a numeric suffix"),
            Self::RegexMismatch => f.write_str("value does not match the setting regex"),
            Self::ScopeConflict => f.write_str("global setting cannot be set per service"),
            Self::ProvenanceConflict { owner } => write!(f, "value is owned by method {owner}"),
        }
    }
}

/// A dropped key and the reason it was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub key: String,
    pub reason: ViolationReason,
}

impl Violation {
    pub fn new(key: impl Into<String>, reason: ViolationReason) -> Self {
        Self { key: key.into(), reason }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

/// A variable name broken into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub service: Option<String>,
    pub setting_id: String,
    pub suffix: u32,
}

/// Split `[{service}_]{SETTING}[_{n}]` against the catalog.
///
/// The longest matching service prefix wins. An exact setting id is preferred
/// over a numeric suffix, so `FOO_1` names setting `FOO_1` when it exists.
pub fn parse_key(catalog: &Catalog, key: &str, service_ids: &[&str]) -> Result<ParsedKey, ViolationReason> {
    let mut services: Vec<&str> = service_ids.to_vec();
    services.sort_by_key(|s| std::cmp::Reverse(s.len()));

    for service in services {
        let Some(rest) = key.strip_prefix(service).and_then(|r| r.strip_prefix('_')) else {
            continue;
        };
        let Ok((setting_id, suffix)) = parse_setting(catalog, rest) else {
            continue;
        };
        let setting = catalog.setting(&setting_id).ok_or(ViolationReason::UnknownSetting)?;
        if !setting.is_multisite() {
            return Err(ViolationReason::ScopeConflict);
        }
        return Ok(ParsedKey {
            service: Some(service.to_string()),
            setting_id,
            suffix,
        });
    }

    let (setting_id, suffix) = parse_setting(catalog, key)?;
    Ok(ParsedKey {
        service: None,
        setting_id,
        suffix,
    })
}

fn parse_setting(catalog: &Catalog, key: &str) -> Result<(String, u32), ViolationReason> {
    if catalog.setting(key).is_some() {
        return Ok((key.to_string(), 0));
    }
    let Some((base, digits)) = key.rsplit_once('_') else {
        return Err(ViolationReason::UnknownSetting);
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ViolationReason::UnknownSetting);
    }
    let setting = catalog.setting(base).ok_or(ViolationReason::UnknownSetting)?;
    if !setting.is_multiple() {
        return Err(ViolationReason::NotMultiple);
    }
    let suffix = digits.parse::<u32>().map_err(|_| ViolationReason::UnknownSetting)?;
    Ok((base.to_string(), suffix))
}

/// Whether `vars` still carries the key of a stored row
fn is_supplied(vars: &BTreeMap<String, String>, key: &str, suffix: u32) -> bool {
    if suffix == 0 {
        vars.contains_key(key) || vars.contains_key(&format!("{key}_0"))
    } else {
        vars.contains_key(&format!("{key}_{suffix}"))
    }
}

/// Stored inputs of a resolution: globals, per-service overrides and services
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub globals: Vec<GlobalValue>,
    pub service_settings: Vec<ServiceSetting>,
    pub services: Vec<Service>,
}

impl Snapshot {
    pub fn new(globals: Vec<GlobalValue>, service_settings: Vec<ServiceSetting>, services: Vec<Service>) -> Self {
        Self {
            globals,
            service_settings,
            services,
        }
    }

    /// Build a snapshot from a flat variables file, bypassing the database
    pub fn from_variables(catalog: &Catalog, vars: &BTreeMap<String, String>) -> (Self, Vec<Violation>) {
        let mut snapshot = Self::default();
        let violations = snapshot.apply_overrides(catalog, vars, Method::Manual, false);
        (snapshot, violations)
    }

    pub fn resolve(&self, catalog: &Catalog) -> EffectiveConfig {
        resolve(catalog, &self.globals, &self.service_settings, &self.services)
    }

    /// Layer externally supplied variables on top of the stored values.
    ///
    /// Rows owned by `method` whose key is absent from `vars` are dropped first.
    /// `SERVER_NAME` lists the primary service ids: services `method` created
    /// that are missing from it are removed with their settings. Every other
    /// key must name a catalog setting and pass its regex. Provenance applies
    /// unless `force`.
    pub fn apply_overrides(
        &mut self,
        catalog: &Catalog,
        vars: &BTreeMap<String, String>,
        method: Method,
        force: bool,
    ) -> Vec<Violation> {
        let mut violations = Vec::new();

        self.drop_unsupplied(vars, method);
        if let Some(server_name) = vars.get(SERVER_NAME) {
            self.replace_services(server_name, method, force);
        }

        let service_ids: Vec<String> = self.services.iter().map(|s| s.id.clone()).collect();
        let service_refs: Vec<&str> = service_ids.iter().map(String::as_str).collect();

        for (key, value) in vars {
            if key == SERVER_NAME {
                continue;
            }
            let parsed = match parse_key(catalog, key, &service_refs) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    violations.push(Violation::new(key, reason));
                    continue;
                }
            };
            if catalog.value_matches(&parsed.setting_id, value) == Some(false) {
                violations.push(Violation::new(key, ViolationReason::RegexMismatch));
                continue;
            }
            let result = match &parsed.service {
                Some(service) => self.upsert_service_setting(service, &parsed, value, method, force),
                None => self.upsert_global(catalog, &parsed, value, method, force),
            };
            if let Err(reason) = result {
                violations.push(Violation::new(key, reason));
            }
        }

        for violation in &violations {
            warn!(key = %violation.key, reason = %violation.reason, method = %method, "Dropping variable");
        }
        violations
    }

    fn drop_unsupplied(&mut self, vars: &BTreeMap<String, String>, method: Method) {
        let before = self.globals.len() + self.service_settings.len();
        self.globals
            .retain(|g| g.method != method || is_supplied(vars, &g.setting_id, g.suffix));
        self.service_settings.retain(|s| {
            s.method != method || is_supplied(vars, &format!("{}_{}", s.service_id, s.setting_id), s.suffix)
        });
        let dropped = before - self.globals.len() - self.service_settings.len();
        if dropped > 0 {
            debug!(method = %method, dropped, "Removing settings no longer supplied");
        }
    }

    fn replace_services(&mut self, server_name: &str, method: Method, force: bool) {
        let wanted: Vec<&str> = server_name.split_whitespace().collect();
        let wanted_set: HashSet<&str> = wanted.iter().copied().collect();

        let mut removed = Vec::new();
        self.services.retain(|service| {
            if wanted_set.contains(service.id.as_str()) || !(force || service.method == method) {
                return true;
            }
            removed.push(service.id.clone());
            false
        });
        if !removed.is_empty() {
            debug!(services = ?removed, method = %method, "Removing services");
            self.service_settings.retain(|s| !removed.contains(&s.service_id));
        }

        for id in wanted {
            if !self.services.iter().any(|s| s.id == id) {
                self.services.push(Service::new(id, method));
            }
        }
    }

    fn upsert_global(
        &mut self,
        catalog: &Catalog,
        parsed: &ParsedKey,
        value: &str,
        method: Method,
        force: bool,
    ) -> Result<(), ViolationReason> {
        let existing = self
            .globals
            .iter()
            .position(|g| g.setting_id == parsed.setting_id && g.suffix == parsed.suffix);
        if let Some(idx) = existing {
            let owner = self.globals[idx].method;
            if !force && !method.may_overwrite(owner) {
                return Err(ViolationReason::ProvenanceConflict { owner });
            }
        }

        // A single-valued setting set back to its default needs no row
        let is_default = catalog
            .setting(&parsed.setting_id)
            .is_some_and(|s| !s.is_multiple() && s.default == value);
        match (existing, is_default) {
            (Some(idx), true) => {
                self.globals.remove(idx);
            }
            (Some(idx), false) => {
                self.globals[idx].value = value.to_string();
                self.globals[idx].method = method;
            }
            (None, true) => {}
            (None, false) => self
                .globals
                .push(GlobalValue::new(&parsed.setting_id, parsed.suffix, value, method)),
        }
        Ok(())
    }

    fn upsert_service_setting(
        &mut self,
        service: &str,
        parsed: &ParsedKey,
        value: &str,
        method: Method,
        force: bool,
    ) -> Result<(), ViolationReason> {
        let existing = self.service_settings.iter_mut().find(|s| {
            s.service_id == service && s.setting_id == parsed.setting_id && s.suffix == parsed.suffix
        });
        match existing {
            Some(row) => {
                if !force && !method.may_overwrite(row.method) {
                    return Err(ViolationReason::ProvenanceConflict { owner: row.method });
                }
                row.value = value.to_string();
                row.method = method;
            }
            None => self.service_settings.push(ServiceSetting::new(
                service,
                &parsed.setting_id,
                parsed.suffix,
                value,
                method,
            )),
        }
        Ok(())
    }
}

/// Resolve stored values into the effective key/value map.
///
/// Pure: the same inputs always produce the same map. Draft services are left
/// out entirely.
pub fn resolve(
    catalog: &Catalog,
    globals: &[GlobalValue],
    service_settings: &[ServiceSetting],
    services: &[Service],
) -> EffectiveConfig {
    let global_values: HashMap<(&str, u32), &str> = globals
        .iter()
        .map(|g| ((g.setting_id.as_str(), g.suffix), g.value.as_str()))
        .collect();
    let service_values: HashMap<(&str, &str, u32), &str> = service_settings
        .iter()
        .map(|s| ((s.service_id.as_str(), s.setting_id.as_str(), s.suffix), s.value.as_str()))
        .collect();
    let active: Vec<&str> = services
        .iter()
        .filter(|s| !s.is_draft)
        .map(|s| s.id.as_str())
        .collect();

    let mut values = BTreeMap::new();

    for setting in catalog.settings() {
        let id = setting.id.as_str();

        if id != SERVER_NAME {
            if setting.is_multiple() {
                let mut suffix = 0;
                while let Some(value) = global_values.get(&(id, suffix)) {
                    values.insert(format!("{id}_{suffix}"), value.to_string());
                    suffix += 1;
                }
            } else {
                let value = global_values.get(&(id, 0)).copied().unwrap_or(setting.default.as_str());
                values.insert(id.to_string(), value.to_string());
            }
        }

        if !setting.is_multisite() {
            continue;
        }

        for service in &active {
            if setting.is_multiple() {
                let mut suffix = 0;
                loop {
                    let own = service_values.get(&(*service, id, suffix));
                    let global = global_values.get(&(id, suffix));
                    match (own, global) {
                        (Some(value), _) => {
                            values.insert(format!("{service}_{id}_{suffix}"), value.to_string());
                        }
                        (None, Some(value)) => {
                            if *value != setting.default {
                                values.insert(format!("{service}_{id}_{suffix}"), value.to_string());
                            }
                        }
                        (None, None) => break,
                    }
                    suffix += 1;
                }
            } else if let Some(value) = service_values.get(&(*service, id, 0)) {
                values.insert(format!("{service}_{id}"), value.to_string());
            } else if let Some(value) = global_values.get(&(id, 0)) {
                if *value != setting.default {
                    values.insert(format!("{service}_{id}"), value.to_string());
                }
            }
        }
    }

    values.insert(SERVER_NAME.to_string(), active.join(" "));
    EffectiveConfig { values }
}

/// The flat, resolved configuration handed to the renderer and to jobs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveConfig {
    values: BTreeMap<String, String>,
}

impl EffectiveConfig {
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value of `key` as seen by `service`: its own qualified key, else the global one
    pub fn service_value(&self, service: &str, key: &str) -> Option<&str> {
        self.get(&format!("{service}_{key}")).or_else(|| self.get(key))
    }

    /// Primary service ids, in `SERVER_NAME` order
    pub fn services(&self) -> Vec<&str> {
        self.get(SERVER_NAME)
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.values
    }

    /// `KEY=value` lines sorted by key
    pub fn to_env_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Write the snapshot file atomically (temp file in the same directory, then rename)
    pub fn write_snapshot(&self, path: &Path) -> std::io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_env_string().as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), keys = self.values.len(), "Wrote variables snapshot");
        Ok(())
    }
}

/// Read a `KEY=value` variables file. Blank lines and `#` comments are skipped.
pub fn read_variables(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let mut vars = BTreeMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                vars.insert(key.trim().to_string(), value.to_string());
            }
            _ => warn!(path = %path.display(), line = lineno + 1, "Ignoring malformed variables line"),
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Plugin, Setting};
    use crate::model::SettingContext;
    use tempfile::TempDir;

    fn catalog() -> Catalog {
        let general = Plugin::new("general", "General", "1.0")
            .with_setting(Setting::new("SERVER_NAME", SettingContext::Multisite, "www.example.com"))
            .with_setting(Setting::new("USE_CORS", SettingContext::Global, "no").with_regex("^(yes|no)$"))
            .with_setting(Setting::new("LOG_LEVEL", SettingContext::Global, "notice"))
            .with_setting(Setting::new("MAX_CLIENT_SIZE", SettingContext::Multisite, "5m"));
        let proxy = Plugin::new("reverseproxy", "Reverse proxy", "1.0")
            .with_setting(Setting::new("REVERSE_PROXY_URL", SettingContext::Multisite, "").with_multiple("rp"))
            .with_setting(Setting::new("REVERSE_PROXY_HOST", SettingContext::Multisite, "").with_multiple("rp"));
        Catalog::from_plugins(vec![general, proxy]).unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_key_forms() {
        let catalog = catalog();
        let services = ["a.com", "api.a.com"];

        let parsed = parse_key(&catalog, "REVERSE_PROXY_URL_3", &services).unwrap();
        assert_eq!((parsed.service, parsed.setting_id.as_str(), parsed.suffix), (None, "REVERSE_PROXY_URL", 3));

        let parsed = parse_key(&catalog, "api.a.com_REVERSE_PROXY_URL", &services).unwrap();
        assert_eq!(parsed.service.as_deref(), Some("api.a.com"));
        assert_eq!(parsed.suffix, 0);

        assert_eq!(parse_key(&catalog, "USE_CORS_1", &services), Err(ViolationReason::NotMultiple));
        assert_eq!(parse_key(&catalog, "a.com_USE_CORS", &services), Err(ViolationReason::ScopeConflict));
        assert_eq!(parse_key(&catalog, "NOPE", &services), Err(ViolationReason::UnknownSetting));
        assert_eq!(parse_key(&catalog, "b.com_USE_CORS", &services), Err(ViolationReason::UnknownSetting));
    }

    #[test]
    fn test_multiplicity_stops_at_first_gap() {
        let catalog = catalog();
        let globals = vec![
            GlobalValue::new("REVERSE_PROXY_URL", 0, "/a", Method::Ui),
            GlobalValue::new("REVERSE_PROXY_URL", 1, "/b", Method::Ui),
            GlobalValue::new("REVERSE_PROXY_URL", 2, "/c", Method::Ui),
            GlobalValue::new("REVERSE_PROXY_URL", 4, "/e", Method::Ui),
        ];
        let config = resolve(&catalog, &globals, &[], &[]);

        let urls: Vec<_> = config.iter().filter(|(k, _)| k.starts_with("REVERSE_PROXY_URL")).collect();
        assert_eq!(urls.len(), 3);
        assert!(config.get("REVERSE_PROXY_URL_3").is_none());
        assert!(config.get("REVERSE_PROXY_URL_4").is_none());
    }

    #[test]
    fn test_service_fallback_only_when_not_default() {
        let catalog = catalog();
        let services = vec![Service::new("a.com", Method::Ui)];
        let globals = vec![GlobalValue::new("MAX_CLIENT_SIZE", 0, "5m", Method::Ui)];
        let config = resolve(&catalog, &globals, &[], &services);
        assert!(config.get("a.com_MAX_CLIENT_SIZE").is_none());
        assert_eq!(config.service_value("a.com", "MAX_CLIENT_SIZE"), Some("5m"));

        let globals = vec![GlobalValue::new("MAX_CLIENT_SIZE", 0, "10m", Method::Ui)];
        let config = resolve(&catalog, &globals, &[], &services);
        assert_eq!(config.get("a.com_MAX_CLIENT_SIZE"), Some("10m"));
    }

    #[test]
    fn test_service_multiple_merges_own_and_global() {
        let catalog = catalog();
        let services = vec![Service::new("a.com", Method::Ui)];
        let globals = vec![
            GlobalValue::new("REVERSE_PROXY_URL", 0, "/", Method::Ui),
            GlobalValue::new("REVERSE_PROXY_URL", 1, "/static", Method::Ui),
        ];
        let settings = vec![ServiceSetting::new("a.com", "REVERSE_PROXY_URL", 0, "/api", Method::Ui)];
        let config = resolve(&catalog, &globals, &settings, &services);

        assert_eq!(config.get("a.com_REVERSE_PROXY_URL_0"), Some("/api"));
        assert_eq!(config.get("a.com_REVERSE_PROXY_URL_1"), Some("/static"));
        assert!(config.get("a.com_REVERSE_PROXY_URL_2").is_none());
    }

    #[test]
    fn test_drafts_are_excluded() {
        let catalog = catalog();
        let mut draft = Service::new("draft.com", Method::Ui);
        draft.is_draft = true;
        let services = vec![Service::new("a.com", Method::Ui), draft];
        let settings = vec![ServiceSetting::new("draft.com", "MAX_CLIENT_SIZE", 0, "1m", Method::Ui)];
        let config = resolve(&catalog, &[], &settings, &services);

        assert_eq!(config.get(SERVER_NAME), Some("a.com"));
        assert!(config.get("draft.com_MAX_CLIENT_SIZE").is_none());
    }

    #[test]
    fn test_overrides_collect_violations_and_keep_valid_keys() {
        let catalog = catalog();
        let (snapshot, violations) = Snapshot::from_variables(
            &catalog,
            &vars(&[
                ("SERVER_NAME", "a.com b.com"),
                ("USE_CORS", "maybe"),
                ("LOG_LEVEL", "debug"),
                ("a.com_USE_CORS", "yes"),
                ("b.com_REVERSE_PROXY_URL_0", "/b"),
                ("UNKNOWN_KEY", "x"),
            ]),
        );

        let mut keys: Vec<_> = violations.iter().map(|v| v.key.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["UNKNOWN_KEY", "USE_CORS", "a.com_USE_CORS"]);

        let config = snapshot.resolve(&catalog);
        assert_eq!(config.get("LOG_LEVEL"), Some("debug"));
        assert_eq!(config.get("USE_CORS"), Some("no"));
        assert_eq!(config.get("b.com_REVERSE_PROXY_URL_0"), Some("/b"));
        assert_eq!(config.services(), vec!["a.com", "b.com"]);
    }

    #[test]
    fn test_provenance_blocks_ui_over_autoconf() {
        let catalog = catalog();
        let mut snapshot = Snapshot::new(
            vec![GlobalValue::new("LOG_LEVEL", 0, "info", Method::Autoconf)],
            vec![],
            vec![Service::new("a.com", Method::Autoconf)],
        );

        let violations = snapshot.apply_overrides(&catalog, &vars(&[("LOG_LEVEL", "debug")]), Method::Ui, false);
        assert_eq!(
            violations,
            vec![Violation::new(
                "LOG_LEVEL",
                ViolationReason::ProvenanceConflict { owner: Method::Autoconf }
            )]
        );
        assert_eq!(snapshot.globals[0].value, "info");

        let violations = snapshot.apply_overrides(&catalog, &vars(&[("LOG_LEVEL", "debug")]), Method::Ui, true);
        assert!(violations.is_empty());
        assert_eq!(snapshot.globals[0].value, "debug");
        assert_eq!(snapshot.globals[0].method, Method::Ui);
    }

    #[test]
    fn test_server_name_removes_only_own_services() {
        let catalog = catalog();
        let mut snapshot = Snapshot::new(
            vec![],
            vec![
                ServiceSetting::new("old.com", "MAX_CLIENT_SIZE", 0, "1m", Method::Ui),
                ServiceSetting::new("auto.com", "MAX_CLIENT_SIZE", 0, "2m", Method::Autoconf),
            ],
            vec![Service::new("auto.com", Method::Autoconf), Service::new("old.com", Method::Ui)],
        );

        let violations = snapshot.apply_overrides(&catalog, &vars(&[("SERVER_NAME", "new.com")]), Method::Ui, false);

        assert!(violations.is_empty());
        let ids: Vec<_> = snapshot.services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["auto.com", "new.com"]);
        assert_eq!(snapshot.service_settings.len(), 1);
        assert_eq!(snapshot.service_settings[0].service_id, "auto.com");

        // autoconf may overwrite anything but still leaves ui services alone
        let violations =
            snapshot.apply_overrides(&catalog, &vars(&[("SERVER_NAME", "other.com")]), Method::Autoconf, false);
        assert!(violations.is_empty());
        let ids: Vec<_> = snapshot.services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new.com", "other.com"]);
        assert!(snapshot.service_settings.is_empty());
    }

    #[test]
    fn test_settings_missing_from_a_later_save_are_dropped() {
        let catalog = catalog();
        let mut snapshot = Snapshot::new(
            vec![GlobalValue::new("USE_CORS", 0, "yes", Method::Autoconf)],
            vec![],
            vec![],
        );
        let first = vars(&[
            ("SERVER_NAME", "a.com"),
            ("LOG_LEVEL", "debug"),
            ("a.com_MAX_CLIENT_SIZE", "10m"),
            ("a.com_REVERSE_PROXY_URL_0", "/one"),
            ("a.com_REVERSE_PROXY_URL_1", "/two"),
        ]);
        assert!(snapshot.apply_overrides(&catalog, &first, Method::Ui, false).is_empty());
        assert_eq!(snapshot.service_settings.len(), 3);

        let second = vars(&[("SERVER_NAME", "a.com"), ("a.com_REVERSE_PROXY_URL", "/one")]);
        assert!(snapshot.apply_overrides(&catalog, &second, Method::Ui, false).is_empty());

        let config = snapshot.resolve(&catalog);
        assert_eq!(config.get("LOG_LEVEL"), Some("notice"));
        assert_eq!(config.get("USE_CORS"), Some("yes"));
        assert_eq!(config.get("a.com_MAX_CLIENT_SIZE"), None);
        assert_eq!(config.get("a.com_REVERSE_PROXY_URL_0"), Some("/one"));
        assert_eq!(config.get("a.com_REVERSE_PROXY_URL_1"), None);
    }

    #[test]
    fn test_setting_back_to_default_drops_row() {
        let catalog = catalog();
        let mut snapshot = Snapshot::new(vec![GlobalValue::new("LOG_LEVEL", 0, "info", Method::Ui)], vec![], vec![]);
        let violations = snapshot.apply_overrides(&catalog, &vars(&[("LOG_LEVEL", "notice")]), Method::Ui, false);
        assert!(violations.is_empty());
        assert!(snapshot.globals.is_empty());
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/variables.env");
        let config = EffectiveConfig::from_map(vars(&[("B", "2"), ("A", "x=y"), ("SERVER_NAME", "a.com")]));

        config.write_snapshot(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "A=x=y\nB=2\nSERVER_NAME=a.com\n");
        assert_eq!(read_variables(&path).unwrap(), config.into_map());
    }

    #[test]
    fn test_read_variables_skips_comments_and_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vars.env");
        std::fs::write(&path, "# comment\n\nUSE_CORS=yes\nnot a pair\n=value\nEMPTY=\n").unwrap();

        let parsed = read_variables(&path).unwrap();
        assert_eq!(parsed, vars(&[("USE_CORS", "yes"), ("EMPTY", "")]));
    }
}
