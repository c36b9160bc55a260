//! On-disk custom config tree: `{root}/{type}/[{service_id}/]{name}.conf`
//!
//! The tree only exists for the duration of an apply. It is written from the
//! database rows, pushed to the fleet, then pruned.

use crate::model::{CustomConfig, CustomConfigType};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of writing a set of custom configs
#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub written: Vec<PathBuf>,
    pub failed: Vec<String>,
}

impl WriteOutcome {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CustomConfigTree {
    root: PathBuf,
}

impl CustomConfigTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a config lives on disk, or `None` if its name or service would
    /// escape the tree
    pub fn path_for(&self, config: &CustomConfig) -> Option<PathBuf> {
        if !is_safe_component(&config.name) {
            return None;
        }
        let mut path = self.root.join(config.config_type.as_str());
        if let Some(service) = &config.service_id {
            if !is_safe_component(service) {
                return None;
            }
            path.push(service);
        }
        path.push(format!("{}.conf", config.name));
        Some(path)
    }

    /// Write every config. A failing file is recorded and the rest still get written.
    pub fn write(&self, configs: &[CustomConfig]) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();

        for config in configs {
            let label = format!(
                "{}/{}{}",
                config.config_type,
                config.service_id.as_deref().map(|s| format!("{s}/")).unwrap_or_default(),
                config.name
            );
            let Some(path) = self.path_for(config) else {
                warn!(config = %label, "Refusing to write custom config with unsafe name");
                outcome.failed.push(label);
                continue;
            };
            match write_file(&path, &config.data) {
                Ok(()) => {
                    debug!(path = %path.display(), "Wrote custom config");
                    outcome.written.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to write custom config");
                    outcome.failed.push(label);
                }
            }
        }

        outcome
    }

    /// Delete the given files, then any service or type directory left empty
    pub fn prune(&self, written: &[PathBuf]) -> io::Result<()> {
        let mut first_error = None;
        for path in written {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove custom config");
                    first_error.get_or_insert(e);
                }
            }
        }

        for config_type in CustomConfigType::ALL {
            let type_dir = self.root.join(config_type.as_str());
            let Ok(entries) = std::fs::read_dir(&type_dir) else {
                continue;
            };
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if path.is_dir() {
                    remove_if_empty(&path);
                }
            }
            remove_if_empty(&type_dir);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)
}

fn remove_if_empty(dir: &Path) {
    let is_empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if is_empty {
        if let Err(e) = std::fs::remove_dir(dir) {
            debug!(path = %dir.display(), error = %e, "Could not remove empty directory");
        }
    }
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains('/') && !s.contains('\\') && !s.contains('\0')
}
