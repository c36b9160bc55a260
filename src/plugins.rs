//! External plugin installation from a gzip tarball URL

use crate::catalog::Plugin;
use crate::error::PluginError;
use crate::model::checksum;
use crate::ControlContext;
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DOWNLOAD_ATTEMPTS: u32 = 3;

const MANIFEST: &str = "plugin.json";

pub struct PluginInstaller {
    client: reqwest::Client,
    dest: PathBuf,
    attempts: u32,
    backoff: Duration,
}

impl PluginInstaller {
    /// Installs into `dest`, the external plugins directory
    pub fn new(dest: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::api::USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PluginError::Download {
                url: String::new(),
                attempts: 0,
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            dest: dest.into(),
            attempts: DOWNLOAD_ATTEMPTS,
            backoff: Duration::from_secs(1),
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Download, unpack and register the plugins found at `url`, then reload
    /// the catalog. Returns the installed plugins as loaded.
    pub async fn install_from_url(&self, ctx: &ControlContext, url: &str) -> Result<Vec<Plugin>, PluginError> {
        let archive = self.download(url).await?;
        let sum = checksum(&archive);
        debug!(url = %url, bytes = archive.len(), checksum = %sum, "Plugin archive downloaded");

        std::fs::create_dir_all(&self.dest)?;
        let staging = tempfile::TempDir::new_in(&self.dest)?;
        tar::Archive::new(GzDecoder::new(archive.as_slice())).unpack(staging.path())?;

        let manifests = find_manifests(staging.path());
        if manifests.is_empty() {
            return Err(PluginError::NoManifest);
        }

        let catalog = ctx.catalog();
        let mut staged = Vec::with_capacity(manifests.len());
        for manifest in &manifests {
            let plugin = Plugin::from_manifest(manifest, true)?;
            if catalog.plugin(&plugin.id).is_some_and(|p| !p.external) {
                return Err(PluginError::CoreConflict(plugin.id));
            }
            let dir = manifest.parent().unwrap_or(staging.path()).to_path_buf();
            staged.push((plugin.id, dir));
        }

        let mut ids = Vec::with_capacity(staged.len());
        for (id, dir) in staged {
            let target = self.dest.join(&id);
            if target.exists() {
                info!(plugin = %id, "Replacing installed plugin");
                std::fs::remove_dir_all(&target)?;
            }
            std::fs::rename(&dir, &target)?;
            ids.push(id);
        }
        drop(staging);

        let catalog = ctx.reload_catalog().map_err(PluginError::Reload)?;
        let mut installed = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Err(e) = ctx.db.set_plugin_checksum(id, &sum) {
                warn!(plugin = %id, error = %e, "Failed to record plugin checksum");
            }
            match catalog.plugin(id) {
                Some(plugin) => {
                    let mut plugin = plugin.clone();
                    plugin.checksum = Some(sum.clone());
                    installed.push(plugin);
                }
                None => warn!(plugin = %id, "Installed plugin was not loaded"),
            }
        }

        info!(plugins = ?ids, url = %url, "External plugins installed");
        Ok(installed)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, PluginError> {
        let mut reason = String::new();
        for attempt in 1..=self.attempts {
            match self.fetch(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "Plugin download failed");
                    reason = e;
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(PluginError::Download {
            url: url.to_string(),
            attempts: self.attempts,
            reason,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }
}

/// `plugin.json` at the archive root, or one level down
fn find_manifests(root: &Path) -> Vec<PathBuf> {
    let top = root.join(MANIFEST);
    if top.is_file() {
        return vec![top];
    }
    let mut found: Vec<PathBuf> = std::fs::read_dir(root)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|entry| entry.path().join(MANIFEST))
        .filter(|path| path.is_file())
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{create_archive, ApiRequest, BroadcastReport, Distributor};
    use crate::catalog::Catalog;
    use crate::db::Database;
    use crate::model::{Instance, Method};
    use crate::CatalogSources;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NoFleet;

    #[async_trait]
    impl Distributor for NoFleet {
        async fn broadcast(&self, _: &[Instance], _: &ApiRequest) -> BroadcastReport {
            BroadcastReport::default()
        }

        async fn send_files(&self, _: &[Instance], _: &Path, _: &str) -> BroadcastReport {
            BroadcastReport::default()
        }
    }

    const SETTINGS: &str = r#"{"USE_CORS": {"context": "multisite", "default": "no", "regex": "^(yes|no)$", "type": "check"}}"#;

    fn context(tmp: &TempDir) -> ControlContext {
        std::fs::write(tmp.path().join("settings.json"), SETTINGS).unwrap();
        let ctx = ControlContext::new(Catalog::new(), Database::open_in_memory().unwrap(), Arc::new(NoFleet))
            .with_sources(CatalogSources {
                core_settings: tmp.path().join("settings.json"),
                core_plugins: tmp.path().join("core"),
                external_plugins: tmp.path().join("external"),
            });
        ctx.reload_catalog().unwrap();
        ctx
    }

    fn plugin_archive(id: &str) -> Vec<u8> {
        let src = TempDir::new().unwrap();
        let dir = src.path().join(id);
        std::fs::create_dir_all(dir.join("jobs")).unwrap();
        std::fs::write(
            dir.join("plugin.json"),
            format!(
                r#"{{"id": "{id}", "name": "Extra", "version": "1.0",
                    "settings": {{"EXTRA_MODE": {{"context": "global", "default": "off", "regex": "^.*$", "type": "text"}}}},
                    "jobs": [{{"name": "extra-sync", "file": "sync.sh", "every": "day"}}]}}"#
            ),
        )
        .unwrap();
        std::fs::write(dir.join("jobs/sync.sh"), "exit 0").unwrap();
        create_archive(src.path()).unwrap()
    }

    #[tokio::test]
    async fn test_install_retries_then_registers_plugin() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let archive = plugin_archive("extra");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/extra.tar.gz"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/extra.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.clone()))
            .mount(&server)
            .await;

        let installer = PluginInstaller::new(tmp.path().join("external"))
            .unwrap()
            .with_backoff(Duration::from_millis(10));
        let installed = installer
            .install_from_url(&ctx, &format!("{}/extra.tar.gz", server.uri()))
            .await
            .unwrap();

        assert_eq!(installed.len(), 1);
        assert!(installed[0].external);
        assert_eq!(installed[0].method, Method::Manual);
        assert_eq!(installed[0].checksum.as_deref(), Some(checksum(&archive).as_str()));
        assert!(tmp.path().join("external/extra/jobs/sync.sh").is_file());
        assert!(ctx.catalog().setting("EXTRA_MODE").is_some());

        let record = ctx
            .db
            .get_plugins()
            .unwrap()
            .into_iter()
            .find(|p| p.id == "extra")
            .unwrap();
        assert_eq!(record.checksum.as_deref(), Some(checksum(&archive).as_str()));
    }

    #[tokio::test]
    async fn test_download_gives_up() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let err = PluginInstaller::new(tmp.path().join("external"))
            .unwrap()
            .with_backoff(Duration::from_millis(1))
            .install_from_url(&ctx, &format!("{}/missing.tar.gz", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Download { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_archive_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("README"), "nothing here").unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(create_archive(src.path()).unwrap()))
            .mount(&server)
            .await;

        let err = PluginInstaller::new(tmp.path().join("external"))
            .unwrap()
            .install_from_url(&ctx, &server.uri())
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::NoManifest));
    }

    #[tokio::test]
    async fn test_core_plugin_cannot_be_replaced() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(plugin_archive("general")))
            .mount(&server)
            .await;

        let err = PluginInstaller::new(tmp.path().join("external"))
            .unwrap()
            .install_from_url(&ctx, &server.uri())
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::CoreConflict(id) if id == "general"));
    }
}
