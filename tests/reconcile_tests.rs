//! Integration tests for resolution and the reconcile loop
//!
//! Exercises the resolver on its own, then the whole observe/persist/render/
//! distribute path with an in-memory database and a recording distributor.

use async_trait::async_trait;
use convoy::api::{ApiRequest, BroadcastReport, Distributor};
use convoy::catalog::{Catalog, Plugin, Setting};
use convoy::db::Database;
use convoy::error::{FleetError, RenderError};
use convoy::fleet::FleetSource;
use convoy::model::{Instance, Method, Service, ServiceSetting, ServiceSpec, SettingContext, Triad};
use convoy::reconciler::{Reconciler, ReconcilerOptions};
use convoy::render::Renderer;
use convoy::resolver::resolve;
use convoy::ControlContext;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn catalog() -> Catalog {
    Catalog::from_plugins(vec![
        Plugin::new("cors", "CORS", "1.0").with_setting(Setting::new("USE_CORS", SettingContext::Global, "no")),
        Plugin::new("reverseproxy", "Reverse proxy", "1.0").with_setting(
            Setting::new("REVERSE_PROXY_URL", SettingContext::Multisite, "").with_multiple("reverse-proxy"),
        ),
        Plugin::new("gzip", "Gzip", "1.0")
            .with_setting(Setting::new("USE_GZIP", SettingContext::Multisite, "no").with_regex("^(yes|no)$")),
    ])
    .unwrap()
}

// ============================================================================
// Resolution
// ============================================================================

mod resolution_tests {
    use super::*;

    fn expected(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_single_service_with_repeated_setting() {
        let catalog = Catalog::from_plugins(vec![
            Plugin::new("cors", "CORS", "1.0").with_setting(Setting::new("USE_CORS", SettingContext::Global, "no")),
            Plugin::new("reverseproxy", "Reverse proxy", "1.0").with_setting(
                Setting::new("REVERSE_PROXY_URL", SettingContext::Multisite, "").with_multiple("reverse-proxy"),
            ),
        ])
        .unwrap();
        let services = [Service::new("a.com", Method::Ui)];
        let settings = [ServiceSetting::new("a.com", "REVERSE_PROXY_URL", 0, "/api", Method::Ui)];

        let config = resolve(&catalog, &[], &settings, &services);

        assert_eq!(
            config.into_map(),
            expected(&[
                ("USE_CORS", "no"),
                ("a.com_REVERSE_PROXY_URL_0", "/api"),
                ("SERVER_NAME", "a.com"),
            ])
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let catalog = catalog();
        let services = [Service::new("b.com", Method::Autoconf), Service::new("a.com", Method::Ui)];
        let settings = [
            ServiceSetting::new("a.com", "REVERSE_PROXY_URL", 1, "/two", Method::Ui),
            ServiceSetting::new("a.com", "REVERSE_PROXY_URL", 0, "/one", Method::Ui),
            ServiceSetting::new("b.com", "USE_GZIP", 0, "yes", Method::Autoconf),
        ];

        let first = resolve(&catalog, &[], &settings, &services);
        let second = resolve(&catalog, &[], &settings, &services);

        assert_eq!(first, second);
        assert_eq!(first.to_env_string(), second.to_env_string());
    }

    #[test]
    fn test_service_values_do_not_leak() {
        let catalog = catalog();
        let services = [Service::new("a.com", Method::Ui), Service::new("b.com", Method::Ui)];
        let settings = [
            ServiceSetting::new("a.com", "USE_GZIP", 0, "yes", Method::Ui),
            ServiceSetting::new("a.com", "REVERSE_PROXY_URL", 0, "/api", Method::Ui),
        ];

        let config = resolve(&catalog, &[], &settings, &services);

        assert_eq!(config.get("a.com_USE_GZIP"), Some("yes"));
        assert_eq!(config.get("b.com_USE_GZIP"), None);
        assert_eq!(config.get("USE_GZIP"), Some("no"));
        assert_eq!(config.get("b.com_REVERSE_PROXY_URL_0"), None);
        assert_eq!(config.service_value("b.com", "USE_GZIP"), Some("no"));
        assert_eq!(config.get("SERVER_NAME"), Some("a.com b.com"));
    }
}

// ============================================================================
// Reconcile loop
// ============================================================================

mod reconcile_tests {
    use super::*;

    #[derive(Default)]
    struct Spy {
        calls: Mutex<Vec<String>>,
    }

    impl Spy {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Distributor for Spy {
        async fn broadcast(&self, _: &[Instance], request: &ApiRequest) -> BroadcastReport {
            self.calls.lock().push(request.path.clone());
            BroadcastReport {
                all_ok: true,
                ..Default::default()
            }
        }

        async fn send_files(&self, _: &[Instance], _: &Path, url: &str) -> BroadcastReport {
            self.calls.lock().push(url.to_string());
            BroadcastReport {
                all_ok: true,
                ..Default::default()
            }
        }
    }

    /// Writes one file per service found in the snapshot
    struct FileRenderer;

    #[async_trait]
    impl Renderer for FileRenderer {
        async fn render(&self, variables: &Path, output: &Path) -> Result<(), RenderError> {
            let vars = convoy::resolver::read_variables(variables).map_err(RenderError::Spawn)?;
            std::fs::create_dir_all(output).map_err(RenderError::Spawn)?;
            let names = vars.get("SERVER_NAME").cloned().unwrap_or_default();
            for name in names.split_whitespace() {
                std::fs::write(output.join(format!("{name}.conf")), "server {}").map_err(RenderError::Spawn)?;
            }
            Ok(())
        }
    }

    struct BrokenRenderer;

    #[async_trait]
    impl Renderer for BrokenRenderer {
        async fn render(&self, _: &Path, _: &Path) -> Result<(), RenderError> {
            Err(RenderError::Failed {
                code: Some(2),
                stderr: "unknown directive".to_string(),
            })
        }
    }

    struct FixedSource {
        triad: Mutex<Triad>,
    }

    #[async_trait]
    impl FleetSource for FixedSource {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn observe(&self) -> Result<Triad, FleetError> {
            Ok(self.triad.lock().clone())
        }
    }

    fn fleet() -> Triad {
        Triad::new(
            vec![Instance::new("10.0.0.2", 5000, "bwapi"), Instance::new("10.0.0.3", 5000, "bwapi")],
            vec![ServiceSpec::new("a.com").with_setting("REVERSE_PROXY_URL_0", "/api")],
            vec![],
        )
    }

    fn options(tmp: &TempDir) -> ReconcilerOptions {
        ReconcilerOptions {
            custom_configs: tmp.path().join("configs"),
            variables: tmp.path().join("variables.env"),
            rendered: tmp.path().join("rendered"),
            ..Default::default()
        }
    }

    fn reconciler(tmp: &TempDir, renderer: Arc<dyn Renderer>) -> (Reconciler, Arc<Spy>, Arc<ControlContext>) {
        let spy = Arc::new(Spy::default());
        let ctx = Arc::new(ControlContext::new(catalog(), Database::open_in_memory().unwrap(), spy.clone()));
        (Reconciler::new(ctx.clone(), renderer, options(tmp)), spy, ctx)
    }

    #[tokio::test]
    async fn test_apply_persists_and_distributes() {
        let tmp = TempDir::new().unwrap();
        let (mut reconciler, spy, ctx) = reconciler(&tmp, Arc::new(FileRenderer));

        assert!(reconciler.apply(fleet()).await);

        assert_eq!(spy.calls(), vec!["/confs", "/custom_configs", "/reload?test=yes"]);
        assert_eq!(ctx.db.get_instances().unwrap().len(), 2);

        let vars = std::fs::read_to_string(tmp.path().join("variables.env")).unwrap();
        assert!(vars.contains("USE_CORS=no\n"));
        assert!(vars.contains("a.com_REVERSE_PROXY_URL_0=/api\n"));
        assert!(vars.contains("SERVER_NAME=a.com\n"));
        assert!(!vars.contains("a.com_USE_CORS"));
        assert!(!vars.contains("REVERSE_PROXY_URL_1"));
        assert!(tmp.path().join("rendered/a.com.conf").is_file());
    }

    #[tokio::test]
    async fn test_unchanged_fleet_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let (mut reconciler, spy, _) = reconciler(&tmp, Arc::new(FileRenderer));
        let source = FixedSource {
            triad: Mutex::new(fleet()),
        };

        assert_eq!(reconciler.tick(&source).await.unwrap(), Some(true));
        let after_first = spy.calls().len();

        assert_eq!(reconciler.tick(&source).await.unwrap(), None);
        assert_eq!(spy.calls().len(), after_first);

        source
            .triad
            .lock()
            .services
            .push(ServiceSpec::new("b.com").with_setting("USE_GZIP", "yes"));
        assert_eq!(reconciler.tick(&source).await.unwrap(), Some(true));
        assert_eq!(spy.calls().len(), after_first * 2);

        let vars = std::fs::read_to_string(tmp.path().join("variables.env")).unwrap();
        assert!(vars.contains("SERVER_NAME=a.com b.com\n"));
        assert!(vars.contains("b.com_USE_GZIP=yes\n"));
    }

    #[tokio::test]
    async fn test_render_failure_still_distributes() {
        let tmp = TempDir::new().unwrap();
        let (mut reconciler, spy, ctx) = reconciler(&tmp, Arc::new(BrokenRenderer));

        assert!(!reconciler.apply(fleet()).await);

        assert_eq!(spy.calls(), vec!["/confs", "/custom_configs", "/reload?test=yes"]);
        assert!(reconciler.last_applied().is_some());
        assert!(!ctx.is_applying());
    }

    #[tokio::test]
    async fn test_removed_setting_is_dropped_on_next_apply() {
        let tmp = TempDir::new().unwrap();
        let (mut reconciler, _, ctx) = reconciler(&tmp, Arc::new(FileRenderer));
        let mut triad = fleet();
        triad.services[0] = ServiceSpec::new("a.com")
            .with_setting("REVERSE_PROXY_URL_0", "/api")
            .with_setting("USE_GZIP", "yes");

        assert!(reconciler.apply(triad).await);
        let config = ctx.db.get_config(&ctx.catalog()).unwrap();
        assert_eq!(config.get("a.com_USE_GZIP"), Some("yes"));

        assert!(reconciler.apply(fleet()).await);
        let config = ctx.db.get_config(&ctx.catalog()).unwrap();
        assert_eq!(config.get("a.com_USE_GZIP"), None);
        assert_eq!(config.get("a.com_REVERSE_PROXY_URL_0"), Some("/api"));
        let vars = std::fs::read_to_string(tmp.path().join("variables.env")).unwrap();
        assert!(!vars.contains("a.com_USE_GZIP"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_rearms_scheduler_with_new_env() {
        use convoy::catalog::{Cadence, JobSpec};
        use convoy::scheduler::{self, JobScheduler, SchedulerOptions, SchedulerState};
        use tokio::sync::watch;

        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("marker");
        let dir = tmp.path().join("plugins/echo");
        std::fs::create_dir_all(dir.join("jobs")).unwrap();
        std::fs::write(
            dir.join("jobs/echo.sh"),
            format!("printf '%s\\n' \"$SERVER_NAME\" >> {}\n", marker.display()),
        )
        .unwrap();
        let echo = Plugin::new("echo", "Echo", "1.0")
            .with_path(&dir)
            .with_job(JobSpec::new("echo-names", "echo.sh", Cadence::Hour));
        let job_scheduler = JobScheduler::new(
            Arc::new(Catalog::from_plugins(vec![echo]).unwrap()),
            Database::open_in_memory().unwrap(),
            Arc::new(Spy::default()),
            SchedulerOptions {
                cache_dir: tmp.path().join("cache"),
                ..Default::default()
            },
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = scheduler::spawn(job_scheduler, shutdown_rx);
        assert_eq!(handle.state().await.unwrap(), SchedulerState::Stopped);
        handle.start().await.unwrap();
        assert!(handle.run_single("echo-names").await.unwrap());
        let (reconciler, _, _) = reconciler(&tmp, Arc::new(FileRenderer));
        let mut reconciler = reconciler.with_scheduler(handle.clone());

        assert!(reconciler.apply(fleet()).await);
        assert_eq!(handle.state().await.unwrap(), SchedulerState::Armed);
        assert!(handle.run_single("echo-names").await.unwrap());

        let mut triad = fleet();
        triad.services.push(ServiceSpec::new("b.com"));
        assert!(reconciler.apply(triad).await);
        assert_eq!(handle.state().await.unwrap(), SchedulerState::Armed);
        assert!(handle.run_single("echo-names").await.unwrap());

        let lines: Vec<String> = std::fs::read_to_string(&marker)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines, vec!["", "a.com", "a.com b.com"]);
    }
}
