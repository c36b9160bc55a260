//! Integration tests for the job scheduler task
//!
//! Jobs are small shell scripts that append to a marker file whose path is
//! handed over through the job environment.

#![cfg(unix)]

use async_trait::async_trait;
use chrono::Utc;
use convoy::api::{ApiRequest, BroadcastReport, Distributor};
use convoy::catalog::{Cadence, Catalog, JobSpec, Plugin};
use convoy::db::Database;
use convoy::error::SchedulerError;
use convoy::model::Instance;
use convoy::resolver::EffectiveConfig;
use convoy::scheduler::{self, Clock, JobScheduler, SchedulerOptions, SchedulerState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

struct Silent;

#[async_trait]
impl Distributor for Silent {
    async fn broadcast(&self, _: &[Instance], _: &ApiRequest) -> BroadcastReport {
        BroadcastReport {
            all_ok: true,
            ..Default::default()
        }
    }

    async fn send_files(&self, _: &[Instance], _: &Path, _: &str) -> BroadcastReport {
        BroadcastReport {
            all_ok: true,
            ..Default::default()
        }
    }
}

fn plugin(root: &Path, id: &str, jobs: &[(&str, &str, Cadence, &str)]) -> Plugin {
    let dir = root.join(id);
    std::fs::create_dir_all(dir.join("jobs")).unwrap();
    let mut plugin = Plugin::new(id, id, "1.0").with_path(&dir);
    for (name, file, every, script) in jobs {
        std::fs::write(dir.join("jobs").join(file), script).unwrap();
        plugin = plugin.with_job(JobSpec::new(*name, *file, *every));
    }
    plugin
}

fn marker_env(marker: &Path) -> EffectiveConfig {
    EffectiveConfig::from_map([("MARKER".to_string(), marker.display().to_string())].into_iter().collect())
}

fn lines(marker: &Path) -> Vec<String> {
    std::fs::read_to_string(marker)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Clock that can be pushed forward by the test
fn offset_clock() -> (Clock, Arc<AtomicI64>) {
    let offset = Arc::new(AtomicI64::new(0));
    let shared = offset.clone();
    let clock: Clock = Arc::new(move || Utc::now() + chrono::Duration::seconds(shared.load(Ordering::SeqCst)));
    (clock, offset)
}

fn options(tmp: &TempDir) -> SchedulerOptions {
    SchedulerOptions {
        tick_interval: Duration::from_millis(50),
        cache_dir: tmp.path().join("cache"),
        ..Default::default()
    }
}

async fn wait_for(marker: &Path, line: &str) {
    for _ in 0..200 {
        if lines(marker).iter().any(|l| l == line) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("marker never contained {line:?}");
}

#[tokio::test]
async fn test_reload_waits_for_running_tick() {
    let tmp = TempDir::new().unwrap();
    let marker: PathBuf = tmp.path().join("marker");
    let slow = plugin(
        tmp.path(),
        "slow",
        &[(
            "slow-job",
            "slow.sh",
            Cadence::Minute,
            "echo start >> \"$MARKER\"\nsleep 1\necho end >> \"$MARKER\"\n",
        )],
    );
    let db = Database::open_in_memory().unwrap();
    let (clock, offset) = offset_clock();
    let scheduler = JobScheduler::new(
        Arc::new(Catalog::from_plugins(vec![slow]).unwrap()),
        db.clone(),
        Arc::new(Silent),
        options(&tmp),
    )
    .with_clock(clock)
    .with_env(marker_env(&marker), vec![]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = scheduler::spawn(scheduler, shutdown_rx);
    handle.start().await.unwrap();
    assert_eq!(handle.state().await.unwrap(), SchedulerState::Armed);

    offset.store(120, Ordering::SeqCst);
    wait_for(&marker, "start").await;

    assert!(handle.reload(marker_env(&marker), vec![], None).await.unwrap());
    assert_eq!(lines(&marker), vec!["start", "end"]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lines(&marker).len(), 2);
    assert_eq!(db.get_job_runs(Some("slow-job"), 10).unwrap().len(), 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert!(matches!(handle.state().await, Err(SchedulerError::Closed)));
}

#[tokio::test]
async fn test_cadence_through_the_task() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("marker");
    let hourly = plugin(
        tmp.path(),
        "hourly",
        &[("tick", "tick.sh", Cadence::Hour, "echo tick >> \"$MARKER\"\n")],
    );
    let (clock, offset) = offset_clock();
    let scheduler = JobScheduler::new(
        Arc::new(Catalog::from_plugins(vec![hourly]).unwrap()),
        Database::open_in_memory().unwrap(),
        Arc::new(Silent),
        options(&tmp),
    )
    .with_clock(clock)
    .with_env(marker_env(&marker), vec![]);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, _task) = scheduler::spawn(scheduler, shutdown_rx);
    handle.start().await.unwrap();

    offset.store(30 * 60, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(lines(&marker).is_empty());

    offset.store(61 * 60, Ordering::SeqCst);
    wait_for(&marker, "tick").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lines(&marker).len(), 1);

    handle.stop().await.unwrap();
    offset.store(5 * 3600, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lines(&marker).len(), 1);
    assert_eq!(handle.state().await.unwrap(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_run_once_orders_jobs_within_a_plugin() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("marker");
    let ordered = plugin(
        tmp.path(),
        "ordered",
        &[
            (
                "first",
                "first.sh",
                Cadence::Once,
                "echo first >> \"$MARKER\"\nsleep 0.3\necho first-done >> \"$MARKER\"\n",
            ),
            ("second", "second.sh", Cadence::Day, "echo second >> \"$MARKER\"\n"),
        ],
    );
    let broken = plugin(tmp.path(), "broken", &[("fail", "fail.sh", Cadence::Day, "exit 3\n")]);
    let db = Database::open_in_memory().unwrap();
    let scheduler = JobScheduler::new(
        Arc::new(Catalog::from_plugins(vec![ordered, broken]).unwrap()),
        db.clone(),
        Arc::new(Silent),
        options(&tmp),
    )
    .with_env(marker_env(&marker), vec![]);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, _task) = scheduler::spawn(scheduler, shutdown_rx);

    assert!(!handle.run_once(vec![]).await.unwrap());
    assert_eq!(lines(&marker), vec!["first", "first-done", "second"]);

    let runs = db.get_job_runs(None, 10).unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().any(|r| r.job_name == "fail" && !r.success));
    assert!(runs.iter().filter(|r| r.job_name != "fail").all(|r| r.success));

    assert!(handle.run_once(vec!["ordered".to_string()]).await.unwrap());
    assert!(handle.run_single("second").await.unwrap());
    assert!(matches!(
        handle.run_single("missing").await,
        Err(SchedulerError::UnknownJob(name)) if name == "missing"
    ));
}
