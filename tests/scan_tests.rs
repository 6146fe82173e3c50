
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use buildfleet::config::DispatchConfig;
use buildfleet::error::DispatchError;
use buildfleet::fleet::{BuildSpec, CleanStatus, Fleet, Job, JobStatus, ResetProtocol, Worker};
use buildfleet::node::Node;
use buildfleet::proxy::{BuilderStatus, RemoteStatus};
use buildfleet::scheduler::{
    BehaviourRegistry, BuildOutcome, CleanAction, ScanOutcome, StagedBuildBehaviour,
};
use test_harness::{assert_eventually, binary_job, physical_worker, ScriptedProxy, StaticProxies};
use tokio_util::sync::CancellationToken;

fn node(workers: Vec<Worker>, jobs: Vec<Job>, proxies: StaticProxies, max_failures: u32) -> Node {
    let results = std::env::temp_dir().join("buildfleet-scan-tests");
    node_in(&results, workers, jobs, proxies, max_failures)
}

fn node_in(
    results: &Path,
    workers: Vec<Worker>,
    jobs: Vec<Job>,
    proxies: StaticProxies,
    max_failures: u32,
) -> Node {
    let mut fleet = Fleet::new();
    for worker in workers {
        fleet.add_worker(worker);
    }
    for job in jobs {
        fleet.add_job(job);
    }
    let mut config = DispatchConfig::default();
    config.scan_interval = Duration::from_millis(20);
    config.max_failures = max_failures;
    config.results_dir = results.to_path_buf();
    let behaviours =
        BehaviourRegistry::new().register(Arc::new(StagedBuildBehaviour::new("binarypackage")));
    Node::with_proxies(config, fleet, behaviours, Arc::new(proxies)).unwrap()
}

fn finished(job: &Job, build_status: &str) -> RemoteStatus {
    let mut status = RemoteStatus::new(BuilderStatus::Waiting);
    status.build_id = Some(job.id.to_string());
    status.build_status = Some(build_status.to_string());
    status
        .filemap
        .insert("hello_1.0_amd64.deb".to_string(), "deb-sha1".to_string());
    status
}

async fn scan_one(node: &Node, name: &str) -> Result<ScanOutcome, DispatchError> {
    let mut results = node.scanner.scan_all().await;
    let index = results
        .iter()
        .position(|(n, _)| n == name)
        .expect("worker scanned");
    results.swap_remove(index).1
}

#[tokio::test]
async fn test_dirty_idle_worker_is_cleaned_then_dispatched() {
    let job = binary_job("PACKAGEBUILD-1", 10);
    let job_id = job.id;
    let proxy = Arc::new(ScriptedProxy::new("bob").reporting(BuilderStatus::Idle));
    let node = node(
        vec![physical_worker("bob", CleanStatus::Dirty)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    let outcome = scan_one(&node, "bob").await.unwrap();

    assert_eq!(outcome, ScanOutcome::Dispatched { job: Some(job_id) });
    assert_eq!(
        proxy.calls(),
        vec!["status", "ensure_present", "ensure_present", "build"]
    );
    let fleet = node.fleet.read().await;
    assert_eq!(fleet.get_worker("bob").unwrap().clean_status, CleanStatus::Dirty);
    assert_eq!(fleet.get_job(&job_id).unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_finished_build_is_retired_and_worker_recycled() {
    let results = tempfile::tempdir().unwrap();
    let job = binary_job("PACKAGEBUILD-1", 10);
    let job_id = job.id;
    let proxy = Arc::new(
        ScriptedProxy::new("bob")
            .then_reporting(finished(&job, "BuildStatus.OK"))
            .reporting(BuilderStatus::Idle)
            .holding("deb-sha1", b"!<arch>\ndebian-binary"),
    );
    let node = node_in(
        results.path(),
        vec![physical_worker("bob", CleanStatus::Clean)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    // Clean worker: straight to dispatch.
    assert_eq!(
        scan_one(&node, "bob").await.unwrap(),
        ScanOutcome::Dispatched { job: Some(job_id) }
    );

    // The build has finished.
    match scan_one(&node, "bob").await.unwrap() {
        ScanOutcome::Polled(BuildOutcome::Finished {
            build_status,
            filemap,
        }) => {
            assert_eq!(build_status, "OK");
            assert_eq!(filemap.get("hello_1.0_amd64.deb").unwrap(), "deb-sha1");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(node.fleet.read().await.get_job(&job_id).is_none());
    assert_eq!(proxy.count("fetch_file"), 1);
    let landed = results
        .path()
        .join(job_id.to_string())
        .join("hello_1.0_amd64.deb");
    assert_eq!(std::fs::read(landed).unwrap(), b"!<arch>\ndebian-binary");

    // The worker is dirty after a build and gets cleaned before anything else.
    assert_eq!(
        scan_one(&node, "bob").await.unwrap(),
        ScanOutcome::Dispatched { job: None }
    );
    assert_eq!(
        node.fleet.read().await.get_worker("bob").unwrap().clean_status,
        CleanStatus::Clean
    );
}

#[tokio::test]
async fn test_failed_output_fetch_keeps_job() {
    let results = tempfile::tempdir().unwrap();
    let job = binary_job("PACKAGEBUILD-1", 10);
    let job_id = job.id;
    // Reports the build finished but cannot serve the file.
    let proxy = Arc::new(ScriptedProxy::new("bob").then_reporting(finished(&job, "BuildStatus.OK")));
    let node = node_in(
        results.path(),
        vec![physical_worker("bob", CleanStatus::Clean)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        1,
    );

    scan_one(&node, "bob").await.unwrap();
    let err = scan_one(&node, "bob").await.unwrap_err();

    assert!(matches!(err, DispatchError::ContentUnavailable { ref sha1, .. } if sha1 == "deb-sha1"));
    let fleet = node.fleet.read().await;
    let job = fleet.get_job(&job_id).unwrap();
    assert_eq!(job.assigned_worker.as_deref(), Some("bob"));
    let worker = fleet.get_worker("bob").unwrap();
    assert!(!worker.manual);
    assert_eq!(worker.failure_count, 0);
    assert!(!results
        .path()
        .join(job_id.to_string())
        .join("hello_1.0_amd64.deb")
        .exists());
}

#[tokio::test]
async fn test_output_name_outside_build_directory_is_refused() {
    let results = tempfile::tempdir().unwrap();
    let job = binary_job("PACKAGEBUILD-1", 10);
    let mut status = finished(&job, "BuildStatus.OK");
    status.filemap.clear();
    status
        .filemap
        .insert("../../etc/passwd".to_string(), "deb-sha1".to_string());
    let proxy = Arc::new(
        ScriptedProxy::new("bob")
            .then_reporting(status)
            .holding("deb-sha1", b"root:x:0:0"),
    );
    let node = node_in(
        results.path(),
        vec![physical_worker("bob", CleanStatus::Clean)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    scan_one(&node, "bob").await.unwrap();
    let err = scan_one(&node, "bob").await.unwrap_err();

    assert!(matches!(err, DispatchError::ProtocolViolation(_)));
    assert_eq!(proxy.count("fetch_file"), 0);
    assert!(node.fleet.read().await.get_worker("bob").unwrap().manual);
}

#[tokio::test]
async fn test_undispatchable_job_is_parked_without_blaming_worker() {
    let poisoned = Job::new(
        "RECIPEBUILD-1",
        BuildSpec {
            build_type: "sourcepackagerecipe".to_string(),
            ..Default::default()
        },
    )
    .with_score(100);
    let poisoned_id = poisoned.id;
    let good = binary_job("PACKAGEBUILD-1", 10);
    let good_id = good.id;
    let proxy = Arc::new(ScriptedProxy::new("bob").reporting(BuilderStatus::Idle));
    // A single charged failure would disable the worker.
    let node = node(
        vec![physical_worker("bob", CleanStatus::Clean)],
        vec![poisoned, good],
        StaticProxies::default().with(proxy.clone()),
        1,
    );

    let err = scan_one(&node, "bob").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownBuildType(_)));
    {
        let fleet = node.fleet.read().await;
        let job = fleet.get_job(&poisoned_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.assigned_worker.is_none());
        let worker = fleet.get_worker("bob").unwrap();
        assert!(!worker.manual);
        assert_eq!(worker.failure_count, 0);
        assert_eq!(worker.clean_status, CleanStatus::Dirty);
    }

    // Cleaned, then handed the next job in line.
    assert_eq!(
        scan_one(&node, "bob").await.unwrap(),
        ScanOutcome::Dispatched { job: Some(good_id) }
    );
    assert_eq!(proxy.count("build"), 1);
    let fleet = node.fleet.read().await;
    assert_eq!(fleet.get_job(&good_id).unwrap().status, JobStatus::Running);
    assert_eq!(fleet.get_job(&poisoned_id).unwrap().status, JobStatus::Failed);
    assert!(!fleet.get_worker("bob").unwrap().manual);
}

#[tokio::test]
async fn test_running_build_updates_logtail() {
    let job = binary_job("PACKAGEBUILD-1", 10);
    let job_id = job.id;
    let mut building = RemoteStatus::new(BuilderStatus::Building);
    building.build_id = Some(job_id.to_string());
    building.logtail = Some("dpkg-buildpackage: info: source package hello\n".to_string());
    let proxy = Arc::new(ScriptedProxy::new("bob").then_reporting(building));
    let node = node(
        vec![physical_worker("bob", CleanStatus::Clean)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    scan_one(&node, "bob").await.unwrap();
    let outcome = scan_one(&node, "bob").await.unwrap();

    assert!(matches!(outcome, ScanOutcome::Polled(BuildOutcome::Building { .. })));
    let fleet = node.fleet.read().await;
    assert!(fleet
        .get_job(&job_id)
        .unwrap()
        .logtail
        .as_deref()
        .unwrap()
        .contains("source package hello"));
    assert_eq!(proxy.count("abort"), 0);
}

#[tokio::test]
async fn test_cancelled_job_is_aborted() {
    let job = binary_job("PACKAGEBUILD-1", 10);
    let job_id = job.id;
    let mut building = RemoteStatus::new(BuilderStatus::Building);
    building.build_id = Some(job_id.to_string());
    let proxy = Arc::new(ScriptedProxy::new("bob").then_reporting(building));
    let node = node(
        vec![physical_worker("bob", CleanStatus::Clean)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    scan_one(&node, "bob").await.unwrap();
    node.fleet.write().await.request_cancel(&job_id).unwrap();
    scan_one(&node, "bob").await.unwrap();

    assert_eq!(proxy.count("abort"), 1);
}

#[tokio::test]
async fn test_lost_build_is_requeued() {
    let job = binary_job("PACKAGEBUILD-1", 10);
    let job_id = job.id;
    let proxy = Arc::new(ScriptedProxy::new("bob").reporting(BuilderStatus::Idle));
    let node = node(
        vec![physical_worker("bob", CleanStatus::Clean)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    scan_one(&node, "bob").await.unwrap();
    let outcome = scan_one(&node, "bob").await.unwrap();

    assert_eq!(outcome, ScanOutcome::Polled(BuildOutcome::Lost));
    let fleet = node.fleet.read().await;
    let job = fleet.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert!(job.assigned_worker.is_none());
    assert_eq!(fleet.get_worker("bob").unwrap().clean_status, CleanStatus::Dirty);
}

#[tokio::test]
async fn test_remote_fault_disables_worker() {
    let proxy = Arc::new(
        ScriptedProxy::new("bob")
            .reporting(BuilderStatus::Building)
            .failing_abort(),
    );
    let node = node(
        vec![physical_worker("bob", CleanStatus::Dirty)],
        vec![],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    let err = scan_one(&node, "bob").await.unwrap_err();
    assert!(matches!(err, DispatchError::RemoteFault { .. }));
    {
        let fleet = node.fleet.read().await;
        let worker = fleet.get_worker("bob").unwrap();
        assert!(worker.manual);
        assert!(worker.failure_notes.as_deref().unwrap().contains("abort"));
    }

    // Disabled workers are left alone.
    assert_eq!(scan_one(&node, "bob").await.unwrap(), ScanOutcome::Skipped);
    assert_eq!(proxy.calls(), vec!["status", "abort"]);
}

#[tokio::test]
async fn test_repeated_failures_disable_worker() {
    let worker = Worker::new("vm1", "http://vm1:8221", vec![])
        .virtualized("vm1-host", ResetProtocol::Synchronous);
    let proxy = Arc::new(ScriptedProxy::new("vm1").failing_resume());
    let node = node(
        vec![worker],
        vec![],
        StaticProxies::default().with(proxy.clone()),
        2,
    );

    assert!(scan_one(&node, "vm1").await.is_err());
    {
        let fleet = node.fleet.read().await;
        let worker = fleet.get_worker("vm1").unwrap();
        assert_eq!(worker.failure_count, 1);
        assert!(!worker.manual);
    }

    assert!(scan_one(&node, "vm1").await.is_err());
    let fleet = node.fleet.read().await;
    let worker = fleet.get_worker("vm1").unwrap();
    assert_eq!(worker.failure_count, 2);
    assert!(worker.manual);
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let proxy = Arc::new(ScriptedProxy::new("bob").reporting(BuilderStatus::Aborting));
    let node = node(
        vec![physical_worker("bob", CleanStatus::Dirty)],
        vec![],
        StaticProxies::default().with(proxy.clone()),
        5,
    );
    node.fleet
        .write()
        .await
        .record_failure("bob", "earlier timeout".to_string())
        .unwrap();

    let outcome = scan_one(&node, "bob").await.unwrap();
    assert_eq!(
        outcome,
        ScanOutcome::Cleaning(buildfleet::scheduler::CleanOutcome {
            actions: vec![CleanAction::Status],
            is_clean: false,
        })
    );
    assert_eq!(node.fleet.read().await.get_worker("bob").unwrap().failure_count, 0);
}

#[tokio::test]
async fn test_external_async_worker_dispatches_after_confirmation() {
    let job = binary_job("PACKAGEBUILD-1", 10).requiring_virtualization();
    let job_id = job.id;
    let worker = Worker::new("vm1", "http://vm1:8221", vec!["amd64".to_string()])
        .virtualized("vm1-host", ResetProtocol::ExternalAsync);
    let proxy = Arc::new(ScriptedProxy::new("vm1"));
    let node = node(
        vec![worker],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );

    assert!(matches!(
        scan_one(&node, "vm1").await.unwrap(),
        ScanOutcome::Cleaning(_)
    ));
    assert!(matches!(
        scan_one(&node, "vm1").await.unwrap(),
        ScanOutcome::Cleaning(ref o) if o.actions.is_empty()
    ));
    assert_eq!(proxy.count("resume"), 1);

    assert!(node.fleet.write().await.confirm_clean("vm1").unwrap());
    assert_eq!(
        scan_one(&node, "vm1").await.unwrap(),
        ScanOutcome::Dispatched { job: Some(job_id) }
    );
}

#[tokio::test]
async fn test_scanner_runs_until_cancelled() {
    let job = binary_job("PACKAGEBUILD-1", 10);
    let job_id = job.id;
    let proxy = Arc::new(ScriptedProxy::new("bob").reporting(BuilderStatus::Idle));
    let node = node(
        vec![physical_worker("bob", CleanStatus::Dirty)],
        vec![job],
        StaticProxies::default().with(proxy.clone()),
        5,
    );
    let fleet = node.fleet.clone();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    assert_eventually(
        || {
            let fleet = fleet.clone();
            async move {
                fleet
                    .read()
                    .await
                    .get_job(&job_id)
                    .is_some_and(|j| j.assigned_worker.as_deref() == Some("bob"))
            }
        },
        Duration::from_secs(5),
        "job dispatched by the scan loop",
    )
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scanner should stop")
        .unwrap();
}
