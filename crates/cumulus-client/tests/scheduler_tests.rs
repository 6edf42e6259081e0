use cumulus_client::{ClientError, JobRequest, JobResult, JobStatus, Orchestrator};
use cumulus_core::config::ExecutionConfig;
use cumulus_core::errors::{ConfigError, ErrorKind, SchedulingError};
use cumulus_core::graph::StepGraph;
use cumulus_core::model::{ClusterConfig, ConcurrencyMode, OnError, StorageConfig};
use cumulus_executor::TaskState;
use cumulus_storage::MemoryObjectStore;
use cumulus_test_utils::{graph, step, token_cluster, Behavior, Script, ScriptedConnector};
use std::collections::BTreeMap;
use std::sync::Arc;

fn fast_execution() -> ExecutionConfig {
    ExecutionConfig {
        timeout_seconds: 5,
        max_retries: 0,
        concurrency_ceiling: Some(4),
        poll_interval_ms: 5,
        poll_max_interval_ms: 20,
        retry_delay_ms: 1,
        cancel_grace_ms: 200,
        ..ExecutionConfig::default()
    }
}

fn request(graph: StepGraph, clusters: Vec<ClusterConfig>, output_dir: &std::path::Path) -> JobRequest {
    JobRequest {
        graph,
        inputs: BTreeMap::new(),
        clusters,
        shared_storage: Some(StorageConfig::new("memory://scheduler-tests")),
        placement: BTreeMap::new(),
        execution: fast_execution(),
        output_dir: output_dir.to_path_buf(),
        workflow_file: None,
    }
}

struct Fixture {
    store: Arc<MemoryObjectStore>,
    connector: Arc<ScriptedConnector>,
    out: tempfile::TempDir,
}

impl Fixture {
    fn new(name: &str, connector: ScriptedConnector) -> Self {
        let store = Arc::new(MemoryObjectStore::new(name));
        Self {
            connector: Arc::new(connector.with_store(store.clone())),
            store,
            out: tempfile::tempdir().unwrap(),
        }
    }

    fn request(&self, graph: StepGraph, clusters: Vec<ClusterConfig>) -> JobRequest {
        request(graph, clusters, self.out.path())
    }

    async fn run(&self, request: JobRequest) -> Result<JobResult, ClientError> {
        Orchestrator::new(self.connector.clone()).run_job(request).await
    }
}

#[tokio::test]
async fn test_explicit_binding_and_round_robin_assignment() {
    let fx = Fixture::new("rr", ScriptedConnector::new());
    let clusters = vec![
        token_cluster("C1"),
        token_cluster("C2").with_steps(["stepX"]),
    ];
    let g = graph([step("a"), step("stepX"), step("b"), step("c")]);

    let result = fx.run(fx.request(g, clusters)).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.assignments["stepX"], "C2");
    assert_eq!(result.assignments["a"], "C1");
    assert_eq!(result.assignments["b"], "C2");
    assert_eq!(result.assignments["c"], "C1");

    let log = fx.connector.log();
    assert_eq!(log.clusters_for("stepX"), vec!["C2".to_string()]);
    assert_eq!(log.clusters_for("a"), vec!["C1".to_string()]);
    assert!(fx.store.is_empty().await);
}

#[tokio::test]
async fn test_retry_stays_on_assigned_cluster() {
    let connector = ScriptedConnector::new()
        .cluster(
            "C1",
            Script::new().step(
                "a",
                Behavior::Flaky {
                    failures: 2,
                    then: Box::new(Behavior::succeed()),
                },
            ),
        )
        .cluster(
            "C2",
            Script::new().step(
                "a",
                Behavior::Flaky {
                    failures: 2,
                    then: Box::new(Behavior::succeed()),
                },
            ),
        );
    let fx = Fixture::new("sticky", connector);
    let mut req = fx.request(
        graph([step("a")]),
        vec![token_cluster("C1"), token_cluster("C2")],
    );
    req.execution.max_retries = 3;

    let result = fx.run(req).await.unwrap();

    assert!(result.is_success());
    let clusters = fx.connector.log().clusters_for("a");
    assert_eq!(clusters.len(), 3);
    assert!(clusters.iter().all(|c| c == &clusters[0]));
    assert_eq!(result.step("a").unwrap().retries, 2);
}

#[tokio::test]
async fn test_unknown_binding_fails_before_any_rpc() {
    let fx = Fixture::new("unknown-binding", ScriptedConnector::new());
    let local = token_cluster("C1").with_storage(StorageConfig::new("memory://c1"));
    let mut req = fx.request(graph([step("stepX")]), vec![local]);
    req.shared_storage = None;
    req.placement.insert("stepX".into(), "C2".into());

    let err = fx.run(req).await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::Config(ConfigError::UnknownClusterBinding { ref cluster, .. }) if cluster == "C2"
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(fx.connector.log().is_empty());
    assert_eq!(fx.connector.connects(), 0);
}

#[tokio::test]
async fn test_multi_cluster_without_shared_storage_is_rejected() {
    let fx = Fixture::new("no-shared", ScriptedConnector::new());
    let mut req = fx.request(
        graph([step("a")]),
        vec![token_cluster("C1"), token_cluster("C2")],
    );
    req.shared_storage = None;

    let err = fx.run(req).await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::Config(ConfigError::SharedStorageRequired { count: 2 })
    ));
    assert!(fx.connector.log().is_empty());
}

#[tokio::test]
async fn test_unreachable_shared_storage_is_a_configuration_error() {
    let fx = Fixture::new("offline", ScriptedConnector::new());
    fx.store.set_offline(true);

    let err = fx
        .run(fx.request(graph([step("a")]), vec![token_cluster("C1")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Config(ConfigError::SharedStorageUnreachable { .. })
    ));
    assert!(fx.connector.log().is_empty());
}

#[tokio::test]
async fn test_transient_failures_use_the_whole_retry_budget() {
    let connector =
        ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::Unavailable));
    let fx = Fixture::new("budget", connector);
    let mut req = fx.request(graph([step("a")]), vec![token_cluster("C1")]);
    req.execution.max_retries = 2;

    let result = fx.run(req).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(fx.connector.log().invokes("a"), 3);
    let a = result.step("a").unwrap();
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.error_kind, Some(ErrorKind::TransientExecution));
    assert_eq!(a.attempts, 3);
    assert_eq!(a.retries, 2);
}

#[tokio::test]
async fn test_authentication_errors_are_not_retried() {
    let connector =
        ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::Denied));
    let fx = Fixture::new("auth", connector);
    let mut req = fx.request(graph([step("a")]), vec![token_cluster("C1")]);
    req.execution.max_retries = 3;

    let result = fx.run(req).await.unwrap();

    assert_eq!(fx.connector.log().invokes("a"), 1);
    assert_eq!(
        result.step("a").unwrap().error_kind,
        Some(ErrorKind::Authentication)
    );
}

#[tokio::test]
async fn test_remote_failure_is_not_retried() {
    let connector =
        ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::exit(3)));
    let fx = Fixture::new("remote-failure", connector);
    let mut req = fx.request(graph([step("a")]), vec![token_cluster("C1")]);
    req.execution.max_retries = 3;

    let result = fx.run(req).await.unwrap();

    assert_eq!(fx.connector.log().invokes("a"), 1);
    let a = result.step("a").unwrap();
    assert_eq!(a.error_kind, Some(ErrorKind::RemoteFailure));
    assert_eq!(a.exit_code, Some(3));
    assert!(a.log_ref.is_some());
}

#[tokio::test]
async fn test_task_timeout_cancels_remote_invocation() {
    let connector = ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::Hang));
    let fx = Fixture::new("task-timeout", connector);
    let mut req = fx.request(graph([step("a")]), vec![token_cluster("C1")]);
    req.execution.timeout_seconds = 1;
    req.execution.max_retries = 2;

    let result = fx.run(req).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    let a = result.step("a").unwrap();
    assert_eq!(a.state, TaskState::TimedOut);
    assert_eq!(a.error_kind, Some(ErrorKind::Timeout));
    let log = fx.connector.log();
    assert_eq!(log.cancels("a"), 1);
    assert_eq!(log.invokes("a"), 1);
}

#[tokio::test]
async fn test_fail_fast_cancels_in_flight_and_skips_downstream() {
    let connector = ScriptedConnector::new().cluster(
        "C1",
        Script::new()
            .step("a", Behavior::exit_after(1, 4))
            .step("c", Behavior::Hang),
    );
    let fx = Fixture::new("fail-fast", connector);
    let g = graph([step("a"), step("b").after("a"), step("c")]);

    let result = fx.run(fx.request(g, vec![token_cluster("C1")])).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    let log = fx.connector.log();
    assert_eq!(log.invokes("b"), 0);
    assert_eq!(log.cancels("c"), 1);

    assert_eq!(result.step("a").unwrap().error_kind, Some(ErrorKind::RemoteFailure));
    for name in ["b", "c"] {
        let s = result.step(name).unwrap();
        assert_eq!(s.state, TaskState::Failed);
        assert_eq!(s.error_kind, Some(ErrorKind::PropagatedFailure));
    }
    assert!(result.outputs.is_empty());
    assert!(fx.store.is_empty().await);
}

#[tokio::test]
async fn test_fail_fast_cancels_invocations_not_yet_recorded() {
    let connector = ScriptedConnector::new().cluster(
        "C1",
        Script::new()
            .step("a", Behavior::Rejected)
            .step("c", Behavior::Hang),
    );
    let fx = Fixture::new("fail-fast-unrecorded", connector);
    let g = graph([step("a"), step("c")]);

    let result = fx.run(fx.request(g, vec![token_cluster("C1")])).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.step("a").unwrap().error_kind, Some(ErrorKind::Submission));
    let c = result.step("c").unwrap();
    assert_eq!(c.state, TaskState::Failed);
    assert_eq!(c.error_kind, Some(ErrorKind::PropagatedFailure));
    let log = fx.connector.log();
    assert_eq!(log.invokes("c"), 1);
    assert_eq!(log.cancels("c"), 1);
    assert_eq!(log.peak_in_flight(), 1);
}

#[tokio::test]
async fn test_panicking_attempt_fails_its_step() {
    let connector =
        ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::Panic));
    let fx = Fixture::new("panicking-attempt", connector);
    let g = graph([step("a"), step("b").after("a")]);

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        fx.run(fx.request(g, vec![token_cluster("C1")])),
    )
    .await
    .expect("job must finish")
    .unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    let a = result.step("a").unwrap();
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.error_kind, Some(ErrorKind::Scheduling));
    assert_eq!(
        result.step("b").unwrap().error_kind,
        Some(ErrorKind::PropagatedFailure)
    );
    assert_eq!(fx.connector.log().invokes("b"), 0);
}

#[tokio::test]
async fn test_unbounded_timeouts_run_to_completion() {
    let connector = ScriptedConnector::new()
        .cluster("C1", Script::new().step("a", Behavior::produce("a.txt", b"a")));
    let fx = Fixture::new("unbounded-timeouts", connector);
    let mut req = fx.request(graph([step("a").output("a", "a.txt")]), vec![token_cluster("C1")]);
    req.execution.timeout_seconds = u64::MAX;
    req.execution.job_timeout_seconds = Some(u64::MAX);

    let result = tokio::time::timeout(std::time::Duration::from_secs(30), fx.run(req))
        .await
        .expect("job must finish")
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.outputs.len(), 1);
}

#[tokio::test]
async fn test_nested_step_names_are_rejected_before_any_rpc() {
    let fx = Fixture::new("nested-names", ScriptedConnector::new());
    let g = graph([
        step("a/b").output("x", "x.txt"),
        step("a").after("a/b").output("y", "y.txt"),
    ]);

    let err = fx
        .run(fx.request(g, vec![token_cluster("C1")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Scheduling(SchedulingError::InvalidName { ref name, .. }) if name == "a/b"
    ));
    assert!(fx.connector.log().is_empty());
}

#[tokio::test]
async fn test_continue_on_error_runs_independent_branches() {
    let connector =
        ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::exit(1)));
    let fx = Fixture::new("continue", connector);
    let g = graph([
        step("a"),
        step("b").after("a"),
        step("c").after("b"),
        step("d"),
    ]);
    let mut req = fx.request(g, vec![token_cluster("C1")]);
    req.execution.on_error = OnError::Continue;

    let result = fx.run(req).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.step("d").unwrap().state, TaskState::Succeeded);
    for name in ["b", "c"] {
        let s = result.step(name).unwrap();
        assert_eq!(s.state, TaskState::Failed);
        assert_eq!(s.error_kind, Some(ErrorKind::PropagatedFailure));
        assert_eq!(s.attempts, 0);
    }
    let log = fx.connector.log();
    assert_eq!(log.invokes("b"), 0);
    assert_eq!(log.invokes("c"), 0);
}

#[tokio::test]
async fn test_sequential_mode_runs_in_topological_order() {
    let fx = Fixture::new("sequential", ScriptedConnector::new());
    let g = graph([
        step("d").after("b").after("c"),
        step("b").after("a"),
        step("c").after("a"),
        step("a"),
    ]);
    let mut req = fx.request(g, vec![token_cluster("C1")]);
    req.execution.mode = ConcurrencyMode::Sequential;

    let result = fx.run(req).await.unwrap();

    assert!(result.is_success());
    let log = fx.connector.log();
    assert_eq!(log.peak_in_flight(), 1);
    assert_eq!(log.invoke_order(), vec!["a", "b", "c", "d"]);
    let reported: Vec<_> = result.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(reported, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_sequential_failure_never_submits_downstream() {
    let connector =
        ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::exit(1)));
    let fx = Fixture::new("sequential-failure", connector);
    let g = graph([step("a"), step("b").after("a")]);
    let mut req = fx.request(g, vec![token_cluster("C1")]);
    req.execution.mode = ConcurrencyMode::Sequential;

    let result = fx.run(req).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    let b = result.step("b").unwrap();
    assert_eq!(b.state, TaskState::Failed);
    assert_eq!(b.error_kind, Some(ErrorKind::PropagatedFailure));
    assert_eq!(b.attempts, 0);
    assert_eq!(fx.connector.log().invokes("b"), 0);
}

#[tokio::test]
async fn test_parallel_mode_respects_ceiling() {
    let mut script = Script::new();
    for i in 0..6 {
        script = script.step(&format!("s{}", i), Behavior::produce_slowly("o", b"x", 3));
    }
    let fx = Fixture::new("ceiling", ScriptedConnector::new().cluster("C1", script));
    let g = graph((0..6).map(|i| step(&format!("s{}", i))));
    let mut req = fx.request(g, vec![token_cluster("C1")]);
    req.execution.concurrency_ceiling = Some(2);

    let result = fx.run(req).await.unwrap();

    assert!(result.is_success());
    assert!(fx.connector.log().peak_in_flight() <= 2);
}

#[tokio::test]
async fn test_job_timeout_stops_everything() {
    let connector = ScriptedConnector::new().cluster("C1", Script::new().step("a", Behavior::Hang));
    let fx = Fixture::new("job-timeout", connector);
    let mut req = fx.request(graph([step("a"), step("b").after("a")]), vec![token_cluster("C1")]);
    req.execution.timeout_seconds = 30;
    req.execution.job_timeout_seconds = Some(1);

    let result = fx.run(req).await.unwrap();

    assert_eq!(result.status, JobStatus::TimedOut);
    assert_eq!(result.step("a").unwrap().state, TaskState::TimedOut);
    let b = result.step("b").unwrap();
    assert_eq!(b.state, TaskState::Failed);
    assert_eq!(b.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(fx.connector.log().cancels("a"), 1);
    assert_eq!(fx.connector.log().invokes("b"), 0);
}

#[tokio::test]
async fn test_outputs_flow_downstream_and_are_downloaded() {
    let connector = ScriptedConnector::new().cluster(
        "C1",
        Script::new()
            .step("index", Behavior::produce("ref.idx", b"index"))
            .step("align", Behavior::produce("result.txt", b"aligned")),
    );
    let fx = Fixture::new("outputs", connector);
    let g = graph([
        step("index").output("idx", "*.idx"),
        step("align")
            .command("aligner $(inputs.idx) > $(runtime.outdir)/result.txt")
            .reads("idx", "index", "idx")
            .output("result", "result.txt"),
    ]);

    let result = fx.run(fx.request(g, vec![token_cluster("C1")])).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.outputs.len(), 1);
    let out = &result.outputs[0];
    assert_eq!(out.name, "result");
    assert_eq!(out.size, 7);
    assert_eq!(
        std::fs::read_to_string(fx.out.path().join("result.txt")).unwrap(),
        "aligned"
    );
    assert_eq!(out.sha256.len(), 64);
    assert!(!fx.out.path().join("ref.idx").exists());
    assert!(fx.store.is_empty().await);
}

#[tokio::test]
async fn test_multi_file_and_clashing_outputs_get_their_own_directory() {
    let connector = ScriptedConnector::new().cluster(
        "C1",
        Script::new()
            .step(
                "split",
                Behavior::Succeed {
                    files: vec![
                        ("part-1.txt".to_string(), b"one".to_vec()),
                        ("part-2.txt".to_string(), b"two".to_vec()),
                    ],
                    polls: 1,
                },
            )
            .step("left", Behavior::produce("result.txt", b"left"))
            .step("right", Behavior::produce("result.txt", b"right"))
            .step("summary", Behavior::produce("summary.txt", b"sum")),
    );
    let fx = Fixture::new("output-layout", connector);
    let g = graph([
        step("split").output("parts", "part-*.txt"),
        step("left").output("result", "result.txt"),
        step("right").output("result", "result.txt"),
        step("summary").output("summary", "summary.txt"),
    ]);

    let result = fx.run(fx.request(g, vec![token_cluster("C1")])).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.outputs.len(), 5);
    let out = fx.out.path();
    let read = |rel: &str| std::fs::read_to_string(out.join(rel)).unwrap();
    assert_eq!(read("parts/part-1.txt"), "one");
    assert_eq!(read("parts/part-2.txt"), "two");
    assert_eq!(read("left/result/result.txt"), "left");
    assert_eq!(read("right/result/result.txt"), "right");
    assert_eq!(read("summary.txt"), "sum");
    assert!(!out.join("result.txt").exists());
}

#[tokio::test]
async fn test_missing_required_output_fails_the_step() {
    let fx = Fixture::new("missing-output", ScriptedConnector::new());
    let g = graph([step("a").output("report", "report.html")]);

    let result = fx.run(fx.request(g, vec![token_cluster("C1")])).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(
        result.step("a").unwrap().error_kind,
        Some(ErrorKind::MissingOutput)
    );
}

#[tokio::test]
async fn test_service_is_verified_once_per_cluster() {
    let fx = Fixture::new("verify-once", ScriptedConnector::new());
    let g = graph([step("a"), step("b"), step("c").after("a")]);

    fx.run(fx.request(g, vec![token_cluster("C1")])).await.unwrap();

    assert_eq!(fx.connector.log().verifications("C1"), 1);
}

#[tokio::test]
async fn test_missing_workflow_input_is_rejected() {
    let fx = Fixture::new("missing-input", ScriptedConnector::new());
    let g = graph([step("a").workflow_input("reads").command("cat $(inputs.reads)")]);

    let err = fx
        .run(fx.request(g, vec![token_cluster("C1")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Scheduling(SchedulingError::MissingWorkflowInput { ref input, .. }) if input == "reads"
    ));
    assert!(fx.connector.log().is_empty());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_rpc() {
    let fx = Fixture::new("cycle", ScriptedConnector::new());
    let g = graph([step("a").after("b"), step("b").after("a")]);

    let err = fx
        .run(fx.request(g, vec![token_cluster("C1")]))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Scheduling(SchedulingError::Cycle(_))));
    assert!(fx.connector.log().is_empty());
}
