//! Multi-worker builds against the in-memory store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use suiteq_core::engine::{ExampleFailure, ExecutionEngine, JobObserver, JobRun};
use suiteq_core::job::file_of;
use suiteq_core::telemetry::{Telemetry, TelemetryEvent};
use suiteq_core::{BuildId, WorkerId};
use suiteq_scheduler::{ScheduleConfig, Worker, WorkerConfig, WorkerExit, publish_schedule};
use suiteq_store::{JobStore, MemoryBackend, MemoryJobStore};

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Pass,
    /// Fail the first `n` attempts, then pass.
    FailTimes(u32),
    AlwaysFail,
    LoadError,
}

/// Engine whose outcome per file is scripted up front.
#[derive(Default)]
struct ScriptedEngine {
    behaviour: HashMap<String, Behaviour>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedEngine {
    fn new(behaviour: &[(&str, Behaviour)]) -> Self {
        Self {
            behaviour: behaviour
                .iter()
                .map(|(file, b)| (file.to_string(), *b))
                .collect(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn runs(&self) -> u32 {
        self.attempts.lock().values().sum()
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, run: &JobRun, observer: &mut dyn JobObserver) -> suiteq_core::Result<()> {
        let file = file_of(&run.job).to_string();
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(file.clone()).or_default();
            *n += 1;
            *n
        };
        let behaviour = self.behaviour.get(&file).copied().unwrap_or(Behaviour::Pass);

        let fails = match behaviour {
            Behaviour::Pass => false,
            Behaviour::FailTimes(n) => attempt <= n,
            Behaviour::AlwaysFail => true,
            Behaviour::LoadError => {
                observer.load_error(format!("cannot load {file}")).await?;
                return observer.suite_finished(Duration::ZERO, 0).await;
            }
        };

        if fails {
            observer
                .example_failed(ExampleFailure {
                    id: format!("{file}[1:1]"),
                    message: format!("attempt {attempt} failed"),
                    location: format!("{file}:1"),
                    description: "does the thing".to_string(),
                    backtrace: vec![],
                })
                .await?;
        }
        observer.example_finished().await?;
        observer.suite_finished(Duration::from_millis(5), 1).await
    }

    async fn list_examples(&self, files: &[String]) -> suiteq_core::Result<Vec<String>> {
        Ok(files.iter().map(|f| format!("{f}[1:1]")).collect())
    }
}

#[derive(Default)]
struct CapturingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl Telemetry for CapturingTelemetry {
    fn notify(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

fn files(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn config(worker: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(WorkerId::new(worker));
    config.requeue_delay = Duration::ZERO;
    config.backoff = Duration::from_millis(5);
    config.queue_wait_timeout = Duration::from_secs(5);
    config.engine_command = "bin/run-tests".to_string();
    config
}

async fn run_workers(
    store: Arc<MemoryJobStore>,
    engine: Arc<ScriptedEngine>,
    telemetry: Arc<CapturingTelemetry>,
    configs: Vec<WorkerConfig>,
    jobs: Vec<String>,
) -> Vec<WorkerExit> {
    let handles: Vec<_> = configs
        .into_iter()
        .map(|config| {
            let worker = Worker::new(
                config,
                store.clone(),
                engine.clone(),
                telemetry.clone(),
                jobs.clone(),
            );
            tokio::spawn(async move { worker.run().await })
        })
        .collect();

    let mut exits = Vec::new();
    for handle in handles {
        exits.push(handle.await.unwrap().unwrap());
    }
    exits
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_run_across_workers() {
    let store = Arc::new(MemoryBackend::new().store(BuildId::new("clean")));
    let engine = Arc::new(ScriptedEngine::new(&[]));
    let telemetry = Arc::new(CapturingTelemetry::default());
    let jobs = files(&["./a_spec.rb", "./b_spec.rb", "./c_spec.rb", "./d_spec.rb", "./e_spec.rb"]);

    let exits = run_workers(
        store.clone(),
        engine.clone(),
        telemetry,
        vec![config("w1"), config("w2"), config("w3")],
        jobs.clone(),
    )
    .await;

    assert!(exits.iter().all(|e| *e == WorkerExit::Finished));
    assert_eq!(store.processed_jobs().await.unwrap(), jobs);
    // Every job ran exactly once and was published exactly once.
    assert_eq!(engine.runs(), 5);
    assert_eq!(store.example_count().await.unwrap(), 5);
    assert!(store.leader().await.unwrap().is_some());
    assert!(store.build_successful().await.unwrap());
    assert!(store.flaky_jobs().await.unwrap().is_empty());

    let per_worker: usize = futures::future::join_all(
        ["w1", "w2", "w3"].map(|w| {
            let store = store.clone();
            async move { store.worker_jobs(w).await.unwrap().len() }
        }),
    )
    .await
    .into_iter()
    .sum();
    assert_eq!(per_worker, 5);
}

#[tokio::test]
async fn test_fail_fast_stops_intake() {
    let store = Arc::new(MemoryBackend::new().store(BuildId::new("ff")));
    let engine = Arc::new(ScriptedEngine::new(&[("./bad_spec.rb", Behaviour::AlwaysFail)]));
    let telemetry = Arc::new(CapturingTelemetry::default());

    let mut cfg = config("w1");
    cfg.fail_fast = 1;
    cfg.max_requeues = 0;
    cfg.reproduction = true;

    let exits = run_workers(
        store.clone(),
        engine,
        telemetry.clone(),
        vec![cfg],
        files(&["./bad_spec.rb", "./a_spec.rb", "./b_spec.rb", "./c_spec.rb"]),
    )
    .await;

    assert_eq!(exits, vec![WorkerExit::FailedFast]);
    assert!(store.build_failed_fast().await.unwrap());
    assert_eq!(store.unprocessed_len().await.unwrap(), 3);
    assert!(store.example_failures().await.unwrap().contains_key("./bad_spec.rb[1:1]"));
    assert!(store.requeues().await.unwrap().is_empty());
    assert_eq!(telemetry.events.lock()[0].kind(), "fail_fast");
}

#[tokio::test]
async fn test_job_of_dead_worker_is_reclaimed() {
    let backend = MemoryBackend::new();
    backend.set_time(1_000.0);
    let store = Arc::new(backend.store(BuildId::new("dead")));

    // A worker won the election, published, reserved a job and vanished.
    let dead = WorkerId::new("dead");
    assert!(store.become_leader(&dead).await.unwrap());
    store
        .publish(&files(&["./a_spec.rb", "./b_spec.rb"]), 0, true)
        .await
        .unwrap();
    store.record_heartbeat(&dead, 1_000.0).await.unwrap();
    assert_eq!(
        store.reserve_next(&dead).await.unwrap().as_deref(),
        Some("./a_spec.rb")
    );
    backend.advance(Duration::from_secs(61));

    let engine = Arc::new(ScriptedEngine::new(&[]));
    let exits = run_workers(
        store.clone(),
        engine.clone(),
        Arc::new(CapturingTelemetry::default()),
        vec![config("alive")],
        files(&["./a_spec.rb", "./b_spec.rb"]),
    )
    .await;

    assert_eq!(exits, vec![WorkerExit::Finished]);
    assert_eq!(store.lost_jobs().await.unwrap().get("./a_spec.rb"), Some(&1));
    assert_eq!(store.processed_count().await.unwrap(), 2);
    assert!(store.running_jobs().await.unwrap().is_empty());
    assert!(store.build_successful().await.unwrap());
    assert_eq!(engine.runs(), 2);
}

#[tokio::test]
async fn test_flaky_and_permanent_failures() {
    let store = Arc::new(MemoryBackend::new().store(BuildId::new("flaky")));
    let engine = Arc::new(ScriptedEngine::new(&[
        ("./flaky_spec.rb", Behaviour::FailTimes(2)),
        ("./broken_spec.rb", Behaviour::AlwaysFail),
    ]));

    let exits = run_workers(
        store.clone(),
        engine.clone(),
        Arc::new(CapturingTelemetry::default()),
        vec![config("w1"), config("w2")],
        files(&["./flaky_spec.rb", "./broken_spec.rb", "./ok_spec.rb"]),
    )
    .await;

    assert!(exits.iter().all(|e| *e == WorkerExit::Finished));
    let requeues = store.requeues().await.unwrap();
    assert_eq!(requeues.get("./flaky_spec.rb[1:1]"), Some(&2));
    assert_eq!(requeues.get("./broken_spec.rb[1:1]"), Some(&3));

    assert_eq!(store.flaky_jobs().await.unwrap(), vec!["./flaky_spec.rb[1:1]"]);
    let failures = store.example_failures().await.unwrap();
    assert_eq!(failures.len(), 1);
    let message = &failures["./broken_spec.rb[1:1]"];
    assert!(message.lines().last().unwrap().contains("./broken_spec.rb:1 # does the thing"));
    assert!(!store.build_successful().await.unwrap());

    // 1 initial run + 3 retries of the broken example.
    assert_eq!(engine.attempts.lock()["./broken_spec.rb"], 4);
}

#[tokio::test]
async fn test_load_error_is_not_requeued() {
    let store = Arc::new(MemoryBackend::new().store(BuildId::new("load")));
    let engine = Arc::new(ScriptedEngine::new(&[("./syntax_spec.rb", Behaviour::LoadError)]));

    run_workers(
        store.clone(),
        engine,
        Arc::new(CapturingTelemetry::default()),
        vec![config("w1")],
        files(&["./syntax_spec.rb", "./ok_spec.rb"]),
    )
    .await;

    let errors = store.errors().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors.contains_key("./syntax_spec.rb"));
    assert!(store.requeues().await.unwrap().is_empty());
    assert!(store.exhausted().await.unwrap());
}

#[tokio::test]
async fn test_timings_drive_next_build() {
    let backend = MemoryBackend::new();
    backend.insert_global_timing("./f1_spec.rb", 10.0);
    backend.insert_global_timing("./f2_spec.rb", 5.0);
    backend.insert_global_timing("./f3_spec.rb", 8.0);
    let store = Arc::new(backend.store(BuildId::new("lpt")));

    let engine = ScriptedEngine::new(&[]);
    publish_schedule(
        store.as_ref(),
        &engine,
        &CapturingTelemetry::default(),
        &WorkerId::new("w1"),
        &files(&["./f1_spec.rb", "./f2_spec.rb", "./f3_spec.rb"]),
        &ScheduleConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(
        store.unprocessed_jobs().await.unwrap(),
        files(&["./f1_spec.rb", "./f3_spec.rb", "./f2_spec.rb"])
    );
}
