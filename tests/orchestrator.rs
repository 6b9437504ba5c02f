//! Integration tests for the lifecycle orchestrator.
//!
//! Uses a scripted in-memory engine so no container runtime is needed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use supastack::engine::{
    AttachHandle, ContainerEngine, ContainerSpec, ExecOutput, HealthStatus, NetworkSpec,
    NetworkSummary, PROJECT_LABEL,
};
use supastack::orchestrator::ensure_network;
use supastack::{
    Config, ConfigParams, EncryptionKeySource, EngineError, Orchestrator, OrchestratorError,
    PartialFailurePolicy, PostStartHook, ServiceDefinition, ServiceState, logging,
};

const KEY: &str = "d9bf2393c65c006cc83625f85a27cc50882a391b1e0ab4fd4c2535dbe1f8a283";

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeEngine {
    calls: Mutex<Vec<String>>,
    networks: Mutex<Vec<NetworkSummary>>,
    /// Container id to name.
    containers: Mutex<HashMap<String, String>>,
    /// Health statuses per container name; the last one repeats.
    health: Mutex<HashMap<String, VecDeque<HealthStatus>>>,
    /// Exit codes reported immediately by `wait_container`, per name.
    exits: Mutex<HashMap<String, i64>>,
    specs: Mutex<Vec<ContainerSpec>>,
    inspections: AtomicUsize,
    removal_in_progress: bool,
    /// Scripted `stop_container` failures, per name.
    stop_faults: Mutex<HashMap<String, Fault>>,
    /// Scripted `remove_container` failures, per name.
    remove_faults: Mutex<HashMap<String, Fault>>,
}

#[derive(Clone, Copy)]
enum Fault {
    Hang,
    Fail,
}

impl Fault {
    async fn trigger(self, operation: &'static str) -> Result<(), EngineError> {
        match self {
            Fault::Hang => std::future::pending().await,
            Fault::Fail => Err(EngineError::Request {
                operation,
                reason: "engine said no".to_string(),
            }),
        }
    }
}

impl FakeEngine {
    fn new() -> Self {
        Self::default()
    }

    fn with_health(self, name: &str, statuses: &[HealthStatus]) -> Self {
        self.health
            .lock()
            .unwrap()
            .insert(name.to_string(), statuses.iter().cloned().collect());
        self
    }

    fn with_exit(self, name: &str, code: i64) -> Self {
        self.exits.lock().unwrap().insert(name.to_string(), code);
        self
    }

    fn with_stop_fault(self, name: &str, fault: Fault) -> Self {
        self.stop_faults
            .lock()
            .unwrap()
            .insert(name.to_string(), fault);
        self
    }

    fn with_remove_fault(self, name: &str, fault: Fault) -> Self {
        self.remove_faults
            .lock()
            .unwrap()
            .insert(name.to_string(), fault);
        self
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn position(&self, call: &str) -> usize {
        self.calls()
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("no call {}", call))
    }

    fn name_of(&self, id: &str) -> String {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSummary>, EngineError> {
        self.record(format!("list_networks:{}", name));
        Ok(self
            .networks
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.name == name)
            .cloned()
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        self.record(format!("create_network:{}", spec.name));
        let mut networks = self.networks.lock().unwrap();
        let id = format!("net-{}", networks.len());
        networks.push(NetworkSummary {
            id,
            name: spec.name.clone(),
        });
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(format!("pull:{}", image));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(format!("create:{}", spec.name));
        let id = format!("{}-{:0>32}", spec.name, self.specs.lock().unwrap().len());
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), spec.name.clone());
        self.specs.lock().unwrap().push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("start:{}", self.name_of(id)));
        Ok(())
    }

    async fn inspect_health(&self, id: &str) -> Result<HealthStatus, EngineError> {
        self.inspections.fetch_add(1, Ordering::SeqCst);
        let name = self.name_of(id);
        let mut health = self.health.lock().unwrap();
        let status = match health.get_mut(&name) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(HealthStatus::Healthy),
            None => HealthStatus::Healthy,
        };
        Ok(status)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let exit = self.exits.lock().unwrap().get(&self.name_of(id)).copied();
        match exit {
            Some(code) => Ok(code),
            None => std::future::pending().await,
        }
    }

    async fn attach(&self, id: &str, with_output: bool) -> Result<AttachHandle, EngineError> {
        self.record(format!("attach:{}:{}", self.name_of(id), with_output));
        Ok(AttachHandle::noop())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let name = self.name_of(id);
        self.record(format!("stop:{}:{}", name, timeout.as_secs()));
        let fault = self.stop_faults.lock().unwrap().get(&name).copied();
        match fault {
            Some(fault) => fault.trigger("stop").await,
            None => Ok(()),
        }
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<(), EngineError> {
        let name = self.name_of(id_or_name);
        self.record(format!("remove:{}", name));
        if !self.containers.lock().unwrap().values().any(|n| *n == name) {
            return Err(EngineError::NotFound(name));
        }
        if self.removal_in_progress {
            return Err(EngineError::RemovalInProgress { container: name });
        }
        let fault = self.remove_faults.lock().unwrap().get(&name).copied();
        match fault {
            Some(fault) => fault.trigger("remove").await,
            None => Ok(()),
        }
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput, EngineError> {
        self.record(format!("exec:{}:{}", self.name_of(id), cmd.join(" ")));
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct CountingHook {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl PostStartHook for CountingHook {
    async fn after_start(
        &self,
        _engine: Arc<dyn ContainerEngine>,
        _container_id: &str,
    ) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(debug_mode: bool) -> Arc<Config> {
    Arc::new(
        Config::new(ConfigParams {
            debug_mode: Some(debug_mode),
            database_data_directory: Some("/srv/demo/postgres/data".into()),
            storage_data_directory: Some("/srv/demo/storage/data".into()),
            encryption_key: Some(EncryptionKeySource::Static(KEY.to_string())),
            ..ConfigParams::new("demo")
        })
        .unwrap(),
    )
}

fn service(name: &str) -> ServiceDefinition {
    ServiceDefinition::new(format!("demo-{}", name), format!("example/{}:1.0", name))
        .alias(name)
}

fn orchestrator(engine: &Arc<FakeEngine>, debug_mode: bool) -> Orchestrator {
    Orchestrator::new(
        config(debug_mode),
        Arc::clone(engine) as Arc<dyn ContainerEngine>,
        logging::disabled(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_with_no_services_returns_immediately() {
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, false);

    tokio::time::timeout(Duration::from_secs(1), orchestrator.stop())
        .await
        .expect("stop should not block");
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_network_bootstrap_is_idempotent() {
    let engine = FakeEngine::new();

    let first = ensure_network(&engine, "demo").await.unwrap();
    let second = ensure_network(&engine, "demo").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(engine.networks.lock().unwrap().len(), 1);
    assert_eq!(engine.calls_with("create_network").len(), 1);
}

#[tokio::test]
async fn test_network_bootstrap_rejects_ambiguous_name() {
    let engine = FakeEngine::new();
    for id in ["a", "b"] {
        engine.networks.lock().unwrap().push(NetworkSummary {
            id: id.to_string(),
            name: "demo".to_string(),
        });
    }

    let result = ensure_network(&engine, "demo").await;
    assert!(matches!(result, Err(OrchestratorError::Network { .. })));
    assert!(engine.calls_with("create_network").is_empty());
}

#[tokio::test]
async fn test_run_processes_in_order_and_stop_reverses() {
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, false);
    orchestrator
        .add_services([service("a"), service("b"), service("c")])
        .await;

    orchestrator.run(&CancellationToken::new()).await.unwrap();

    assert!(engine.position("create:demo-a") < engine.position("create:demo-b"));
    assert!(engine.position("create:demo-b") < engine.position("create:demo-c"));
    // Each service is fully up before the next is pulled.
    assert!(engine.position("attach:demo-a:false") < engine.position("pull:example/b:1.0"));
    assert!(
        orchestrator
            .services()
            .await
            .iter()
            .all(|s| s.state == ServiceState::Running)
    );

    orchestrator.stop().await;

    assert_eq!(
        engine.calls_with("stop:"),
        vec!["stop:demo-c:15", "stop:demo-b:15", "stop:demo-a:15"]
    );
    assert_eq!(
        engine.calls_with("remove:"),
        vec!["remove:demo-c", "remove:demo-b", "remove:demo-a"]
    );
    for status in orchestrator.services().await {
        assert_eq!(status.state, ServiceState::Removed);
        assert_eq!(status.container_id, None);
    }
}

#[tokio::test]
async fn test_containers_join_network_with_project_label() {
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, false);
    orchestrator
        .add_service(service("a").stop_signal("SIGINT").stop_timeout(Duration::from_secs(30)))
        .await;

    orchestrator.run(&CancellationToken::new()).await.unwrap();

    let specs = engine.specs.lock().unwrap().clone();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].network, "demo");
    assert_eq!(specs[0].aliases, vec!["a"]);
    assert_eq!(specs[0].labels.get(PROJECT_LABEL).map(String::as_str), Some("demo"));
    assert_eq!(specs[0].stop_signal.as_deref(), Some("SIGINT"));
    assert_eq!(orchestrator.network().await.unwrap().name, "demo");

    orchestrator.stop().await;
    assert_eq!(engine.calls_with("stop:"), vec!["stop:demo-a:30"]);
}

#[tokio::test(start_paused = true)]
async fn test_perpetual_starting_blocks_until_cancelled() {
    let engine = Arc::new(FakeEngine::new().with_health("demo-a", &[HealthStatus::Starting]));
    let orchestrator = Arc::new(orchestrator(&engine, false));
    orchestrator.add_service(service("a")).await;

    let cancel = CancellationToken::new();
    let handle = {
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(&cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!handle.is_finished());
    assert!(engine.inspections.load(Ordering::SeqCst) >= 10);

    cancel.cancel();
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(OrchestratorError::Cancelled { .. })));
    assert!(engine.calls_with("attach:").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_starting_then_healthy_proceeds() {
    let engine = Arc::new(FakeEngine::new().with_health(
        "demo-a",
        &[
            HealthStatus::Starting,
            HealthStatus::Starting,
            HealthStatus::Healthy,
        ],
    ));
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_service(service("a")).await;

    orchestrator.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(engine.inspections.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_no_healthcheck_is_accepted() {
    let engine = Arc::new(FakeEngine::new().with_health("demo-a", &[HealthStatus::NoHealthcheck]));
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_service(service("a")).await;

    orchestrator.run(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_unknown_health_status_is_an_error() {
    let engine = Arc::new(
        FakeEngine::new().with_health("demo-a", &[HealthStatus::Unknown(String::new())]),
    );
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_service(service("a")).await;

    let result = orchestrator.run(&CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(OrchestratorError::UnhandledHealthStatus { .. })
    ));
}

#[tokio::test]
async fn test_unhealthy_aborts_run_and_skips_hook() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let engine = Arc::new(FakeEngine::new().with_health("demo-a", &[HealthStatus::Unhealthy]));
    let orchestrator = orchestrator(&engine, false);
    orchestrator
        .add_services([
            service("a").post_start(CountingHook {
                calls: Arc::clone(&hook_calls),
            }),
            service("b"),
        ])
        .await;

    let result = orchestrator.run(&CancellationToken::new()).await;

    match result {
        Err(OrchestratorError::Unhealthy {
            service, retries, ..
        }) => {
            assert_eq!(service, "demo-a");
            assert_eq!(retries, 0);
        }
        other => panic!("expected unhealthy error, got {:?}", other),
    }
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    assert!(engine.calls_with("pull:example/b").is_empty());

    let statuses = orchestrator.services().await;
    assert_eq!(statuses[0].state, ServiceState::Failed);
    assert_eq!(statuses[1].state, ServiceState::Defined);
}

#[tokio::test]
async fn test_post_start_hook_runs_exactly_once() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, false);
    orchestrator
        .add_service(service("a").post_start(CountingHook {
            calls: Arc::clone(&hook_calls),
        }))
        .await;

    let cancel = CancellationToken::new();
    orchestrator.run(&cancel).await.unwrap();
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

    // Only services registered since the last run are processed.
    orchestrator.add_service(service("b")).await;
    orchestrator.run(&cancel).await.unwrap();
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.calls_with("create:"), vec!["create:demo-a", "create:demo-b"]);
    assert_eq!(engine.calls_with("create_network").len(), 1);
}

#[tokio::test]
async fn test_leave_running_policy_keeps_earlier_services() {
    let engine = Arc::new(FakeEngine::new().with_health("demo-b", &[HealthStatus::Unhealthy]));
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_services([service("a"), service("b")]).await;

    assert!(orchestrator.run(&CancellationToken::new()).await.is_err());
    assert!(engine.calls_with("stop:").is_empty());
    assert_eq!(orchestrator.services().await[0].state, ServiceState::Running);

    // The caller is responsible for cleanup, including the failed container.
    orchestrator.stop().await;
    assert_eq!(
        engine.calls_with("remove:"),
        vec!["remove:demo-b", "remove:demo-a"]
    );
}

#[tokio::test]
async fn test_stop_all_policy_tears_down_on_failure() {
    let engine = Arc::new(FakeEngine::new().with_health("demo-b", &[HealthStatus::Unhealthy]));
    let orchestrator =
        orchestrator(&engine, false).with_partial_failure_policy(PartialFailurePolicy::StopAll);
    orchestrator.add_services([service("a"), service("b")]).await;

    let cancel = CancellationToken::new();
    assert!(orchestrator.run(&cancel).await.is_err());
    assert_eq!(
        engine.calls_with("remove:"),
        vec!["remove:demo-b", "remove:demo-a"]
    );
    assert!(matches!(
        orchestrator.run(&cancel).await,
        Err(OrchestratorError::Stopped)
    ));
}

#[tokio::test]
async fn test_removal_in_progress_is_not_an_error() {
    let engine = Arc::new(FakeEngine {
        removal_in_progress: true,
        ..FakeEngine::default()
    });
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_service(service("a")).await;

    orchestrator.run(&CancellationToken::new()).await.unwrap();
    orchestrator.stop().await;

    let statuses = orchestrator.services().await;
    assert_eq!(statuses[0].state, ServiceState::Removed);
    assert_eq!(statuses[0].container_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_stop_failures_do_not_block_remaining_teardown() {
    let engine = Arc::new(
        FakeEngine::new()
            .with_stop_fault("demo-c", Fault::Hang)
            .with_stop_fault("demo-b", Fault::Fail)
            .with_remove_fault("demo-b", Fault::Fail),
    );
    let orchestrator = orchestrator(&engine, false);
    for name in ["a", "b", "c"] {
        orchestrator.add_service(service(name)).await;
    }
    orchestrator.run(&CancellationToken::new()).await.unwrap();

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(3600), orchestrator.stop())
        .await
        .expect("stop should give up on the hung container");
    // Only the hung stop costs time: its 15s timeout plus the grace period.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(20), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(25), "{:?}", elapsed);

    let teardown: Vec<String> = engine
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("stop:") || c.starts_with("remove:"))
        .collect();
    assert_eq!(
        teardown,
        [
            "stop:demo-c:15",
            "remove:demo-c",
            "stop:demo-b:15",
            "remove:demo-b",
            "stop:demo-a:15",
            "remove:demo-a",
        ]
    );

    let statuses = orchestrator.services().await;
    assert_eq!(statuses[0].state, ServiceState::Removed);
    assert_eq!(statuses[1].state, ServiceState::Failed);
    assert!(statuses[1].container_id.is_some());
    assert_eq!(statuses[2].state, ServiceState::Removed);
}

#[tokio::test(start_paused = true)]
async fn test_hung_removal_does_not_block_remaining_teardown() {
    let engine = Arc::new(FakeEngine::new().with_remove_fault("demo-c", Fault::Hang));
    let orchestrator = orchestrator(&engine, false);
    for name in ["a", "b", "c"] {
        orchestrator.add_service(service(name)).await;
    }
    orchestrator.run(&CancellationToken::new()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3600), orchestrator.stop())
        .await
        .expect("stop should give up on the hung removal");

    assert_eq!(
        engine.calls_with("remove:"),
        ["remove:demo-c", "remove:demo-b", "remove:demo-a"]
    );
    let statuses = orchestrator.services().await;
    assert_eq!(statuses[0].state, ServiceState::Removed);
    assert_eq!(statuses[1].state, ServiceState::Removed);
    assert_eq!(statuses[2].state, ServiceState::Failed);
    assert!(statuses[2].container_id.is_some());
}

#[tokio::test]
async fn test_debug_mode_skips_removal_and_attaches_output() {
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, true);
    orchestrator.add_service(service("a")).await;

    orchestrator.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(engine.calls_with("attach:"), vec!["attach:demo-a:true"]);

    orchestrator.stop().await;
    assert_eq!(engine.calls_with("stop:").len(), 1);
    assert!(engine.calls_with("remove:").is_empty());
    assert_eq!(orchestrator.services().await[0].state, ServiceState::Stopped);
}

#[tokio::test]
async fn test_forceful_run_removes_same_named_container_first() {
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_service(service("a")).await;

    orchestrator
        .run_forcefully(&CancellationToken::new())
        .await
        .unwrap();

    assert!(engine.position("remove:demo-a") < engine.position("create:demo-a"));
    assert!(engine.position("pull:example/a:1.0") < engine.position("remove:demo-a"));
}

#[tokio::test]
async fn test_run_after_stop_fails() {
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, false);
    orchestrator.stop().await;
    orchestrator.add_service(service("a")).await;

    let result = orchestrator.run(&CancellationToken::new()).await;
    assert!(matches!(result, Err(OrchestratorError::Stopped)));
    assert!(engine.calls_with("create:").is_empty());
}

#[tokio::test]
async fn test_cancelled_token_aborts_before_pull_completes() {
    let engine = Arc::new(FakeEngine::new());
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_service(service("a")).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orchestrator.run(&cancel).await;

    assert!(matches!(result, Err(OrchestratorError::Cancelled { ref service }) if service == "demo-a"));
    assert!(engine.calls_with("create:").is_empty());
}

#[tokio::test]
async fn test_exit_is_reported_in_status() {
    let engine = Arc::new(FakeEngine::new().with_exit("demo-a", 3));
    let orchestrator = orchestrator(&engine, false);
    orchestrator.add_service(service("a")).await;

    orchestrator.run(&CancellationToken::new()).await.unwrap();

    // The watcher reports asynchronously.
    let mut state = ServiceState::Running;
    for _ in 0..50 {
        state = orchestrator.services().await[0].state;
        if state != ServiceState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, ServiceState::Exited(3));
}
