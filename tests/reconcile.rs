//! End-to-end tests: configuration through plan, apply and state on disk.

use std::sync::Arc;

use serde_json::json;
use stratum::config::ConfigParser;
use stratum::error::{StateError, StratumError};
use stratum::planner::{Action, Plan, StepStatus};
use stratum::provider::{ProviderRegistry, SimulatedProvider};
use stratum::reconciler::Reconciler;
use stratum::state::{LocalStateStore, StateStore};
use stratum::{ResourceId, StackConfig};
use tempfile::TempDir;

const STACK: &str = r#"
project:
  name: web
variables:
  cidr:
    default: "10.0.0.0/16"
  replicas:
    default: 1
environments:
  prod:
    variables:
      replicas: 3
resources:
  - type: network
    name: main
    attributes:
      cidr: "${var.cidr}"
    replace_on_change: [cidr]
  - type: subnet
    name: a
    attributes:
      network_id: "${network.main.id}"
      cidr: "10.0.1.0/24"
modules:
  - name: app
    inputs:
      subnet_id: "${subnet.a.id}"
      replicas: "${var.replicas}"
    variables:
      subnet_id: {}
      replicas: {}
    resources:
      - type: service
        name: api
        attributes:
          subnet_id: "${var.subnet_id}"
          replicas: "${var.replicas}"
    outputs:
      service_id: "${service.api.id}"
outputs:
  service_id: "${module.app.service_id}"
"#;

fn config() -> StackConfig {
    ConfigParser::new().parse_yaml(STACK, None).unwrap()
}

fn setup() -> (TempDir, Arc<SimulatedProvider>, Arc<LocalStateStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalStateStore::with_base_dir(dir.path().join(".stratum")));
    (dir, Arc::new(SimulatedProvider::new()), store)
}

fn reconciler(provider: &Arc<SimulatedProvider>, store: &Arc<LocalStateStore>) -> Reconciler {
    Reconciler::new(config(), provider.clone(), store.clone())
}

fn service() -> ResourceId {
    ResourceId::new(vec![String::from("app")], "service", "api")
}

#[tokio::test]
async fn test_saved_plan_applies_and_second_plan_is_empty() {
    let (_dir, provider, store) = setup();

    let plan = reconciler(&provider, &store).plan().await.unwrap();
    let order: Vec<String> = plan.entries.iter().map(|e| e.id.to_string()).collect();
    assert_eq!(order, vec!["network.main", "subnet.a", "module.app.service.api"]);

    // A plan survives serialization and is applied by a fresh process.
    let saved = plan.to_json().unwrap();
    let loaded = Plan::from_json(&saved).unwrap();
    let report = reconciler(&provider, &store).apply(&loaded).await.unwrap();
    assert_eq!(report.succeeded(), 3);

    let network_id = store
        .get(&ResourceId::root("network", "main"))
        .await
        .unwrap()
        .unwrap()
        .attributes["id"]
        .clone();
    let subnet = store
        .get(&ResourceId::root("subnet", "a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subnet.attributes["network_id"], network_id);

    let again = reconciler(&provider, &store).plan().await.unwrap();
    assert!(!again.has_changes());
    assert_eq!(again.summary().unchanged, 3);
}

#[tokio::test]
async fn test_outputs_cross_module_boundary() {
    let (_dir, provider, store) = setup();
    let reconciler = reconciler(&provider, &store);
    reconciler.reconcile().await.unwrap();

    let outputs = reconciler.outputs().await.unwrap();
    let recorded = store.get(&service()).await.unwrap().unwrap();
    assert_eq!(outputs["service_id"], recorded.attributes["id"]);
}

#[tokio::test]
async fn test_environment_overlay_updates_in_place() {
    let (_dir, provider, store) = setup();
    reconciler(&provider, &store).reconcile().await.unwrap();

    let prod = reconciler(&provider, &store).with_environment("prod");
    let plan = prod.plan().await.unwrap();
    let (_, entry) = plan.entry(&service(), Action::Update).unwrap();
    assert_eq!(entry.changes[0].attribute, "replicas");

    prod.apply(&plan).await.unwrap();
    let record = store.get(&service()).await.unwrap().unwrap();
    assert_eq!(record.attributes["replicas"], json!(3));
    assert_eq!(record.serial, 3);
}

#[tokio::test]
async fn test_partial_failure_converges_on_next_run() {
    let (_dir, provider, store) = setup();
    provider.fail_on(&ResourceId::root("subnet", "a"), "quota exceeded");

    let reconciler = reconciler(&provider, &store).with_max_attempts(1);
    let plan = reconciler.plan().await.unwrap();
    let err = reconciler.apply(&plan).await.unwrap_err();
    let StratumError::Apply(failed) = err else {
        panic!("expected an apply failure, got {err}");
    };
    let statuses: Vec<StepStatus> = failed.report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(store.list().await.unwrap().len(), 1);

    provider.clear_failure(&ResourceId::root("subnet", "a"));
    let plan = reconciler.plan().await.unwrap();
    let summary = plan.summary();
    assert_eq!((summary.create, summary.unchanged), (2, 1));
    reconciler.apply(&plan).await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_concurrent_run_is_refused() {
    let (_dir, provider, store) = setup();
    let held = store.acquire_lock("other-host").await.unwrap();

    let reconciler = reconciler(&provider, &store);
    let plan = reconciler.plan().await.unwrap();
    let err = reconciler.apply(&plan).await.unwrap_err();
    assert!(matches!(
        err,
        StratumError::State(StateError::LockedByOther { .. })
    ));
    assert!(provider.calls().is_empty());

    store.release_lock(&held.lock_id).await.unwrap();
    reconciler.apply(&plan).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_apply_leaves_remaining_work_for_next_plan() {
    let (_dir, provider, store) = setup();
    let reconciler = reconciler(&provider, &store);
    let plan = reconciler.plan().await.unwrap();

    reconciler.cancellation_token().cancel();
    let report = reconciler.apply(&plan).await.unwrap();
    assert!(report.cancelled);
    assert!(report.outcomes.iter().all(|o| o.status == StepStatus::Cancelled));
    assert!(!store.is_locked().await.unwrap());

    let next = self::reconciler(&provider, &store).plan().await.unwrap();
    assert_eq!(next.summary().create, 3);
}

#[tokio::test]
async fn test_destroy_empties_state() {
    let (dir, provider, store) = setup();
    let reconciler = reconciler(&provider, &store);
    reconciler.reconcile().await.unwrap();
    assert!(dir.path().join(".stratum/records").exists());

    reconciler.destroy().await.unwrap();
    assert!(store.list().await.unwrap().is_empty());
    assert!(!provider.exists(&service()));
}

#[tokio::test]
async fn test_refresh_from_new_process_keeps_records() {
    let (_dir, _, store) = setup();
    let registry = || Arc::new(ProviderRegistry::from_config(&config()).unwrap());

    Reconciler::new(config(), registry(), store.clone())
        .reconcile()
        .await
        .unwrap();
    let applied = store.list().await.unwrap();
    assert_eq!(applied.len(), 3);

    // A later invocation builds its own simulated provider.
    let later = Reconciler::new(config(), registry(), store.clone());
    let drift = later.check_drift().await.unwrap();
    assert!(drift.is_converged(), "{:?}", drift.drifted);

    let refreshed = later.refresh().await.unwrap();
    assert!(refreshed.drifted.is_empty());
    assert_eq!(store.list().await.unwrap(), applied);
    assert!(!later.plan().await.unwrap().has_changes());
}
