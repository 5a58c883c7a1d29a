use super::fixtures::*;
use crate::{
    action::ActionError,
    predicate::{Decision, PodEvent},
    reconcile::{Config, Outcome, ReconcileError, Reconciler, ReconcilerMetrics},
    scale::{ResourceName, ScaleConfigError},
    states::{ResizeState, ResourcesState, StatusResourcesState},
    status::{Clock, Direction, FailureReason, ScaleMetrics, StatusAnnotation, StatusWriter},
    RetryPolicy,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use startup_scaler_controller_k8s_api::{
    annotations,
    pod::{self, RESIZE_IN_PROGRESS, RESIZE_PENDING},
    Pod, Quantity, ResourceId,
};
use std::sync::Arc;
use tokio::time;

struct Harness {
    client: Arc<FakeClient>,
    reconciler: Arc<Reconciler<FakeClient>>,
    scale: ScaleMetrics,
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Harness {
    fn new(pod: Pod) -> Self {
        Self::with_config(pod, config())
    }

    fn with_config(pod: Pod, config: Config) -> Self {
        let now = Arc::new(Mutex::new(epoch()));
        let clock = {
            let now = now.clone();
            Clock::new(move || *now.lock())
        };
        let scale = ScaleMetrics::default();
        let client = Arc::new(FakeClient::new(pod));
        let reconciler = Arc::new(Reconciler::new(
            config,
            client.clone(),
            StatusWriter::new(scale.clone(), clock),
            ReconcilerMetrics::default(),
        ));
        Self {
            client,
            reconciler,
            scale,
            now,
        }
    }

    fn advance(&self, millis: i64) {
        *self.now.lock() += chrono::Duration::milliseconds(millis);
    }

    async fn reconcile(&self) -> Outcome {
        self.reconciler.reconcile(id()).await
    }

    fn pod(&self) -> Pod {
        self.client.pod(&id())
    }

    /// Applies a change to the stored pod, as the kubelet or a user would.
    fn update(&self, f: impl FnOnce(&mut Pod)) {
        let mut pod = self.pod();
        f(&mut pod);
        self.client.put(pod);
    }

    fn status(&self) -> StatusAnnotation {
        status_annotation(&self.pod())
    }

    fn resize_writes(&self) -> usize {
        self.client
            .writes()
            .iter()
            .filter(|w| w.touches_resize)
            .count()
    }
}

fn config() -> Config {
    Config {
        retry: RetryPolicy::new(1, time::Duration::ZERO),
        awaiting_memory_message: "attempting to resize memory limit".to_string(),
        ..Config::new(ResourceName::ALL.to_vec())
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn id() -> ResourceId {
    ResourceId::new("ns-0", "pod-0")
}

fn spec_quantity(pod: &Pod, resource: &str) -> (Option<Quantity>, Option<Quantity>) {
    let container = pod::container(pod, "app").unwrap();
    (
        pod::spec_requests(container, resource).cloned(),
        pod::spec_limits(container, resource).cloned(),
    )
}

fn q(s: &str) -> Option<Quantity> {
    Some(Quantity(s.to_string()))
}

/// A pod that has started with its startup resources applied.
fn started_pod() -> Pod {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    with_container_status(&mut pod, Some(true), true, Some(("3m", "3M")));
    pod
}

#[tokio::test]
async fn first_time_startup() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    with_container_status(&mut pod, Some(false), false, Some(("0", "0")));
    let h = Harness::new(pod);

    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.resize_writes(), 0);

    let status = h.status();
    assert_eq!(status.states.resources, ResourcesState::Startup);
    assert_eq!(status.states.status_resources, StatusResourcesState::Incomplete);
    assert_eq!(status.states.resize.state, ResizeState::NotStartedOrCompleted);
    assert_eq!(status.status, "Startup scale in progress");
    assert_eq!(status.scale.last_commanded, "");
    assert_eq!(
        status.scale.enabled_for_resources,
        vec![ResourceName::Cpu, ResourceName::Memory]
    );
}

#[tokio::test]
async fn container_not_running() {
    let h = Harness::new(mk_pod(ScaleAnnotations::cpu_and_memory()));
    assert!(matches!(h.reconcile().await, Outcome::Done));
    let status = h.status();
    assert_eq!(status.status, "Target container currently not running");
    assert_eq!(status.states.status_resources, StatusResourcesState::Unknown);
    assert_eq!(h.resize_writes(), 0);
}

#[tokio::test]
async fn scale_down_commanded_then_enacted() {
    let h = Harness::new(started_pod());

    // Scale down once started.
    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.resize_writes(), 1);
    let pod = h.pod();
    assert_eq!(spec_quantity(&pod, "cpu"), (q("1m"), q("1m")));
    assert_eq!(spec_quantity(&pod, "memory"), (q("1M"), q("1M")));
    let status = h.status();
    assert_eq!(status.status, "Post-startup resources commanded");
    assert_eq!(status.scale.last_commanded, "2025-01-01T00:00:00.000+0000");
    assert_eq!(status.scale.last_enacted, "");
    let writes = h.client.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].pod.metadata.resource_version,
        pod.metadata.resource_version
    );

    // The kubelet applies the resize.
    h.advance(1_200);
    h.update(|pod| with_container_status(pod, Some(true), true, Some(("1m", "1M"))));
    assert!(matches!(h.reconcile().await, Outcome::Done));
    let status = h.status();
    assert_eq!(status.status, "Post-startup resources enacted");
    assert_eq!(status.states.resources, ResourcesState::PostStartup);
    assert_eq!(
        status.states.status_resources,
        StatusResourcesState::ContainerResourcesMatch
    );
    assert_eq!(status.scale.last_commanded, "2025-01-01T00:00:00.000+0000");
    assert_eq!(status.scale.last_enacted, "2025-01-01T00:00:01.200+0000");
    assert!(h.scale.has_duration(Direction::Down, "success"));

    // Nothing changes on a later reconcile.
    let writes = h.client.writes().len();
    h.advance(60_000);
    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.client.writes().len(), writes);
    assert_eq!(h.status().scale.last_enacted, "2025-01-01T00:00:01.200+0000");
}

#[tokio::test]
async fn resize_in_progress_waits() {
    let h = Harness::new(started_pod());
    h.reconcile().await;
    h.update(|pod| {
        with_container_status(pod, Some(true), true, Some(("3m", "3M")));
        resize_condition(pod, RESIZE_IN_PROGRESS, "", "");
    });

    assert!(matches!(h.reconcile().await, Outcome::Done));
    let status = h.status();
    assert_eq!(status.status, "Post-startup scale in progress");
    assert_eq!(status.scale.last_enacted, "");
    assert!(!h.scale.has_duration(Direction::Down, "success"));
}

#[tokio::test]
async fn deferred_resize_waits() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    with_container_status(&mut pod, Some(false), false, Some(("1m", "1M")));
    resize_condition(&mut pod, RESIZE_PENDING, "Deferred", "node busy");
    let h = Harness::new(pod);

    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.status().status, "Startup scale deferred (node busy)");
}

#[tokio::test]
async fn infeasible_startup() {
    let mut annotations = ScaleAnnotations::cpu_and_memory();
    annotations.cpu_startup = Some("1000".to_string());
    let mut pod = mk_pod(annotations);
    set_spec_resources(&mut pod, "1000", "3M");
    with_container_status(&mut pod, Some(false), false, Some(("1m", "1M")));
    resize_condition(
        &mut pod,
        RESIZE_PENDING,
        "Infeasible",
        "insufficient node capacity",
    );
    let h = Harness::new(pod);

    let outcome = h.reconcile().await;
    assert!(matches!(
        outcome,
        Outcome::Terminal(ReconcileError::StatesAction(ActionError::ScaleFailed {
            direction: Direction::Up,
            reason: FailureReason::Infeasible,
            ..
        }))
    ));
    let status = h.status();
    assert_eq!(
        status.status,
        "Startup scale failed - infeasible (insufficient node capacity)"
    );
    assert_eq!(status.scale.last_failed, "2025-01-01T00:00:00.000+0000");
    assert_eq!(h.reconciler.metrics().failure_count("states_action"), 1);
    assert_eq!(
        h.scale.failure_count(Direction::Up, FailureReason::Infeasible),
        1
    );
    assert_eq!(h.resize_writes(), 0);
}

#[tokio::test]
async fn resize_error_fails_unless_awaiting_memory() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    set_spec_resources(&mut pod, "1m", "1M");
    with_container_status(&mut pod, Some(true), true, Some(("3m", "3M")));
    resize_condition(
        &mut pod,
        RESIZE_IN_PROGRESS,
        "Error",
        "attempting to resize memory limit (1M) below usage",
    );
    let h = Harness::new(pod);
    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.status().status, "Post-startup scale in progress");

    h.update(|pod| resize_condition(pod, RESIZE_IN_PROGRESS, "Error", "runtime failure"));
    assert!(matches!(
        h.reconcile().await,
        Outcome::Terminal(ReconcileError::StatesAction(ActionError::ScaleFailed {
            reason: FailureReason::Error,
            ..
        }))
    ));
    assert_eq!(
        h.status().status,
        "Post-startup scale failed - error (runtime failure)"
    );
    assert_eq!(h.scale.failure_count(Direction::Down, FailureReason::Error), 1);
}

#[tokio::test]
async fn restart_after_post_startup() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    set_spec_resources(&mut pod, "1m", "1M");
    with_container_status(&mut pod, Some(false), false, Some(("1m", "1M")));
    let h = Harness::new(pod);

    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.resize_writes(), 1);
    let pod = h.pod();
    assert_eq!(spec_quantity(&pod, "cpu"), (q("3m"), q("3m")));
    assert_eq!(spec_quantity(&pod, "memory"), (q("3M"), q("3M")));
    assert_eq!(h.status().status, "Startup resources commanded");
}

#[tokio::test]
async fn readiness_probe_only() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    {
        let container = pod::container_mut(&mut pod, "app").unwrap();
        container.startup_probe = None;
        container.readiness_probe = Some(Default::default());
    }
    with_container_status(&mut pod, Some(true), false, Some(("3m", "3M")));
    let h = Harness::new(pod);

    // Started but not ready: still starting up.
    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.resize_writes(), 0);

    h.update(|pod| with_container_status(pod, Some(true), true, Some(("3m", "3M"))));
    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.resize_writes(), 1);
}

#[tokio::test]
async fn unknown_started_state_is_a_noop() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    with_container_status(&mut pod, None, false, Some(("3m", "3M")));
    let h = Harness::new(pod);
    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert!(h.client.writes().is_empty());
}

#[tokio::test]
async fn unknown_resources_are_not_scaled_by_default() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    set_spec_resources(&mut pod, "2m", "2M");
    with_container_status(&mut pod, Some(true), true, Some(("2m", "2M")));
    let h = Harness::new(pod);

    assert!(matches!(
        h.reconcile().await,
        Outcome::Terminal(ReconcileError::StatesAction(ActionError::UnknownResources))
    ));
    assert_eq!(h.resize_writes(), 0);
    assert_eq!(h.status().status, "Unknown resources applied");
}

#[tokio::test]
async fn unknown_resources_scaled_when_allowed() {
    let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
    set_spec_resources(&mut pod, "2m", "2M");
    with_container_status(&mut pod, Some(true), true, Some(("2m", "2M")));
    let h = Harness::with_config(
        pod,
        Config {
            scale_when_unknown_resources: true,
            ..config()
        },
    );

    assert!(matches!(h.reconcile().await, Outcome::Done));
    assert_eq!(h.resize_writes(), 1);
    assert_eq!(spec_quantity(&h.pod(), "cpu"), (q("1m"), q("1m")));
    assert_eq!(h.status().scale.last_commanded, "2025-01-01T00:00:00.000+0000");
    assert_eq!(h.scale.commanded_unknown_count(), 1);
}

#[tokio::test]
async fn failed_resize_command_is_terminal() {
    let h = Harness::new(started_pod());
    h.client.fail_resize();
    assert!(matches!(
        h.reconcile().await,
        Outcome::Terminal(ReconcileError::StatesAction(ActionError::Command(_)))
    ));
    assert!(h.client.writes().is_empty());
}

#[tokio::test]
async fn validation_failures_are_recorded() {
    let mut pod = started_pod();
    pod.status.as_mut().unwrap().qos_class = Some("Burstable".to_string());
    let h = Harness::new(pod);

    assert!(matches!(
        h.reconcile().await,
        Outcome::Terminal(ReconcileError::Validation(_))
    ));
    assert_eq!(
        h.status().status,
        "Validation error: pod qos class \"Burstable\" is not Guaranteed"
    );
    assert_eq!(h.reconciler.metrics().failure_count("validation"), 1);
    assert_eq!(h.resize_writes(), 0);
}

#[tokio::test]
async fn configuration_failures_are_recorded() {
    let mut annotations = ScaleAnnotations::cpu_and_memory();
    annotations.memory_startup = Some("plenty".to_string());
    let h = Harness::new(mk_pod(annotations));

    assert!(matches!(
        h.reconcile().await,
        Outcome::Terminal(ReconcileError::Configuration(_))
    ));
    assert!(h.status().status.starts_with("Configuration error: "));
    assert_eq!(h.reconciler.metrics().failure_count("configuration"), 1);
}

#[tokio::test]
async fn missing_target_container_name_is_recorded() {
    let mut annotations = ScaleAnnotations::cpu_and_memory();
    annotations.target_container_name = None;
    let h = Harness::new(mk_pod(annotations));

    assert!(matches!(
        h.reconcile().await,
        Outcome::Terminal(ReconcileError::Configuration(
            ScaleConfigError::MissingTargetContainerName
        ))
    ));
    assert_eq!(
        h.status().status,
        "Configuration error: target container name annotation not present"
    );
}

#[tokio::test]
async fn missing_pods_are_terminal() {
    let h = Harness::new(started_pod());
    h.client.remove(&id());
    assert!(matches!(
        h.reconcile().await,
        Outcome::Terminal(ReconcileError::PodDoesNotExist)
    ));
    assert_eq!(h.reconciler.metrics().failure_count("pod_does_not_exist"), 1);
}

#[tokio::test]
async fn get_failures_requeue() {
    let h = Harness::new(started_pod());
    h.client.fail_gets();
    assert!(matches!(
        h.reconcile().await,
        Outcome::Requeue(d) if d == time::Duration::from_secs(1)
    ));
    assert_eq!(h.reconciler.metrics().failure_count("unable_to_get_pod"), 1);
}

#[tokio::test]
async fn concurrent_reconciles_are_serialized() {
    let h = Harness::new(started_pod());
    let (entered, release) = h.client.gate();

    let first = h.reconcile();
    let second = async {
        entered.notified().await;
        assert!(h.reconciler.is_in_progress(&id()));
        let outcome = h.reconcile().await;
        release.notify_one();
        outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first, Outcome::Done));
    assert!(matches!(second, Outcome::Requeue(_)));
    assert_eq!(h.reconciler.metrics().existing_in_progress_count(), 1);
    assert!(!h.reconciler.is_in_progress(&id()));
    assert_eq!(h.resize_writes(), 1);
}

#[tokio::test]
async fn in_progress_cleared_after_panic() {
    let h = Harness::new(started_pod());
    h.client.panic_on_get();
    let reconciler = h.reconciler.clone();
    let res = tokio::spawn(async move { reconciler.reconcile(id()).await }).await;
    assert!(res.is_err());
    assert!(!h.reconciler.is_in_progress(&id()));
}

#[tokio::test]
async fn only_status_change_is_not_reconciled() {
    let h = Harness::new(started_pod());
    h.reconcile().await;

    let old = h.pod();
    let mut new = old.clone();
    new.metadata.resource_version = Some("999".to_string());
    new.metadata
        .annotations
        .as_mut()
        .unwrap()
        .insert(annotations::STATUS.to_string(), "{}".to_string());

    let metrics = h.reconciler.metrics();
    let event = PodEvent::Update {
        old: &old,
        new: &new,
    };
    assert_eq!(event.decide(metrics), Decision::Skip);
    assert_eq!(metrics.skipped_only_status_change_count(), 1);
}
