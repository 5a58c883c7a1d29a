//! The per-pod reconcile loop body.

use crate::{
    action::{ActionError, Router, Target},
    client::{PodClient, ReconcileContext},
    scale::{ResourceName, ScaleConfigError, ScaleConfigs},
    states::{Classifier, States, StatesError},
    status::{ScaleState, StatusWriter},
    validation::{validate, ValidationError},
    RetryPolicy,
};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use startup_scaler_controller_k8s_api::{Pod, ResourceId};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tokio::time;
use tracing::{field, Instrument};

#[derive(Clone, Debug)]
pub struct Config {
    /// Resources the controller scales. Pods must not configure others.
    pub enabled_resources: Vec<ResourceName>,
    pub retry: RetryPolicy,
    /// Delay before re-examining a pod that could not be reconciled now.
    pub requeue_after: time::Duration,
    /// Delay before re-examining a successfully reconciled pod.
    pub resync_after: time::Duration,
    pub scale_when_unknown_resources: bool,
    pub awaiting_memory_message: String,
}

/// How the work queue should treat the pod after a reconcile.
#[derive(Debug)]
pub enum Outcome {
    Done,
    Requeue(time::Duration),
    /// Do not requeue; the next change to the pod triggers a reconcile.
    Terminal(ReconcileError),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("pod does not exist")]
    PodDoesNotExist,

    #[error("configuration error: {0}")]
    Configuration(#[from] ScaleConfigError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("unable to determine states: {0}")]
    StatesDetermination(#[from] StatesError),

    #[error("unable to action states: {0}")]
    StatesAction(#[from] ActionError),
}

#[derive(Clone, Debug, Default)]
pub struct ReconcilerMetrics {
    skipped_only_status_change: Counter,
    existing_in_progress: Counter,
    failure: Family<FailureLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    reason: &'static str,
}

pub struct Reconciler<C: ?Sized> {
    config: Config,
    classifier: Classifier,
    router: Router,
    metrics: ReconcilerMetrics,
    in_progress: Mutex<HashSet<ResourceId>>,
    client: Arc<C>,
}

/// Removes a pod from the in-progress set when dropped, including while
/// unwinding.
struct InProgress<'a> {
    set: &'a Mutex<HashSet<ResourceId>>,
    id: ResourceId,
}

// === impl Config ===

impl Config {
    pub fn new(enabled_resources: Vec<ResourceName>) -> Self {
        Self {
            enabled_resources,
            retry: RetryPolicy::default(),
            requeue_after: time::Duration::from_secs(1),
            resync_after: time::Duration::from_secs(60 * 60),
            scale_when_unknown_resources: false,
            awaiting_memory_message: String::new(),
        }
    }
}

// === impl ReconcileError ===

impl ReconcileError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PodDoesNotExist => "pod_does_not_exist",
            Self::Configuration(_) => "configuration",
            Self::Validation(_) => "validation",
            Self::StatesDetermination(_) => "states_determination",
            Self::StatesAction(_) => "states_action",
        }
    }
}

// === impl ReconcilerMetrics ===

impl ReconcilerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "skipped_only_status_change",
            "Count of pod updates skipped because only the status annotation changed",
            metrics.skipped_only_status_change.clone(),
        );
        reg.register(
            "existing_in_progress",
            "Count of reconciles deferred because the pod was already being reconciled",
            metrics.existing_in_progress.clone(),
        );
        reg.register(
            "failure",
            "Count of failed reconciles, by reason",
            metrics.failure.clone(),
        );
        metrics
    }

    pub fn skipped_only_status_change(&self) {
        self.skipped_only_status_change.inc();
    }

    fn existing_in_progress(&self) {
        self.existing_in_progress.inc();
    }

    fn failure(&self, reason: &'static str) {
        self.failure.get_or_create(&FailureLabels { reason }).inc();
    }

    #[cfg(test)]
    pub(crate) fn skipped_only_status_change_count(&self) -> u64 {
        self.skipped_only_status_change.get()
    }

    #[cfg(test)]
    pub(crate) fn existing_in_progress_count(&self) -> u64 {
        self.existing_in_progress.get()
    }

    #[cfg(test)]
    pub(crate) fn failure_count(&self, reason: &'static str) -> u64 {
        self.failure.get_or_create(&FailureLabels { reason }).get()
    }
}

// === impl Reconciler ===

impl<C> Reconciler<C>
where
    C: PodClient + ?Sized,
{
    pub fn new(
        config: Config,
        client: Arc<C>,
        status: StatusWriter,
        metrics: ReconcilerMetrics,
    ) -> Self {
        Self {
            classifier: Classifier::new(config.awaiting_memory_message.clone()),
            router: Router::new(status, config.scale_when_unknown_resources),
            config,
            metrics,
            in_progress: Mutex::new(HashSet::new()),
            client,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &ReconcilerMetrics {
        &self.metrics
    }

    /// Reconciles a pod. At most one reconcile runs per pod at a time; a
    /// concurrent request for the same pod is requeued.
    pub async fn reconcile(&self, id: ResourceId) -> Outcome {
        let Some(_guard) = self.begin(&id) else {
            tracing::debug!(namespace = %id.namespace, name = %id.name, "Reconcile already in progress");
            self.metrics.existing_in_progress();
            return Outcome::Requeue(self.config.requeue_after);
        };

        let span = tracing::info_span!(
            "reconcile",
            namespace = %id.namespace,
            name = %id.name,
            container = field::Empty,
            states = field::Empty,
        );
        let ctx = ReconcileContext::new(id, self.config.retry);
        let outcome = self.reconcile_pod(&ctx).instrument(span).await;

        match &outcome {
            Outcome::Terminal(error) => {
                tracing::info!(namespace = %ctx.id.namespace, name = %ctx.id.name, %error, "Reconcile failed");
                self.metrics.failure(error.reason());
            }
            Outcome::Done | Outcome::Requeue(_) => {}
        }
        outcome
    }

    fn begin(&self, id: &ResourceId) -> Option<InProgress<'_>> {
        let mut set = self.in_progress.lock();
        if !set.insert(id.clone()) {
            return None;
        }
        Some(InProgress {
            set: &self.in_progress,
            id: id.clone(),
        })
    }

    /// Whether a reconcile of `id` is running.
    pub fn is_in_progress(&self, id: &ResourceId) -> bool {
        self.in_progress.lock().contains(id)
    }

    async fn reconcile_pod(&self, ctx: &ReconcileContext) -> Outcome {
        let pod = match self.client.get(ctx, &ctx.id).await {
            Ok(Some(pod)) => pod,
            Ok(None) => return Outcome::Terminal(ReconcileError::PodDoesNotExist),
            Err(error) => {
                tracing::warn!(%error, "Unable to get pod");
                self.metrics.failure("unable_to_get_pod");
                return Outcome::Requeue(self.config.requeue_after);
            }
        };

        let configs = match ScaleConfigs::from_annotations(&pod, &self.config.enabled_resources) {
            Ok(configs) => configs,
            Err(error) => {
                let error = ReconcileError::from(error);
                self.write_failure_status(ctx, &pod, &error).await;
                return Outcome::Terminal(error);
            }
        };
        let container_name = match configs.target_container_name() {
            Ok(name) => name,
            Err(error) => {
                let error = ReconcileError::from(error);
                self.write_failure_status(ctx, &pod, &error).await;
                return Outcome::Terminal(error);
            }
        };
        tracing::debug!(%configs, "Read scale configuration");

        if let Err(error) = validate(&pod, container_name, &configs) {
            let error = ReconcileError::from(error);
            self.write_failure_status(ctx, &pod, &error).await;
            return Outcome::Terminal(error);
        }

        let states = match self.classifier.classify(&pod, container_name, &configs) {
            Ok(states) => states,
            Err(error) => return Outcome::Terminal(error.into()),
        };
        let span = tracing::Span::current();
        span.record("container", container_name);
        span.record("states", field::display(&states));

        let target = Target {
            pod: &pod,
            container_name,
            configs: &configs,
            states: &states,
        };
        match self.router.route(&*self.client, ctx, target).await {
            Ok(()) => Outcome::Done,
            Err(error) => Outcome::Terminal(error.into()),
        }
    }

    /// Records a configuration or validation failure in the status annotation.
    async fn write_failure_status(&self, ctx: &ReconcileContext, pod: &Pod, error: &ReconcileError) {
        let pending = self.router.status().prepare(
            error.to_string(),
            &States::default(),
            ScaleState::NotApplicable,
            &self.config.enabled_resources,
        );
        let once = ReconcileContext {
            retry: RetryPolicy::once(),
            ..ctx.clone()
        };
        match self
            .client
            .patch(&once, pod, &[pending.mutator()], false, true)
            .await
        {
            Ok(_) => pending.commit(),
            Err(error) => tracing::warn!(%error, "Failed to update status"),
        }
    }
}

// === impl InProgress ===

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}
