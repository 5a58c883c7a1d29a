//! The status annotation written back to managed pods.
//!
//! The annotation records a human-readable status, the classified states, and
//! when the last scale was commanded, enacted or failed. Writes are skipped
//! when nothing but `lastUpdated` would change.

use crate::{
    client::{MutateError, Mutator},
    scale::ResourceName,
    states::States,
};
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use serde::{Deserialize, Serialize};
use startup_scaler_controller_k8s_api::{annotations, Pod};
use std::{fmt, sync::Arc};

const SCALE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";
const LAST_UPDATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAnnotation {
    pub status: String,
    pub states: States,
    pub scale: Scale,
    #[serde(default)]
    pub last_updated: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scale {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub enabled_for_resources: Vec<ResourceName>,
    #[serde(default)]
    pub last_commanded: String,
    #[serde(default)]
    pub last_enacted: String,
    #[serde(default)]
    pub last_failed: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Infeasible,
    Error,
}

/// The scale transition a status update records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScaleState {
    NotApplicable,
    Commanded(Direction),
    /// Resources were commanded while the applied resources matched neither
    /// configured set.
    UnknownCommanded,
    Enacted(Direction),
    Failed(Direction, FailureReason),
}

#[derive(Clone, Debug)]
pub struct ScaleMetrics {
    failure: Family<FailureLabels, Counter>,
    commanded_unknown_resources: Counter,
    duration: Family<DurationLabels, Histogram, fn() -> Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    direction: &'static str,
    reason: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DurationLabels {
    direction: &'static str,
    outcome: &'static str,
}

/// A source of the current time.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

/// Builds status mutators and records scale metrics for the writes that
/// succeed.
#[derive(Clone, Debug)]
pub struct StatusWriter {
    metrics: ScaleMetrics,
    clock: Clock,
}

/// A status update that has not been written yet.
///
/// The mutator may be applied several times when a write conflicts; only the
/// observations of its last application are recorded by [`PendingStatus::commit`].
pub struct PendingStatus {
    mutator: Mutator,
    observations: Arc<Mutex<Vec<Observation>>>,
    metrics: ScaleMetrics,
}

#[derive(Clone, Debug, PartialEq)]
enum Observation {
    CommandedUnknown,
    Duration {
        direction: Direction,
        outcome: &'static str,
        seconds: f64,
    },
    Failure {
        direction: Direction,
        reason: FailureReason,
    },
}

// === impl StatusAnnotation ===

impl StatusAnnotation {
    /// Reads the annotation from a pod, if present.
    pub fn from_pod(pod: &Pod) -> Result<Option<Self>, serde_json::Error> {
        pod.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::STATUS))
            .map(|v| serde_json::from_str(v))
            .transpose()
    }

    /// Builds the annotation that results from recording `scale_state` on top
    /// of `existing`, along with the metric observations the transition
    /// implies.
    fn next(
        existing: &Scale,
        status: &str,
        states: &States,
        scale_state: ScaleState,
        enabled: &[ResourceName],
        now: DateTime<Utc>,
    ) -> (Self, Vec<Observation>) {
        let stamp = now.format(SCALE_TIMESTAMP_FORMAT).to_string();
        let mut scale = Scale {
            enabled_for_resources: enabled.to_vec(),
            ..existing.clone()
        };
        let mut observations = Vec::new();

        match scale_state {
            ScaleState::NotApplicable => {}
            ScaleState::Commanded(_) | ScaleState::UnknownCommanded => {
                scale.last_commanded = stamp;
                scale.last_enacted.clear();
                scale.last_failed.clear();
                if scale_state == ScaleState::UnknownCommanded {
                    observations.push(Observation::CommandedUnknown);
                }
            }
            ScaleState::Enacted(direction) => {
                if scale.last_enacted.is_empty() && !scale.last_commanded.is_empty() {
                    scale.last_enacted = stamp;
                    observations.extend(duration(&scale.last_commanded, now, direction, "success"));
                }
            }
            ScaleState::Failed(direction, reason) => {
                if scale.last_failed.is_empty() {
                    scale.last_failed = stamp;
                    observations.push(Observation::Failure { direction, reason });
                    observations.extend(duration(&scale.last_commanded, now, direction, "failure"));
                }
            }
        }

        let annotation = Self {
            status: capitalize(status),
            states: states.clone(),
            scale,
            last_updated: now.format(LAST_UPDATED_FORMAT).to_string(),
        };
        (annotation, observations)
    }
}

/// Equality ignores `lastUpdated`.
impl PartialEq for StatusAnnotation {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status && self.states == other.states && self.scale == other.scale
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn duration(
    commanded: &str,
    now: DateTime<Utc>,
    direction: Direction,
    outcome: &'static str,
) -> Option<Observation> {
    if commanded.is_empty() {
        return None;
    }
    let commanded = match DateTime::<FixedOffset>::parse_from_str(commanded, SCALE_TIMESTAMP_FORMAT) {
        Ok(t) => t,
        Err(error) => {
            tracing::warn!(%error, %commanded, "Unable to parse last commanded timestamp");
            return None;
        }
    };
    let millis = (now - commanded.with_timezone(&Utc)).num_milliseconds();
    if millis < 0 {
        tracing::warn!(%commanded, %now, "Last commanded timestamp is in the future");
        return None;
    }
    Some(Observation::Duration {
        direction,
        outcome,
        seconds: millis as f64 / 1000.0,
    })
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ResourceName>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<ResourceName>>::deserialize(deserializer)?.unwrap_or_default())
}

// === impl Direction ===

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl FailureReason ===

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infeasible => "infeasible",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl ScaleMetrics ===

impl Default for ScaleMetrics {
    fn default() -> Self {
        Self {
            failure: Family::default(),
            commanded_unknown_resources: Counter::default(),
            duration: Family::new_with_constructor(duration_histogram as fn() -> Histogram),
        }
    }
}

fn duration_histogram() -> Histogram {
    // 1s through 128s.
    Histogram::new(exponential_buckets(1.0, 2.0, 8))
}

impl ScaleMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "failure",
            "Number of scales the kubelet failed to enact, by direction and reason",
            metrics.failure.clone(),
        );
        reg.register(
            "commanded_unknown_resources",
            "Number of scales commanded while the applied resources were unrecognised",
            metrics.commanded_unknown_resources.clone(),
        );
        reg.register(
            "duration_seconds",
            "Time from a scale being commanded to it being enacted or failing",
            metrics.duration.clone(),
        );
        metrics
    }

    fn record(&self, observation: &Observation) {
        match *observation {
            Observation::CommandedUnknown => {
                self.commanded_unknown_resources.inc();
            }
            Observation::Duration {
                direction,
                outcome,
                seconds,
            } => self
                .duration
                .get_or_create(&DurationLabels {
                    direction: direction.as_str(),
                    outcome,
                })
                .observe(seconds),
            Observation::Failure { direction, reason } => {
                self.failure
                    .get_or_create(&FailureLabels {
                        direction: direction.as_str(),
                        reason: reason.as_str(),
                    })
                    .inc();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn failure_count(&self, direction: Direction, reason: FailureReason) -> u64 {
        self.failure
            .get_or_create(&FailureLabels {
                direction: direction.as_str(),
                reason: reason.as_str(),
            })
            .get()
    }

    #[cfg(test)]
    pub(crate) fn commanded_unknown_count(&self) -> u64 {
        self.commanded_unknown_resources.get()
    }

    #[cfg(test)]
    pub(crate) fn has_duration(&self, direction: Direction, outcome: &'static str) -> bool {
        self.duration
            .get(&DurationLabels {
                direction: direction.as_str(),
                outcome,
            })
            .is_some()
    }
}

// === impl Clock ===

impl Clock {
    pub fn new(now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self(Arc::new(now))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(Utc::now)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Clock").finish()
    }
}

// === impl StatusWriter ===

impl StatusWriter {
    pub fn new(metrics: ScaleMetrics, clock: Clock) -> Self {
        Self { metrics, clock }
    }

    pub fn metrics(&self) -> &ScaleMetrics {
        &self.metrics
    }

    /// Prepares a status update. The returned mutator leaves the pod untouched
    /// when the resulting annotation equals the existing one.
    pub fn prepare(
        &self,
        status: impl Into<String>,
        states: &States,
        scale_state: ScaleState,
        enabled: &[ResourceName],
    ) -> PendingStatus {
        let status = status.into();
        let states = states.clone();
        let enabled = enabled.to_vec();
        let clock = self.clock.clone();
        let observations = Arc::new(Mutex::new(Vec::new()));

        let recorded = observations.clone();
        let mutator: Mutator = Arc::new(move |mut pod: Pod| -> Result<(bool, Pod), MutateError> {
            let existing = StatusAnnotation::from_pod(&pod).unwrap_or_else(|error| {
                tracing::warn!(%error, "Ignoring unparseable status annotation");
                None
            });
            let (next, observed) = StatusAnnotation::next(
                existing.as_ref().map(|a| &a.scale).unwrap_or(&Scale::default()),
                &status,
                &states,
                scale_state,
                &enabled,
                clock.now(),
            );
            if existing.as_ref() == Some(&next) {
                recorded.lock().clear();
                return Ok((false, pod));
            }

            let value = serde_json::to_string(&next)?;
            pod.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(annotations::STATUS.to_string(), value);
            *recorded.lock() = observed;
            Ok((true, pod))
        });

        PendingStatus {
            mutator,
            observations,
            metrics: self.metrics.clone(),
        }
    }
}

// === impl PendingStatus ===

impl PendingStatus {
    pub fn mutator(&self) -> Mutator {
        self.mutator.clone()
    }

    /// Records the metrics implied by the written update.
    pub fn commit(self) {
        for observation in self.observations.lock().drain(..) {
            self.metrics.record(&observation);
        }
    }
}

impl fmt::Debug for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStatus")
            .field("observations", &*self.observations.lock())
            .finish()
    }
}
