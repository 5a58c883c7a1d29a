//! Classification of a pod's target container into a [`States`] vector.
//!
//! Classification never fails because the kubelet has not reported something
//! yet: absent statuses produce `unknown` fields, which the action router
//! treats as a reason to wait.

use crate::scale::{ScaleConfigs, ScaleResources};
use serde::{Deserialize, Serialize};
use startup_scaler_controller_k8s_api::{
    pod::{self, ShapeError},
    Container, ContainerState, MilliValue, Pod, Quantity,
};
use std::fmt;
use thiserror::Error;

pub const REASON_DEFERRED: &str = "Deferred";
pub const REASON_INFEASIBLE: &str = "Infeasible";
pub const REASON_ERROR: &str = "Error";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolState {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcesState {
    Startup,
    PostStartup,
    #[default]
    Unknown,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusResourcesState {
    /// Some enabled resource has no (or a zero) current value.
    Incomplete,
    ContainerResourcesMatch,
    ContainerResourcesMismatch,
    #[default]
    Unknown,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeState {
    NotStartedOrCompleted,
    InProgress,
    Deferred,
    Infeasible,
    Error,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Resize {
    pub state: ResizeState,
    pub message: String,
}

/// The classification of a target container at a point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct States {
    pub startup_probe: BoolState,
    pub readiness_probe: BoolState,
    pub container: ContainerState,
    pub started: BoolState,
    pub ready: BoolState,
    pub resources: ResourcesState,
    pub status_resources: StatusResourcesState,
    pub resize: Resize,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StatesError {
    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("unrecognised resize pending reason {reason:?}: {message}")]
    UnknownPendingReason { reason: String, message: String },
}

/// Derives [`States`] for a pod.
#[derive(Clone, Debug)]
pub struct Classifier {
    /// Text in a resize `Error` message indicating the kubelet is waiting for
    /// memory use to fall before applying a lower limit. Such resizes are
    /// still in progress rather than failed.
    awaiting_memory_message: String,
}

// === impl BoolState ===

impl From<bool> for BoolState {
    fn from(b: bool) -> Self {
        if b {
            Self::True
        } else {
            Self::False
        }
    }
}

impl From<Option<bool>> for BoolState {
    fn from(b: Option<bool>) -> Self {
        b.map(Self::from).unwrap_or(Self::Unknown)
    }
}

// === impl Resize ===

impl Resize {
    pub fn new(state: ResizeState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

// === impl States ===

impl fmt::Display for States {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            startup_probe,
            readiness_probe,
            container,
            started,
            ready,
            resources,
            status_resources,
            resize,
        } = self;
        write!(
            f,
            "startupProbe={} readinessProbe={} container={container} started={} ready={} resources={} statusResources={} resize={}",
            json_str(startup_probe),
            json_str(readiness_probe),
            json_str(started),
            json_str(ready),
            json_str(resources),
            json_str(status_resources),
            json_str(&resize.state),
        )
    }
}

fn json_str<T: Serialize>(v: &T) -> String {
    match serde_json::to_value(v) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "unknown".to_string(),
    }
}

// === impl Classifier ===

impl Classifier {
    pub fn new(awaiting_memory_message: impl Into<String>) -> Self {
        Self {
            awaiting_memory_message: awaiting_memory_message.into(),
        }
    }

    pub fn classify(
        &self,
        pod: &Pod,
        container_name: &str,
        configs: &ScaleConfigs,
    ) -> Result<States, StatesError> {
        let container = pod::container(pod, container_name)?;

        let container_state = match pod::container_state(pod, container_name) {
            Ok(state) => state,
            Err(error) => {
                tracing::debug!(%error, "Container state not yet available");
                ContainerState::Unknown
            }
        };
        let started = pod::started(pod, container_name)
            .map(BoolState::from)
            .unwrap_or_default();
        let ready = pod::ready(pod, container_name)
            .map(BoolState::from)
            .unwrap_or_default();

        Ok(States {
            startup_probe: pod::has_startup_probe(container).into(),
            readiness_probe: pod::has_readiness_probe(container).into(),
            container: container_state,
            started,
            ready,
            resources: resources_state(container, configs),
            status_resources: status_resources_state(pod, container, configs),
            resize: self.resize(pod)?,
        })
    }

    /// Maps the pod's resize conditions onto a single resize state.
    pub fn resize(&self, pod: &Pod) -> Result<Resize, StatesError> {
        let conditions = pod::resize_conditions(pod);

        if let Some(pending) = conditions.pending {
            let message = pending.message.clone().unwrap_or_default();
            return match pending.reason.as_deref() {
                Some(REASON_DEFERRED) => Ok(Resize::new(ResizeState::Deferred, message)),
                Some(REASON_INFEASIBLE) => Ok(Resize::new(ResizeState::Infeasible, message)),
                reason => Err(StatesError::UnknownPendingReason {
                    reason: reason.unwrap_or_default().to_string(),
                    message,
                }),
            };
        }

        if let Some(in_progress) = conditions.in_progress {
            let message = in_progress.message.clone().unwrap_or_default();
            if in_progress.reason.as_deref() == Some(REASON_ERROR) {
                if !self.awaiting_memory_message.is_empty()
                    && message.contains(&self.awaiting_memory_message)
                {
                    return Ok(Resize::new(ResizeState::InProgress, message));
                }
                return Ok(Resize::new(ResizeState::Error, message));
            }
            return Ok(Resize::new(ResizeState::InProgress, message));
        }

        Ok(Resize::new(ResizeState::NotStartedOrCompleted, ""))
    }
}

fn parse(q: Option<&Quantity>) -> Option<MilliValue> {
    q.and_then(|q| q.0.parse().ok())
}

fn resources_state(container: &Container, configs: &ScaleConfigs) -> ResourcesState {
    let mut startup = true;
    let mut post_startup = true;
    for config in configs.enabled() {
        let Some(ScaleResources {
            startup: s,
            post_startup_requests: pr,
            post_startup_limits: pl,
        }) = config.resources()
        else {
            continue;
        };
        let requests = parse(pod::spec_requests(container, config.resource().as_str()));
        let limits = parse(pod::spec_limits(container, config.resource().as_str()));

        startup &= requests == Some(s.value) && limits == Some(s.value);
        post_startup &= requests == Some(pr.value) && limits == Some(pl.value);
    }

    if startup {
        ResourcesState::Startup
    } else if post_startup {
        ResourcesState::PostStartup
    } else {
        ResourcesState::Unknown
    }
}

fn status_resources_state(
    pod: &Pod,
    container: &Container,
    configs: &ScaleConfigs,
) -> StatusResourcesState {
    let mut matches = true;
    for config in configs.enabled() {
        let resource = config.resource().as_str();
        let current = pod::status_requests(pod, &container.name, resource).and_then(|requests| {
            let limits = pod::status_limits(pod, &container.name, resource)?;
            Ok((parse(requests), parse(limits)))
        });
        let (requests, limits) = match current {
            Ok(current) => current,
            Err(error) => {
                tracing::debug!(%error, "Container status resources not yet available");
                return StatusResourcesState::Unknown;
            }
        };

        match (requests, limits) {
            (Some(r), Some(l)) if !r.is_zero() && !l.is_zero() => {
                let desired = parse(pod::spec_requests(container, resource));
                matches &= Some(r) == desired
                    && Some(l) == parse(pod::spec_limits(container, resource))
                    && allocation_matches(pod, &container.name, resource, desired);
            }
            _ => return StatusResourcesState::Incomplete,
        }
    }

    if matches {
        StatusResourcesState::ContainerResourcesMatch
    } else {
        StatusResourcesState::ContainerResourcesMismatch
    }
}

/// Whether the kubelet has allocated the desired requests. Kubelets that do
/// not report allocations are taken at their status resources.
fn allocation_matches(
    pod: &Pod,
    container_name: &str,
    resource: &str,
    desired: Option<MilliValue>,
) -> bool {
    match pod::allocated_resources(pod, container_name, resource) {
        Ok(Some(allocated)) => parse(Some(allocated)) == desired,
        Ok(None) => true,
        Err(error) => {
            tracing::trace!(%error, "Allocated resources not reported");
            true
        }
    }
}
