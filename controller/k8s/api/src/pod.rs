//! Read helpers over pod metadata, spec and status.
//!
//! These never modify the pod. Status-shaped absences (a container status the
//! kubelet has not reported yet, for instance) are returned as [`ShapeError`]s
//! so callers can tell them apart from real failures.

use crate::{Container, ContainerStatus, Pod, PodCondition, Quantity, QOS_GUARANTEED};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

pub const RESIZE_PENDING: &str = "PodResizePending";
pub const RESIZE_IN_PROGRESS: &str = "PodResizeInProgress";

/// Expected, usually transient, gaps in what the kubelet has reported.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("container {0:?} not present in pod spec")]
    ContainerNotPresent(String),

    #[error("container status not present")]
    ContainerStatusNotPresent,

    #[error("container status resources not present")]
    ContainerStatusResourcesNotPresent,

    #[error("allocated resources not present")]
    AllocatedResourcesNotPresent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("{0} not present")]
    Missing(String),

    #[error("unable to parse {key} value {value:?}: {error}")]
    Parse {
        key: String,
        value: String,
        error: String,
    },
}

/// The runtime state of a container, as the first populated field of its
/// status `state`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Waiting,
    Terminated,
    #[default]
    Unknown,
}

/// The resize conditions currently asserted (status `True`) on a pod.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResizeConditions<'p> {
    pub pending: Option<&'p PodCondition>,
    pub in_progress: Option<&'p PodCondition>,
}

// === metadata ===

pub fn has_annotation(pod: &Pod, key: &str) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(key))
}

pub fn annotation<'p>(pod: &'p Pod, key: &str) -> Option<&'p str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn label<'p>(pod: &'p Pod, key: &str) -> Option<&'p str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

pub fn expected_label_value_as<T>(pod: &Pod, key: &str) -> Result<T, LookupError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = label(pod, key).ok_or_else(|| LookupError::Missing(format!("label {key}")))?;
    parse_value(key, value)
}

pub fn expected_annotation_value_as<T>(pod: &Pod, key: &str) -> Result<T, LookupError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let value =
        annotation(pod, key).ok_or_else(|| LookupError::Missing(format!("annotation {key}")))?;
    parse_value(key, value)
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, LookupError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|error: T::Err| LookupError::Parse {
        key: key.to_string(),
        value: value.to_string(),
        error: error.to_string(),
    })
}

// === spec ===

pub fn container<'p>(pod: &'p Pod, name: &str) -> Result<&'p Container, ShapeError> {
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .find(|c| c.name == name)
        .ok_or_else(|| ShapeError::ContainerNotPresent(name.to_string()))
}

pub fn container_mut<'p>(pod: &'p mut Pod, name: &str) -> Result<&'p mut Container, ShapeError> {
    pod.spec
        .iter_mut()
        .flat_map(|s| s.containers.iter_mut())
        .find(|c| c.name == name)
        .ok_or_else(|| ShapeError::ContainerNotPresent(name.to_string()))
}

pub fn is_container_in_spec(pod: &Pod, name: &str) -> bool {
    container(pod, name).is_ok()
}

pub fn has_startup_probe(container: &Container) -> bool {
    container.startup_probe.is_some()
}

pub fn has_readiness_probe(container: &Container) -> bool {
    container.readiness_probe.is_some()
}

pub fn spec_requests<'c>(container: &'c Container, resource: &str) -> Option<&'c Quantity> {
    container
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(resource))
}

pub fn spec_limits<'c>(container: &'c Container, resource: &str) -> Option<&'c Quantity> {
    container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|r| r.get(resource))
}

/// The restart policy declared for `resource` in the container's resize
/// policy, if any.
pub fn resize_restart_policy<'c>(container: &'c Container, resource: &str) -> Option<&'c str> {
    container
        .resize_policy
        .iter()
        .flatten()
        .find(|p| p.resource_name == resource)
        .map(|p| p.restart_policy.as_str())
}

/// Sets the container's request and limit for `resource`, leaving every other
/// resource untouched.
pub fn set_container_resources(
    pod: &mut Pod,
    container_name: &str,
    resource: &str,
    requests: Quantity,
    limits: Quantity,
) -> Result<(), ShapeError> {
    let container = container_mut(pod, container_name)?;
    let resources = container.resources.get_or_insert_with(Default::default);
    resources
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert(resource.to_string(), requests);
    resources
        .limits
        .get_or_insert_with(BTreeMap::new)
        .insert(resource.to_string(), limits);
    Ok(())
}

// === status ===

pub fn qos_class(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.qos_class.as_deref())
}

pub fn is_qos_guaranteed(pod: &Pod) -> bool {
    qos_class(pod) == Some(QOS_GUARANTEED)
}

pub fn container_status<'p>(pod: &'p Pod, name: &str) -> Result<&'p ContainerStatus, ShapeError> {
    pod.status
        .iter()
        .flat_map(|s| s.container_statuses.iter().flatten())
        .find(|s| s.name == name)
        .ok_or(ShapeError::ContainerStatusNotPresent)
}

pub fn container_state(pod: &Pod, name: &str) -> Result<ContainerState, ShapeError> {
    let status = container_status(pod, name)?;
    let state = match status.state.as_ref() {
        Some(s) if s.running.is_some() => ContainerState::Running,
        Some(s) if s.waiting.is_some() => ContainerState::Waiting,
        Some(s) if s.terminated.is_some() => ContainerState::Terminated,
        _ => ContainerState::Unknown,
    };
    Ok(state)
}

/// Whether the container has passed its startup probe. The kubelet leaves this
/// unset until it has evaluated the container at least once.
pub fn started(pod: &Pod, name: &str) -> Result<Option<bool>, ShapeError> {
    Ok(container_status(pod, name)?.started)
}

pub fn ready(pod: &Pod, name: &str) -> Result<bool, ShapeError> {
    Ok(container_status(pod, name)?.ready)
}

pub fn status_requests<'p>(
    pod: &'p Pod,
    name: &str,
    resource: &str,
) -> Result<Option<&'p Quantity>, ShapeError> {
    let resources = container_status(pod, name)?
        .resources
        .as_ref()
        .ok_or(ShapeError::ContainerStatusResourcesNotPresent)?;
    Ok(resources.requests.as_ref().and_then(|r| r.get(resource)))
}

pub fn status_limits<'p>(
    pod: &'p Pod,
    name: &str,
    resource: &str,
) -> Result<Option<&'p Quantity>, ShapeError> {
    let resources = container_status(pod, name)?
        .resources
        .as_ref()
        .ok_or(ShapeError::ContainerStatusResourcesNotPresent)?;
    Ok(resources.limits.as_ref().and_then(|r| r.get(resource)))
}

pub fn allocated_resources<'p>(
    pod: &'p Pod,
    name: &str,
    resource: &str,
) -> Result<Option<&'p Quantity>, ShapeError> {
    let allocated = container_status(pod, name)?
        .allocated_resources
        .as_ref()
        .ok_or(ShapeError::AllocatedResourcesNotPresent)?;
    Ok(allocated.get(resource))
}

pub fn resize_conditions(pod: &Pod) -> ResizeConditions<'_> {
    let asserted = |type_: &str| {
        pod.status
            .iter()
            .flat_map(|s| s.conditions.iter().flatten())
            .find(|c| c.type_ == type_ && c.status == "True")
    };
    ResizeConditions {
        pending: asserted(RESIZE_PENDING),
        in_progress: asserted(RESIZE_IN_PROGRESS),
    }
}

// === impl ContainerState ===

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => "running".fmt(f),
            Self::Waiting => "waiting".fmt(f),
            Self::Terminated => "terminated".fmt(f),
            Self::Unknown => "unknown".fmt(f),
        }
    }
}
