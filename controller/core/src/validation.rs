use crate::scale::{ResourceName, ScaleConfigs};
use startup_scaler_controller_k8s_api::{annotations, pod, quantity::QuantityError, Pod};
use thiserror::Error;

/// Reasons a pod is not eligible for management.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("enabled label value {value:?} is not \"true\"")]
    NotEnabled { value: String },

    #[error("vpa annotation {0} present")]
    VpaAnnotation(&'static str),

    #[error("target container {0:?} not present in pod spec")]
    ContainerNotInSpec(String),

    #[error("target container has neither a startup probe nor a readiness probe")]
    NoProbe,

    #[error("pod qos class {0:?} is not Guaranteed")]
    NotGuaranteed(String),

    #[error("no resources are enabled for scaling")]
    NoResourcesEnabled,

    #[error("target container name is empty")]
    EmptyTargetContainerName,

    #[error("{resource} target container name {name:?} does not match {expected:?}")]
    TargetContainerNameMismatch {
        resource: ResourceName,
        name: String,
        expected: String,
    },

    #[error("{resource} is not enabled for scaling but annotations are present: {keys}")]
    AnnotationsOnDisabledResource { resource: ResourceName, keys: String },

    #[error("target container {resource} requests and limits must both be set")]
    MissingContainerResources { resource: ResourceName },

    #[error("target container {resource} quantity is invalid: {error}")]
    InvalidContainerQuantity {
        resource: ResourceName,
        #[source]
        error: QuantityError,
    },

    #[error("target container {resource} requests must equal limits")]
    RequestsNotEqualLimits { resource: ResourceName },

    #[error("target container {resource} resize restart policy is {policy:?}, must be {expected:?}")]
    ResizeRestartPolicy {
        resource: ResourceName,
        policy: String,
        expected: &'static str,
    },

    #[error("{resource} startup value is less than post-startup requests")]
    StartupBelowPostStartupRequests { resource: ResourceName },

    #[error("{resource} post-startup requests must equal post-startup limits")]
    PostStartupRequestsNotEqualLimits { resource: ResourceName },
}

/// Checks that a pod may be managed, in the order the checks are reported.
pub fn validate(
    pod: &Pod,
    container_name: &str,
    configs: &ScaleConfigs,
) -> Result<(), ValidationError> {
    if !matches!(
        pod::expected_label_value_as::<bool>(pod, annotations::ENABLED_LABEL),
        Ok(true)
    ) {
        let value = pod::label(pod, annotations::ENABLED_LABEL).unwrap_or_default();
        return Err(ValidationError::NotEnabled {
            value: value.to_string(),
        });
    }

    if let Some(key) = annotations::KNOWN_VPA_ANNOTATIONS
        .iter()
        .copied()
        .find(|key| pod::has_annotation(pod, key))
    {
        return Err(ValidationError::VpaAnnotation(key));
    }

    let container = pod::container(pod, container_name)
        .map_err(|_| ValidationError::ContainerNotInSpec(container_name.to_string()))?;

    if !pod::has_startup_probe(container) && !pod::has_readiness_probe(container) {
        return Err(ValidationError::NoProbe);
    }

    if !pod::is_qos_guaranteed(pod) {
        let qos = pod::qos_class(pod).unwrap_or_default();
        return Err(ValidationError::NotGuaranteed(qos.to_string()));
    }

    configs.validate_collection()?;
    configs.validate_against(container)
}
