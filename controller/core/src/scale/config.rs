use super::{ResourceName, ScaleConfigError};
use crate::{client::ResourceUpdate, ValidationError};
use startup_scaler_controller_k8s_api::{
    self as k8s, annotations,
    pod::{self, LookupError},
    Container, MilliValue, Pod, Quantity,
};
use std::fmt;

/// A configured quantity together with its parsed value.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfiguredQuantity {
    pub quantity: Quantity,
    pub value: MilliValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScaleResources {
    pub startup: ConfiguredQuantity,
    pub post_startup_requests: ConfiguredQuantity,
    pub post_startup_limits: ConfiguredQuantity,
}

/// The scale configuration of a single resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleConfig {
    resource: ResourceName,
    target_container_name: Option<String>,

    /// Set only when the resource is enabled.
    resources: Option<ScaleResources>,

    /// Scale annotations found on the pod for a disabled resource.
    stray_annotations: Vec<&'static str>,
}

// === impl ScaleConfig ===

impl ScaleConfig {
    pub fn from_annotations(resource: ResourceName, pod: &Pod) -> Result<Self, ScaleConfigError> {
        let quantity = |key: &'static str| -> Result<ConfiguredQuantity, ScaleConfigError> {
            let parsed = pod::expected_annotation_value_as::<MilliValue>(pod, key).map_err(
                |error| match error {
                    LookupError::Missing(_) => ScaleConfigError::MissingAnnotation { resource, key },
                    LookupError::Parse { value, error, .. } => {
                        ScaleConfigError::InvalidQuantity { key, value, error }
                    }
                },
            )?;
            let value = pod::annotation(pod, key).unwrap_or_default();
            Ok(ConfiguredQuantity {
                quantity: Quantity(value.trim().to_string()),
                value: parsed,
            })
        };

        let resources = ScaleResources {
            startup: quantity(resource.startup_annotation())?,
            post_startup_requests: quantity(resource.post_startup_requests_annotation())?,
            post_startup_limits: quantity(resource.post_startup_limits_annotation())?,
        };

        Ok(Self {
            resource,
            target_container_name: target_container_name(pod),
            resources: Some(resources),
            stray_annotations: Vec::new(),
        })
    }

    /// A configuration for a resource the controller does not manage.
    pub fn disabled(resource: ResourceName, pod: &Pod) -> Self {
        let stray_annotations = resource
            .annotations()
            .into_iter()
            .filter(|key| pod::has_annotation(pod, key))
            .collect();
        Self {
            resource,
            target_container_name: target_container_name(pod),
            resources: None,
            stray_annotations,
        }
    }

    pub fn resource(&self) -> ResourceName {
        self.resource
    }

    pub fn is_enabled(&self) -> bool {
        self.resources.is_some()
    }

    pub fn target_container_name(&self) -> Option<&str> {
        self.target_container_name.as_deref()
    }

    pub fn resources(&self) -> Option<&ScaleResources> {
        self.resources.as_ref()
    }

    /// The resize restart policy the target container must declare for this
    /// resource so that it can be resized without a restart.
    pub fn desired_resize_restart_policy(&self) -> &'static str {
        k8s::RESIZE_RESTART_NOT_REQUIRED
    }

    pub fn validate_against(&self, container: &Container) -> Result<(), ValidationError> {
        let resource = self.resource;
        let Some(resources) = self.resources.as_ref() else {
            if self.stray_annotations.is_empty() {
                return Ok(());
            }
            return Err(ValidationError::AnnotationsOnDisabledResource {
                resource,
                keys: self.stray_annotations.join(", "),
            });
        };

        let requests = pod::spec_requests(container, resource.as_str());
        let limits = pod::spec_limits(container, resource.as_str());
        let (Some(requests), Some(limits)) = (requests, limits) else {
            return Err(ValidationError::MissingContainerResources { resource });
        };
        let parse = |q: &Quantity| {
            q.0.parse::<MilliValue>()
                .map_err(|error| ValidationError::InvalidContainerQuantity { resource, error })
        };
        if parse(requests)? != parse(limits)? {
            return Err(ValidationError::RequestsNotEqualLimits { resource });
        }

        let policy = pod::resize_restart_policy(container, resource.as_str());
        if policy != Some(self.desired_resize_restart_policy()) {
            return Err(ValidationError::ResizeRestartPolicy {
                resource,
                policy: policy.unwrap_or("<none>").to_string(),
                expected: self.desired_resize_restart_policy(),
            });
        }

        if resources.startup.value < resources.post_startup_requests.value {
            return Err(ValidationError::StartupBelowPostStartupRequests { resource });
        }
        if resources.post_startup_requests.value != resources.post_startup_limits.value {
            return Err(ValidationError::PostStartupRequestsNotEqualLimits { resource });
        }

        Ok(())
    }

    pub fn startup_update(&self) -> Option<ResourceUpdate> {
        let ScaleResources { startup, .. } = self.resources.as_ref()?;
        Some(ResourceUpdate {
            resource: self.resource,
            requests: startup.quantity.clone(),
            limits: startup.quantity.clone(),
        })
    }

    pub fn post_startup_update(&self) -> Option<ResourceUpdate> {
        let ScaleResources {
            post_startup_requests,
            post_startup_limits,
            ..
        } = self.resources.as_ref()?;
        Some(ResourceUpdate {
            resource: self.resource,
            requests: post_startup_requests.quantity.clone(),
            limits: post_startup_limits.quantity.clone(),
        })
    }
}

impl fmt::Display for ScaleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resources.as_ref() {
            Some(r) => write!(
                f,
                "{}: startup={}, postStartupRequests={}, postStartupLimits={}",
                self.resource,
                r.startup.quantity.0,
                r.post_startup_requests.quantity.0,
                r.post_startup_limits.quantity.0,
            ),
            None => write!(f, "{}: disabled", self.resource),
        }
    }
}

fn target_container_name(pod: &Pod) -> Option<String> {
    pod::annotation(pod, annotations::TARGET_CONTAINER_NAME).map(|n| n.trim().to_string())
}
