//! Per-resource scale configuration, read from pod annotations.
//!
//! Each managed resource (CPU, memory) is configured by three annotations: the
//! quantity applied while the container starts, and the request and limit
//! applied once it has started. Which resources are managed at all is decided
//! by the controller's configuration; a resource the controller does not manage
//! must not be configured on the pod.

mod config;

pub use self::config::{ConfiguredQuantity, ScaleConfig, ScaleResources};
use crate::{client::ResourceUpdate, ValidationError};
use serde::{Deserialize, Serialize};
use startup_scaler_controller_k8s_api::{self as k8s, annotations, Container, Pod};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

/// A resource whose allocation the controller can reshape.
///
/// Ordering follows Kubernetes' canonical ordering of resource names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
}

/// Errors reading scale configuration from annotations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScaleConfigError {
    #[error("{resource} annotation {key} not present")]
    MissingAnnotation {
        resource: ResourceName,
        key: &'static str,
    },

    #[error("target container name annotation not present")]
    MissingTargetContainerName,

    #[error("unable to parse {key} value {value:?}: {error}")]
    InvalidQuantity {
        key: &'static str,
        value: String,
        error: String,
    },

    #[error("no resources are enabled for scaling")]
    NoneEnabled,
}

/// The set of scale configurations for a single pod, one per resource name.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleConfigs {
    configs: BTreeMap<ResourceName, ScaleConfig>,
}

// === impl ResourceName ===

impl ResourceName {
    pub const ALL: [Self; 2] = [Self::Cpu, Self::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => k8s::RESOURCE_CPU,
            Self::Memory => k8s::RESOURCE_MEMORY,
        }
    }

    pub fn startup_annotation(&self) -> &'static str {
        match self {
            Self::Cpu => annotations::CPU_STARTUP,
            Self::Memory => annotations::MEMORY_STARTUP,
        }
    }

    pub fn post_startup_requests_annotation(&self) -> &'static str {
        match self {
            Self::Cpu => annotations::CPU_POST_STARTUP_REQUESTS,
            Self::Memory => annotations::MEMORY_POST_STARTUP_REQUESTS,
        }
    }

    pub fn post_startup_limits_annotation(&self) -> &'static str {
        match self {
            Self::Cpu => annotations::CPU_POST_STARTUP_LIMITS,
            Self::Memory => annotations::MEMORY_POST_STARTUP_LIMITS,
        }
    }

    pub fn annotations(&self) -> [&'static str; 3] {
        [
            self.startup_annotation(),
            self.post_startup_requests_annotation(),
            self.post_startup_limits_annotation(),
        ]
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for ResourceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            k8s::RESOURCE_CPU => Ok(Self::Cpu),
            k8s::RESOURCE_MEMORY => Ok(Self::Memory),
            other => Err(format!("unsupported resource name {other:?}")),
        }
    }
}

// === impl ScaleConfigs ===

impl ScaleConfigs {
    /// Reads a configuration for every supported resource. Resources in
    /// `enabled` must be fully configured; the rest are recorded as disabled.
    pub fn from_annotations(pod: &Pod, enabled: &[ResourceName]) -> Result<Self, ScaleConfigError> {
        let configs = ResourceName::ALL
            .iter()
            .map(|&resource| {
                let config = if enabled.contains(&resource) {
                    ScaleConfig::from_annotations(resource, pod)?
                } else {
                    ScaleConfig::disabled(resource, pod)
                };
                Ok((resource, config))
            })
            .collect::<Result<_, ScaleConfigError>>()?;
        Ok(Self { configs })
    }

    pub fn get(&self, resource: ResourceName) -> Option<&ScaleConfig> {
        self.configs.get(&resource)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ScaleConfig> + '_ {
        self.configs.values().filter(|c| c.is_enabled())
    }

    /// Enabled resource names, in canonical order.
    pub fn enabled_resource_names(&self) -> Vec<ResourceName> {
        self.enabled().map(|c| c.resource()).collect()
    }

    /// The target container name, as configured for the first enabled
    /// resource. Agreement between resources is checked by
    /// [`ScaleConfigs::validate_collection`].
    pub fn target_container_name(&self) -> Result<&str, ScaleConfigError> {
        let config = self.enabled().next().ok_or(ScaleConfigError::NoneEnabled)?;
        config
            .target_container_name()
            .ok_or(ScaleConfigError::MissingTargetContainerName)
    }

    pub fn validate_collection(&self) -> Result<(), ValidationError> {
        let mut enabled = self.enabled();
        let first = enabled.next().ok_or(ValidationError::NoResourcesEnabled)?;
        let name = first.target_container_name().unwrap_or_default();
        if name.is_empty() {
            return Err(ValidationError::EmptyTargetContainerName);
        }

        for config in enabled {
            let other = config.target_container_name().unwrap_or_default();
            if other != name {
                return Err(ValidationError::TargetContainerNameMismatch {
                    resource: config.resource(),
                    name: other.to_string(),
                    expected: name.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Validates every configuration, enabled or not, against the target
    /// container.
    pub fn validate_against(&self, container: &Container) -> Result<(), ValidationError> {
        self.configs
            .values()
            .try_for_each(|c| c.validate_against(container))
    }

    pub fn startup_updates(&self) -> Vec<ResourceUpdate> {
        self.enabled().filter_map(|c| c.startup_update()).collect()
    }

    pub fn post_startup_updates(&self) -> Vec<ResourceUpdate> {
        self.enabled()
            .filter_map(|c| c.post_startup_update())
            .collect()
    }
}

impl fmt::Display for ScaleConfigs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for config in self.enabled() {
            if !first {
                ", ".fmt(f)?;
            }
            first = false;
            config.fmt(f)?;
        }
        Ok(())
    }
}
