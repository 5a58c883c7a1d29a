#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod pod;
pub mod quantity;
mod resource_id;

pub use self::{
    pod::{ContainerState, ResizeConditions, ShapeError},
    quantity::{MilliValue, QuantityError},
    resource_id::ResourceId,
};
pub use k8s_openapi::{
    api::{
        self,
        coordination::v1::Lease,
        core::v1::{
            Container, ContainerResizePolicy, ContainerStatus, Pod, PodCondition, PodSpec,
            PodStatus, Probe, ResourceRequirements,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    core::ErrorResponse,
    Client, Error, Resource,
};

/// The `resourceName` values of a container resize policy.
pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";

/// The QoS class required of managed pods.
pub const QOS_GUARANTEED: &str = "Guaranteed";

/// The resize restart policy that allows resizing without a container restart.
pub const RESIZE_RESTART_NOT_REQUIRED: &str = "NotRequired";
