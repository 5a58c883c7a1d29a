//! The write side of the pod adapter.
//!
//! The reconciler only talks to the API server through [`PodClient`], so tests
//! can substitute an in-memory implementation.

use crate::{retry::Recoverable, scale::ResourceName, RetryPolicy};
use async_trait::async_trait;
use startup_scaler_controller_k8s_api::{self as k8s, pod, Pod, Quantity, ResourceId, ShapeError};
use std::sync::Arc;
use thiserror::Error;

/// Produces a modified copy of a pod, and whether the copy must be written.
///
/// Mutators are re-applied to a freshly fetched pod when a write conflicts, so
/// they must derive their changes from the pod they are given.
pub type Mutator = Arc<dyn Fn(Pod) -> Result<(bool, Pod), MutateError> + Send + Sync>;

/// Per-reconcile request context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileContext {
    pub id: ResourceId,
    pub retry: RetryPolicy,
}

/// New requests and limits for one resource of a container.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceUpdate {
    pub resource: ResourceName,
    pub requests: Quantity,
    pub limits: Quantity,
}

#[derive(Debug, Error)]
pub enum MutateError {
    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("failed to serialize status annotation: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("kubernetes api error: {0}")]
    Api(#[from] k8s::Error),

    #[error("failed to mutate pod: {0}")]
    Mutate(#[from] MutateError),

    #[error("pod {0} no longer exists")]
    NotFound(ResourceId),

    #[error("failed to serialize patch: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[async_trait]
pub trait PodClient: Send + Sync + 'static {
    /// Fetches a pod. A pod that does not exist is `Ok(None)`.
    async fn get(&self, ctx: &ReconcileContext, id: &ResourceId) -> Result<Option<Pod>, ClientError>;

    /// Applies `mutators` to a copy of `pod` and writes the result if any
    /// mutator asks for it. Container resources are written through the
    /// `resize` subresource when `touches_resize` is set.
    ///
    /// Version conflicts are resolved by refetching the pod and re-applying the
    /// mutators. With `await_cache_sync`, the write is followed by a bounded
    /// wait for the informer cache to observe it.
    async fn patch(
        &self,
        ctx: &ReconcileContext,
        pod: &Pod,
        mutators: &[Mutator],
        touches_resize: bool,
        await_cache_sync: bool,
    ) -> Result<Pod, ClientError>;

    async fn update_container_resources(
        &self,
        ctx: &ReconcileContext,
        pod: &Pod,
        container_name: &str,
        updates: &[ResourceUpdate],
        add_mutators: &[Mutator],
        await_cache_sync: bool,
    ) -> Result<Pod, ClientError> {
        let mut mutators = Vec::with_capacity(add_mutators.len() + 1);
        mutators.push(resources_mutator(container_name, updates.to_vec()));
        mutators.extend(add_mutators.iter().cloned());
        self.patch(ctx, pod, &mutators, true, await_cache_sync)
            .await
    }
}

// === impl ReconcileContext ===

impl ReconcileContext {
    pub fn new(id: ResourceId, retry: RetryPolicy) -> Self {
        Self { id, retry }
    }
}

// === impl ClientError ===

impl Recoverable for ClientError {
    fn retry_reason(&self) -> Option<&'static str> {
        match self {
            Self::Api(k8s::Error::Api(response)) => match response.code {
                409 => Some("conflict"),
                429 => Some("throttled"),
                code if code >= 500 => Some("server_error"),
                _ => None,
            },
            Self::Api(k8s::Error::HyperError(_) | k8s::Error::Service(_)) => Some("transport"),
            _ => None,
        }
    }
}

impl ClientError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Api(k8s::Error::Api(r)) if r.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api(k8s::Error::Api(r)) if r.code == 404)
    }
}

/// Applies every mutator in order to a copy of `pod`.
pub fn apply_mutators(pod: &Pod, mutators: &[Mutator]) -> Result<(bool, Pod), MutateError> {
    mutators
        .iter()
        .try_fold((false, pod.clone()), |(changed, pod), mutate| {
            let (patch, pod) = mutate(pod)?;
            Ok((changed || patch, pod))
        })
}

/// A mutator that sets the given resources on a container.
pub fn resources_mutator(container_name: &str, updates: Vec<ResourceUpdate>) -> Mutator {
    let container_name = container_name.to_string();
    Arc::new(move |mut pod: Pod| -> Result<(bool, Pod), MutateError> {
        for ResourceUpdate {
            resource,
            requests,
            limits,
        } in &updates
        {
            pod::set_container_resources(
                &mut pod,
                &container_name,
                resource.as_str(),
                requests.clone(),
                limits.clone(),
            )?;
        }
        Ok((true, pod))
    })
}
