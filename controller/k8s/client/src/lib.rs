#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A [`PodClient`] backed by the Kubernetes API server and an informer cache.

mod cache;
mod patch;


pub use self::cache::{CacheSync, CacheSyncMetrics, DEFAULT_POLL_STEP, DEFAULT_TIMEOUT};
use async_trait::async_trait;
use startup_scaler_controller_core::{
    client::{apply_mutators, ClientError, Mutator, PodClient, ReconcileContext},
    retry, RetryMetrics,
};
use startup_scaler_controller_k8s_api::{
    Api, Client, Patch, PatchParams, Pod, ResourceExt, ResourceId,
};

pub const FIELD_MANAGER: &str = "startup-scaler";

pub struct KubePodClient {
    client: Client,
    cache_sync: CacheSync,
    retry_metrics: RetryMetrics,
}

// === impl KubePodClient ===

impl KubePodClient {
    pub fn new(client: Client, cache_sync: CacheSync, retry_metrics: RetryMetrics) -> Self {
        Self {
            client,
            cache_sync,
            retry_metrics,
        }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    /// Mutates `base` and writes the result. Returns the pod as last written,
    /// or the mutated copy if nothing needed writing.
    async fn write(
        &self,
        api: &Api<Pod>,
        base: &Pod,
        mutators: &[Mutator],
        touches_resize: bool,
    ) -> Result<Option<Pod>, ClientError> {
        let (changed, mutated) = apply_mutators(base, mutators)?;
        if !changed {
            return Ok(None);
        }

        let name = base.name_any();
        let mut version = base.resource_version();
        let mut written = None;

        if touches_resize {
            if let Some(body) = patch::resize(base, &mutated, version.as_deref())
                .map_err(ClientError::Serialize)?
            {
                tracing::debug!(%name, "Patching container resources");
                let pod = api
                    .patch_subresource("resize", &name, &Self::params(), &Patch::Strategic(body))
                    .await?;
                version = pod.resource_version();
                written = Some(pod);
            }
        }

        if let Some(body) =
            patch::metadata(base, &mutated, version.as_deref()).map_err(ClientError::Serialize)?
        {
            tracing::debug!(%name, "Patching metadata");
            let pod = api.patch(&name, &Self::params(), &Patch::Merge(body)).await?;
            written = Some(pod);
        }

        Ok(Some(written.unwrap_or(mutated)))
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    #[tracing::instrument(skip_all, fields(namespace = %id.namespace, name = %id.name))]
    async fn get(&self, ctx: &ReconcileContext, id: &ResourceId) -> Result<Option<Pod>, ClientError> {
        let api = &self.api(&id.namespace);
        retry(&ctx.retry, &self.retry_metrics, "get", |_| async move {
            api.get_opt(&id.name).await.map_err(ClientError::from)
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(namespace = %ctx.id.namespace, name = %ctx.id.name))]
    async fn patch(
        &self,
        ctx: &ReconcileContext,
        pod: &Pod,
        mutators: &[Mutator],
        touches_resize: bool,
        await_cache_sync: bool,
    ) -> Result<Pod, ClientError> {
        let api = &self.api(&ctx.id.namespace);
        let written = retry(&ctx.retry, &self.retry_metrics, "patch", |attempt| async move {
            if attempt == 1 {
                return self.write(api, pod, mutators, touches_resize).await;
            }
            // A previous attempt may have failed on a stale version; mutate the
            // latest copy instead.
            let Some(latest) = api.get_opt(&ctx.id.name).await? else {
                return Err(ClientError::NotFound(ctx.id.clone()));
            };
            self.write(api, &latest, mutators, touches_resize).await
        })
        .await?;

        let Some(written) = written else {
            tracing::trace!("No changes to write");
            return Ok(pod.clone());
        };

        if await_cache_sync {
            if let Some(version) = written.resource_version() {
                self.cache_sync.wait(&ctx.id, &version).await;
            }
        }
        Ok(written)
    }
}
