use crate::k8s::{self, Lease, ObjectMeta, Patch, PatchParams};
use anyhow::{bail, Result};
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(15);
const LEASE_NAME: &str = "startup-scaler";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(5);

pub type Claims = watch::Receiver<Arc<Claim>>;

pub async fn init<T>(runtime: &kubert::Runtime<T>, ns: &str, hostname: &str) -> Result<Claims> {
    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    "startup-scaler".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &PatchParams {
                field_manager: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let params = ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Waits until `hostname` holds the lease.
pub async fn acquired(claims: &mut Claims, hostname: &str) -> Result<()> {
    loop {
        if claims.borrow_and_update().is_current_for(hostname) {
            tracing::info!(%hostname, "Acquired leadership lease");
            return Ok(());
        }
        if claims.changed().await.is_err() {
            bail!("lease manager stopped");
        }
    }
}

/// Completes once `hostname` held the lease and then lost it.
pub async fn lost(mut claims: Claims, hostname: &str) -> Result<()> {
    acquired(&mut claims, hostname).await?;
    loop {
        if claims.changed().await.is_err() {
            bail!("lease manager stopped");
        }
        let claim = claims.borrow_and_update().clone();
        if !claim.is_current_for(hostname) {
            tracing::warn!(holder = %claim.holder, "Lost leadership lease");
            return Ok(());
        }
    }
}
