//! Drives reconciles from the watch's triggers through a kube-runtime work
//! queue.

use crate::{
    core::{Outcome, PodClient, Reconciler},
    k8s::{Pod, ResourceId},
};
use futures::prelude::*;
use kube::runtime::{
    controller::{self, Action, Controller},
    reflector::Store,
    watcher,
};
use std::{convert::Infallible, sync::Arc};
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone, Debug)]
pub struct Settings {
    pub concurrency: u16,
    pub graceful_shutdown_timeout: time::Duration,
}

/// Runs reconciles until the drain signal fires, then lets in-flight
/// reconciles finish for up to the graceful shutdown timeout.
pub async fn run<C>(
    cache: Store<Pod>,
    triggers: mpsc::Receiver<Pod>,
    reconciler: Arc<Reconciler<C>>,
    settings: Settings,
    drain: drain::Watch,
) where
    C: PodClient,
{
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let triggers = ReceiverStream::new(triggers).map(Ok::<_, watcher::Error>);
    let reconciles = Controller::for_stream(triggers, cache)
        .with_config(controller::Config::default().concurrency(settings.concurrency))
        .graceful_shutdown_on(async move {
            let _ = stop_rx.await;
        })
        .run(reconcile::<C>, error_policy::<C>, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((pod, action)) => tracing::trace!(%pod, ?action, "Reconciled"),
                Err(error) => tracing::debug!(%error, "Reconcile not run"),
            }
        });
    tokio::pin!(reconciles);

    tokio::select! {
        () = &mut reconciles => tracing::info!("Controller stopped"),
        release = drain.signaled() => {
            tracing::info!("Draining in-flight reconciles");
            let _ = stop_tx.send(());
            let drained = time::timeout(settings.graceful_shutdown_timeout, reconciles);
            if release.release_after(drained).await.is_err() {
                tracing::warn!(
                    timeout = ?settings.graceful_shutdown_timeout,
                    "Reconciles did not finish before the graceful shutdown timeout",
                );
            }
        }
    }
}

async fn reconcile<C>(pod: Arc<Pod>, reconciler: Arc<Reconciler<C>>) -> Result<Action, Infallible>
where
    C: PodClient,
{
    let outcome = reconciler.reconcile(ResourceId::from_pod(&pod)).await;
    Ok(action(&outcome, reconciler.config().resync_after))
}

fn error_policy<C>(_: Arc<Pod>, error: &Infallible, _: Arc<Reconciler<C>>) -> Action {
    match *error {}
}

/// Terminal failures are not retried; the next change to the pod triggers a
/// new reconcile.
fn action(outcome: &Outcome, resync_after: time::Duration) -> Action {
    match outcome {
        Outcome::Done => Action::requeue(resync_after),
        Outcome::Requeue(after) => Action::requeue(*after),
        Outcome::Terminal(_) => Action::await_change(),
    }
}
