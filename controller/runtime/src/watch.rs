//! Feeds the pod watch into the informer cache, the event bus, and the
//! reconcile queue.

use crate::{
    core::{
        event_bus::{Event, EventBus, EventKind},
        predicate::{Decision, PodEvent},
        ReconcilerMetrics,
    },
    k8s::Pod,
};
use futures::prelude::*;
use kube::runtime::{
    reflector::{store::Writer, ObjectRef},
    watcher,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Watch {
    cache: Writer<Pod>,
    bus: Arc<EventBus>,
    metrics: ReconcilerMetrics,
    triggers: mpsc::Sender<Pod>,
    /// Pods listed since the last `Init`. They are only triggered once the
    /// relist completes, since the cache does not hold them until then.
    listed: Vec<Pod>,
}

#[derive(Debug)]
struct Closed;

impl Watch {
    pub fn new(
        cache: Writer<Pod>,
        bus: Arc<EventBus>,
        metrics: ReconcilerMetrics,
        triggers: mpsc::Sender<Pod>,
    ) -> Self {
        Self {
            cache,
            bus,
            metrics,
            triggers,
            listed: Vec::new(),
        }
    }

    /// Processes watch events until the stream ends or the reconcile queue
    /// goes away.
    pub async fn run<S>(mut self, events: S)
    where
        S: Stream<Item = watcher::Event<Pod>>,
    {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            if self.process(event).await.is_err() {
                tracing::debug!("Reconcile queue closed");
                return;
            }
        }
    }

    async fn process(&mut self, event: watcher::Event<Pod>) -> Result<(), Closed> {
        let observed = match &event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                let old = self.cache.as_reader().get(&ObjectRef::from_obj(pod));
                let change = match old.as_deref() {
                    Some(old) => PodEvent::Update { old, new: pod },
                    None => PodEvent::Create(pod),
                };
                Some((change.kind(), change.decide(&self.metrics)))
            }
            watcher::Event::Delete(pod) => {
                let change = PodEvent::Delete(pod);
                Some((change.kind(), change.decide(&self.metrics)))
            }
            watcher::Event::Init => {
                self.listed.clear();
                None
            }
            watcher::Event::InitDone => None,
        };

        self.cache.apply_watcher_event(&event);

        match event {
            watcher::Event::Apply(pod) => {
                if let Some((kind, decision)) = observed {
                    self.observe(kind, decision, pod, false).await?;
                }
            }
            watcher::Event::InitApply(pod) => {
                if let Some((kind, decision)) = observed {
                    self.observe(kind, decision, pod, true).await?;
                }
            }
            watcher::Event::Delete(pod) => {
                if let Some((kind, decision)) = observed {
                    self.observe(kind, decision, pod, false).await?;
                }
            }
            watcher::Event::Init => {}
            watcher::Event::InitDone => {
                tracing::debug!(pods = self.listed.len(), "Pod list complete");
                for pod in std::mem::take(&mut self.listed) {
                    self.triggers.send(pod).await.map_err(|_| Closed)?;
                }
            }
        }
        Ok(())
    }

    async fn observe(
        &mut self,
        kind: EventKind,
        decision: Decision,
        pod: Pod,
        listing: bool,
    ) -> Result<(), Closed> {
        let pod = Arc::new(pod);
        self.bus
            .publish(
                Event {
                    kind,
                    pod: pod.clone(),
                },
                None,
            )
            .await;

        if decision == Decision::Skip {
            return Ok(());
        }
        let pod = Arc::unwrap_or_clone(pod);
        if listing {
            self.listed.push(pod);
            return Ok(());
        }
        self.triggers.send(pod).await.map_err(|_| Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{annotations, ObjectMeta, ResourceExt, ResourceId};
    use kube::runtime::reflector::Store;
    use maplit::btreemap;
    use prometheus_client::{encoding::text::encode, registry::Registry};

    fn pod(version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("pod-0".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_status(mut pod: Pod, status: &str) -> Pod {
        pod.metadata.annotations = Some(btreemap! {
            annotations::STATUS.to_string() => status.to_string(),
        });
        pod
    }

    struct Harness {
        watch: Watch,
        cache: Store<Pod>,
        bus: Arc<EventBus>,
        registry: Registry,
        triggers: mpsc::Receiver<Pod>,
    }

    impl Harness {
        fn metrics(&self) -> String {
            let mut out = String::new();
            encode(&mut out, &self.registry).expect("metrics must encode");
            out
        }
    }

    fn harness() -> Harness {
        let writer = Writer::<Pod>::default();
        let cache = writer.as_reader();
        let bus = Arc::new(EventBus::default());
        let mut registry = Registry::default();
        let metrics = ReconcilerMetrics::register(&mut registry);
        let (tx, triggers) = mpsc::channel(16);
        Harness {
            watch: Watch::new(writer, bus.clone(), metrics, tx),
            cache,
            bus,
            registry,
            triggers,
        }
    }

    fn triggered(rx: &mut mpsc::Receiver<Pod>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|pod| pod.resource_version())
            .collect()
    }

    #[tokio::test]
    async fn applies_trigger_after_caching() {
        let mut h = harness();
        h.watch
            .process(watcher::Event::Apply(pod("1")))
            .await
            .unwrap();
        assert!(h.cache.get(&ObjectRef::from_obj(&pod("1"))).is_some());
        assert_eq!(triggered(&mut h.triggers), vec!["1"]);
    }

    #[tokio::test]
    async fn updates_are_filtered() {
        let mut h = harness();
        for event in [
            watcher::Event::Apply(with_status(pod("1"), "a")),
            // Same version.
            watcher::Event::Apply(with_status(pod("1"), "a")),
            // Only the status annotation changed.
            watcher::Event::Apply(with_status(pod("2"), "b")),
            watcher::Event::Delete(with_status(pod("3"), "b")),
        ] {
            h.watch.process(event).await.unwrap();
        }
        assert_eq!(triggered(&mut h.triggers), vec!["1"]);
        assert!(h.metrics().contains("skipped_only_status_change_total 1"));
    }

    #[tokio::test]
    async fn every_event_is_published() {
        let mut h = harness();
        let mut sub = h
            .bus
            .subscribe(
                ResourceId::new("ns-0", "pod-0"),
                &[EventKind::Create, EventKind::Update, EventKind::Delete],
                8,
            )
            .await;

        h.watch.process(watcher::Event::Apply(pod("1"))).await.unwrap();
        h.watch.process(watcher::Event::Apply(pod("1"))).await.unwrap();
        h.watch.process(watcher::Event::Delete(pod("2"))).await.unwrap();

        let kinds = std::iter::from_fn(|| sub.try_recv())
            .map(|event| event.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![EventKind::Create, EventKind::Update, EventKind::Delete]
        );
    }

    #[tokio::test]
    async fn listed_pods_trigger_when_list_completes() {
        let mut h = harness();
        h.watch.process(watcher::Event::Init).await.unwrap();
        h.watch
            .process(watcher::Event::InitApply(pod("1")))
            .await
            .unwrap();
        assert!(triggered(&mut h.triggers).is_empty());
        assert!(h.cache.get(&ObjectRef::from_obj(&pod("1"))).is_none());

        h.watch.process(watcher::Event::InitDone).await.unwrap();
        assert!(h.cache.get(&ObjectRef::from_obj(&pod("1"))).is_some());
        assert_eq!(triggered(&mut h.triggers), vec!["1"]);

        // A relist of an unchanged pod does not trigger.
        h.watch.process(watcher::Event::Init).await.unwrap();
        h.watch
            .process(watcher::Event::InitApply(pod("1")))
            .await
            .unwrap();
        h.watch.process(watcher::Event::InitDone).await.unwrap();
        assert!(triggered(&mut h.triggers).is_empty());
    }

    #[tokio::test]
    async fn run_stops_when_queue_closes() {
        let h = harness();
        drop(h.triggers);
        let events = stream::iter(vec![
            watcher::Event::Apply(pod("1")),
            watcher::Event::Apply(pod("2")),
        ]);
        h.watch.run(events).await;
        assert!(h.cache.get(&ObjectRef::from_obj(&pod("1"))).is_some());
    }
}
