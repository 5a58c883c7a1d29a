//! Decides which watch events warrant a reconcile.

use crate::{event_bus::EventKind, reconcile::ReconcilerMetrics};
use startup_scaler_controller_k8s_api::{annotations, ObjectMeta, Pod};

/// A pod change observed by the watch.
#[derive(Copy, Clone, Debug)]
pub enum PodEvent<'p> {
    Create(&'p Pod),
    Update { old: &'p Pod, new: &'p Pod },
    Delete(&'p Pod),
    Generic(&'p Pod),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Reconcile,
    Skip,
}

// === impl PodEvent ===

impl<'p> PodEvent<'p> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Create(_) => EventKind::Create,
            Self::Update { .. } => EventKind::Update,
            Self::Delete(_) => EventKind::Delete,
            Self::Generic(_) => EventKind::Generic,
        }
    }

    /// The most recent version of the pod the event carries.
    pub fn pod(&self) -> &'p Pod {
        match *self {
            Self::Create(pod) | Self::Delete(pod) | Self::Generic(pod) => pod,
            Self::Update { new, .. } => new,
        }
    }

    pub fn decide(&self, metrics: &ReconcilerMetrics) -> Decision {
        let (old, new) = match *self {
            Self::Create(_) => return Decision::Reconcile,
            Self::Delete(_) | Self::Generic(_) => return Decision::Skip,
            Self::Update { old, new } => (old, new),
        };

        if old.metadata.resource_version == new.metadata.resource_version {
            return Decision::Skip;
        }
        if new.metadata.deletion_timestamp.is_some() {
            return Decision::Skip;
        }
        if !has_status(old) && !has_status(new) {
            return Decision::Reconcile;
        }
        if only_status_changed(old, new) {
            tracing::trace!("Only the status annotation changed");
            metrics.skipped_only_status_change();
            return Decision::Skip;
        }
        Decision::Reconcile
    }
}

fn has_status(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(annotations::STATUS))
}

fn only_status_changed(old: &Pod, new: &Pod) -> bool {
    old.spec == new.spec
        && old.status == new.status
        && without_status(&old.metadata) == without_status(&new.metadata)
}

/// Metadata without the fields every write changes.
fn without_status(meta: &ObjectMeta) -> ObjectMeta {
    let mut meta = meta.clone();
    meta.resource_version = None;
    meta.managed_fields = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(annotations::STATUS);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{mk_pod, ScaleAnnotations};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, Time};

    fn versioned(version: &str) -> Pod {
        let mut pod = mk_pod(ScaleAnnotations::cpu_and_memory());
        pod.metadata.resource_version = Some(version.to_string());
        pod
    }

    fn with_status(mut pod: Pod, status: &str) -> Pod {
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(annotations::STATUS.to_string(), status.to_string());
        pod
    }

    #[test]
    fn create_delete_and_generic() {
        let metrics = ReconcilerMetrics::default();
        let pod = versioned("1");
        assert_eq!(PodEvent::Create(&pod).decide(&metrics), Decision::Reconcile);
        assert_eq!(PodEvent::Delete(&pod).decide(&metrics), Decision::Skip);
        assert_eq!(PodEvent::Generic(&pod).decide(&metrics), Decision::Skip);
    }

    #[test]
    fn same_version_is_skipped() {
        let metrics = ReconcilerMetrics::default();
        let old = versioned("1");
        let mut new = versioned("1");
        new.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("other".to_string(), "label".to_string());
        let event = PodEvent::Update { old: &old, new: &new };
        assert_eq!(event.decide(&metrics), Decision::Skip);
    }

    #[test]
    fn deleting_pods_are_skipped() {
        let metrics = ReconcilerMetrics::default();
        let old = versioned("1");
        let mut new = versioned("2");
        new.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let event = PodEvent::Update { old: &old, new: &new };
        assert_eq!(event.decide(&metrics), Decision::Skip);
    }

    #[test]
    fn unmanaged_updates_are_reconciled() {
        let metrics = ReconcilerMetrics::default();
        let old = versioned("1");
        let new = versioned("2");
        let event = PodEvent::Update { old: &old, new: &new };
        assert_eq!(event.decide(&metrics), Decision::Reconcile);
        assert_eq!(metrics.skipped_only_status_change_count(), 0);
    }

    #[test]
    fn only_status_change_is_skipped() {
        let metrics = ReconcilerMetrics::default();
        let old = with_status(versioned("1"), "{\"status\":\"a\"}");
        let mut new = with_status(versioned("2"), "{\"status\":\"b\"}");
        new.metadata.managed_fields = Some(vec![ManagedFieldsEntry {
            manager: Some("startup-scaler".to_string()),
            ..Default::default()
        }]);
        let event = PodEvent::Update { old: &old, new: &new };
        assert_eq!(event.decide(&metrics), Decision::Skip);
        assert_eq!(metrics.skipped_only_status_change_count(), 1);

        // The first status write is also a status-only change.
        let old = versioned("1");
        let new = with_status(versioned("2"), "{\"status\":\"a\"}");
        let event = PodEvent::Update { old: &old, new: &new };
        assert_eq!(event.decide(&metrics), Decision::Skip);
        assert_eq!(metrics.skipped_only_status_change_count(), 2);
    }

    #[test]
    fn other_changes_are_reconciled() {
        let metrics = ReconcilerMetrics::default();
        let old = with_status(versioned("1"), "{}");
        let mut new = with_status(versioned("2"), "{}");
        new.status.as_mut().unwrap().qos_class = Some("Burstable".to_string());
        let event = PodEvent::Update { old: &old, new: &new };
        assert_eq!(event.decide(&metrics), Decision::Reconcile);
        assert_eq!(event.kind(), EventKind::Update);
        assert_eq!(event.pod().metadata.resource_version.as_deref(), Some("2"));
    }
}
