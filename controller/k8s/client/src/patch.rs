//! Builds the JSON bodies sent to the API server for a mutated pod.

use serde_json::{json, Map, Value};
use startup_scaler_controller_k8s_api::{Pod, PodSpec};

/// A strategic-merge patch for the `resize` subresource carrying the resources
/// of every container whose resources differ between `before` and `after`.
///
/// Returns `None` when no container resources changed.
pub(crate) fn resize(
    before: &Pod,
    after: &Pod,
    resource_version: Option<&str>,
) -> Result<Option<Value>, serde_json::Error> {
    let containers = after
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .filter(|container| {
            let previous = before
                .spec
                .as_ref()
                .and_then(|spec: &PodSpec| spec.containers.iter().find(|c| c.name == container.name));
            previous.map(|c| &c.resources) != Some(&container.resources)
        })
        .map(|container| {
            Ok(json!({
                "name": container.name,
                "resources": serde_json::to_value(&container.resources)?,
            }))
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    if containers.is_empty() {
        return Ok(None);
    }

    Ok(Some(json!({
        "metadata": precondition(resource_version),
        "spec": { "containers": containers },
    })))
}

/// A merge patch for the labels and annotations that differ between `before`
/// and `after`. Returns `None` when neither changed.
///
/// Mutators only add or replace keys, so removed keys are not expressed.
pub(crate) fn metadata(
    before: &Pod,
    after: &Pod,
    resource_version: Option<&str>,
) -> Result<Option<Value>, serde_json::Error> {
    let before = &before.metadata;
    let after = &after.metadata;
    if before.labels == after.labels && before.annotations == after.annotations {
        return Ok(None);
    }

    let mut metadata = precondition(resource_version);
    if before.labels != after.labels {
        metadata.insert("labels".to_string(), serde_json::to_value(&after.labels)?);
    }
    if before.annotations != after.annotations {
        metadata.insert(
            "annotations".to_string(),
            serde_json::to_value(&after.annotations)?,
        );
    }
    Ok(Some(json!({ "metadata": metadata })))
}

/// Including the resource version makes the write fail with a conflict if the
/// pod changed since it was read.
fn precondition(resource_version: Option<&str>) -> Map<String, Value> {
    let mut metadata = Map::new();
    if let Some(version) = resource_version {
        metadata.insert(
            "resourceVersion".to_string(),
            Value::String(version.to_string()),
        );
    }
    metadata
}
