//! Label and annotation keys read from and written to managed pods.

pub const PREFIX: &str = "startup-scaler.io";

/// Pods opt in by carrying this label with the value `true`.
pub const ENABLED_LABEL: &str = "startup-scaler.io/enabled";

/// The name of the container whose resources are managed.
pub const TARGET_CONTAINER_NAME: &str = "startup-scaler.io/target-container-name";

pub const CPU_STARTUP: &str = "startup-scaler.io/cpu-startup";
pub const CPU_POST_STARTUP_REQUESTS: &str = "startup-scaler.io/cpu-post-startup-requests";
pub const CPU_POST_STARTUP_LIMITS: &str = "startup-scaler.io/cpu-post-startup-limits";

pub const MEMORY_STARTUP: &str = "startup-scaler.io/memory-startup";
pub const MEMORY_POST_STARTUP_REQUESTS: &str = "startup-scaler.io/memory-post-startup-requests";
pub const MEMORY_POST_STARTUP_LIMITS: &str = "startup-scaler.io/memory-post-startup-limits";

/// The JSON status record maintained by the controller.
pub const STATUS: &str = "startup-scaler.io/status";

/// Annotations set by the vertical pod autoscaler's admission controller. A pod
/// carrying any of them is managed by a VPA and must be left alone.
pub const KNOWN_VPA_ANNOTATIONS: &[&str] = &["vpaObservedContainers", "vpaUpdates"];
