//! # Constants
//!
//! Shared constants used throughout the crate.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Label marking every object created by this crate
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "kube-fixtures";

/// Label carrying the scope hash (label values cannot hold arbitrary scope ids)
pub const SCOPE_LABEL: &str = "kube-fixtures.io/scope";

/// Label carrying the object's own name, used as pod selector for services
pub const INSTANCE_LABEL: &str = "kube-fixtures.io/instance";

/// Label marking a scope anchor Job
pub const ANCHOR_LABEL: &str = "kube-fixtures.io/anchor";

/// Annotation carrying the raw scope id
pub const SCOPE_ID_ANNOTATION: &str = "kube-fixtures.io/scope-id";

/// Annotation on the anchor holding the RFC3339 expiry instant
pub const EXPIRES_AT_ANNOTATION: &str = "kube-fixtures.io/expires-at";

/// Readiness gate override: `running`, `containers-ready` or `log`
pub const WAIT_FOR_ANNOTATION: &str = "kube-fixtures.io/wait-for";

/// Comma separated container names for the `containers-ready` gate
pub const WAIT_CONTAINERS_ANNOTATION: &str = "kube-fixtures.io/wait-containers";

/// Text or regex for the `log` gate
pub const WAIT_LOG_ANNOTATION: &str = "kube-fixtures.io/wait-log";

/// How many matching log lines the `log` gate needs
pub const WAIT_LOG_TIMES_ANNOTATION: &str = "kube-fixtures.io/wait-log-times";

/// Per-resource readiness timeout (e.g. `30s`, `2m`)
pub const READY_TIMEOUT_ANNOTATION: &str = "kube-fixtures.io/ready-timeout";

/// Default namespace when neither the manifest nor the config names one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default timeout for a single cluster API operation (seconds)
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

/// Default readiness budget per resource (seconds)
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 120;

/// Default readiness poll interval (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Lower bound of the readiness poll interval (milliseconds)
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

/// Upper bound of the readiness poll interval (milliseconds)
pub const MAX_POLL_INTERVAL_MS: u64 = 2000;

/// Default random jitter added to each poll (milliseconds)
pub const DEFAULT_POLL_JITTER_MS: u64 = 500;

/// Default attempts for transient create failures
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 200;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;

/// Default attempts when probing a tunnel's remote port
pub const DEFAULT_EXPOSE_RETRY_ATTEMPTS: u32 = 10;

/// Default attempts per delete during teardown
pub const DEFAULT_TEARDOWN_RETRY_ATTEMPTS: u32 = 5;

/// Default lifetime granted to a scope before the cluster-side fallback may reclaim it (seconds)
pub const DEFAULT_FALLBACK_TTL_SECS: u64 = 3600;

/// Image run by the anchor Job's single container; it only has to idle
pub const DEFAULT_ANCHOR_IMAGE: &str = "registry.k8s.io/pause:3.10";

/// Container name inside the anchor Job
pub const ANCHOR_CONTAINER_NAME: &str = "anchor";

/// Prefix used for generated names when the manifest gives no name at all
pub const GENERATED_NAME_PREFIX: &str = "kfx";

/// Kubernetes object names (DNS-1123 labels) are capped at 63 characters
pub const MAX_NAME_LEN: usize = 63;

/// Container waiting reasons that will never resolve on their own
pub const TERMINAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];
