use core::error::Error;

pub mod nrt;
pub mod pod;
pub mod pod_cache;

pub use nrt::NodeResourceTopology;
pub use nrt::NrtTopologySource;
pub use pod_cache::PodCache;
pub use pod_cache::PodWatcher;

/// Pod lifecycle notifications from the watcher, keyed by `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Applied { key: String },
    Deleted { key: String },
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[display("Failed to parse annotations: {message}")]
    AnnotationParseError { message: String },
    #[display("NodeResourceTopology `{node_name}` not found")]
    TopologyNotFound { node_name: String },
    #[display("Invalid NodeResourceTopology: {message}")]
    InvalidTopology { message: String },
}

impl Error for KubernetesError {}
