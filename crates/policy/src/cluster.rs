//! Read access to the cluster objects inspectors consult

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};

/// Errors surfaced by the cluster collaborators
#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    /// The stored object changed since it was read (optimistic concurrency)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Kubernetes internal error
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    /// `serde` errors
    #[error("Serialization Error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ClusterError {
    /// Whether the write was rejected because the object was modified concurrently
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref status) if status.code == 409 => {
                Self::Conflict(status.message.clone())
            }
            other => Self::KubeError(other),
        }
    }
}

/// The cluster reads inspectors are allowed to make
#[async_trait]
pub trait ClusterRead: Send + Sync {
    /// Lists the pods of `namespace` whose `status.podIP` equals `pod_ip`
    async fn list_pods(&self, namespace: &str, pod_ip: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Lists every service of `namespace`
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError>;
}
