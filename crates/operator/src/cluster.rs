//! Kubernetes backed cluster collaborators

use async_trait::async_trait;
use csrgate_policy::{ClusterError, ClusterRead};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, instrument};

/// Reads and writes of certificate signing requests
#[async_trait]
pub trait SigningRequests: Send + Sync {
    /// Reads the current state of a request
    async fn get(&self, name: &str) -> Result<CertificateSigningRequest, ClusterError>;

    /// Submits the conditions of `request` to the approval subresource.
    ///
    /// Fails with [`ClusterError::Conflict`] when the stored object no longer
    /// has the resource version carried by `request`.
    async fn update_approval(
        &self,
        request: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, ClusterError>;

    /// Deletes a request; deleting an absent request succeeds
    async fn delete(&self, name: &str) -> Result<(), ClusterError>;
}

/// Cluster collaborators over a [`kube::Client`]
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wraps an existing client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn signing_requests(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterRead for KubeCluster {
    #[instrument(skip(self))]
    async fn list_pods(&self, namespace: &str, pod_ip: &str) -> Result<Vec<Pod>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!("status.podIP={pod_ip}"));

        Ok(pods.list(&params).await?.items)
    }

    #[instrument(skip(self))]
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        Ok(services.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl SigningRequests for KubeCluster {
    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<CertificateSigningRequest, ClusterError> {
        Ok(self.signing_requests().get(name).await?)
    }

    #[instrument(skip(self, request), fields(request_name = %request.name_any()))]
    async fn update_approval(
        &self,
        request: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, ClusterError> {
        let data = serde_json::to_vec(request)?;

        Ok(self
            .signing_requests()
            .replace_subresource("approval", &request.name_any(), &PostParams::default(), data)
            .await?)
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        match self
            .signing_requests()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("request already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
