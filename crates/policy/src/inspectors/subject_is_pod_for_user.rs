//! Binds the request subject to the service account of the pod it names.
//!
//! The subject must be the canonical pod name, a live pod must own that IP in
//! that namespace, and the request must have been submitted by the pod's own
//! service account.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use tracing::debug;

use crate::csr;
use crate::{ClusterError, ClusterRead, ConfigError, Inspector, PodIdentity};

/// Registered name
pub const NAME: &str = "subjectispodforuser";

/// Objects unless the requesting user is the service account of the subject pod
#[derive(Debug)]
pub struct SubjectIsPodForUser {
    cluster_domain: String,
}

impl SubjectIsPodForUser {
    /// Inspector resolving pod names within `cluster_domain`
    #[must_use]
    pub fn new(cluster_domain: &str) -> Self {
        Self {
            cluster_domain: cluster_domain.to_string(),
        }
    }
}

#[async_trait]
impl Inspector for SubjectIsPodForUser {
    fn configure(self: Arc<Self>, config: &str) -> Result<Arc<dyn Inspector>, ConfigError> {
        if config.is_empty() {
            return Ok(self);
        }
        Ok(Arc::new(Self::new(config)))
    }

    async fn inspect(
        &self,
        client: &dyn ClusterRead,
        request: &CertificateSigningRequest,
    ) -> Result<Option<String>, ClusterError> {
        let certificate_request = match csr::from_signing_request(request) {
            Ok(parsed) => parsed,
            Err(rejection) => return Ok(Some(rejection)),
        };
        let identity = match PodIdentity::from_request(&self.cluster_domain, &certificate_request) {
            Ok(identity) => identity,
            Err(rejection) => return Ok(Some(rejection)),
        };

        let Some(pod) = identity.find_pod(client).await? else {
            return Ok(Some(identity.missing_pod_message()));
        };

        let service_account = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.as_deref())
            .unwrap_or("default");
        let expected = format!(
            "system:serviceaccount:{}:{service_account}",
            identity.namespace
        );
        let username = request.spec.username.as_deref().unwrap_or_default();
        debug!(%username, %expected, "matched subject to pod");

        if username == expected {
            return Ok(None);
        }
        Ok(Some(format!(
            "Requesting user \"{username}\" is not \"{expected}\""
        )))
    }
}
