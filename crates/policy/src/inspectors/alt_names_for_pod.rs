//! Restricts subject alternative names to those the subject pod may claim

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::csr::{self, AltName};
use crate::podnames::names_for_pod;
use crate::{ClusterError, ClusterRead, ConfigError, Inspector, PodIdentity};

/// Registered name
pub const NAME: &str = "altnamesforpod";

/// Objects to any SAN outside the permitted names of the subject pod
#[derive(Debug)]
pub struct AltNamesForPod {
    cluster_domain: String,
}

impl AltNamesForPod {
    /// Inspector resolving pod names within `cluster_domain`
    #[must_use]
    pub fn new(cluster_domain: &str) -> Self {
        Self {
            cluster_domain: cluster_domain.to_string(),
        }
    }
}

#[async_trait]
impl Inspector for AltNamesForPod {
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
        let permitted = names_for_pod(client, &pod, &self.cluster_domain).await?;

        let bad = certificate_request
            .alt_names
            .iter()
            .filter(|name| match name {
                AltName::Dns(dns) => !permitted.permits_dns(dns),
                AltName::Ip(ip) => !permitted.permits_ip(*ip),
                AltName::Email(_) | AltName::Other { .. } => true,
            })
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        if bad.is_empty() {
            return Ok(None);
        }
        let plural = if bad.len() == 1 { "" } else { "s" };
        Ok(Some(format!(
            "Subject Alt Name contains disallowed name{plural}: {}",
            bad.join(",")
        )))
    }
}
