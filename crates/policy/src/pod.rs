//! Derivation of the pod a certificate request claims to be

use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::Pod;

use crate::{CertificateRequest, ClusterError, ClusterRead};

/// Pod coordinates taken from a `<a-b-c-d>.<namespace>.pod.<domain>` subject
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    /// Pod IP spelled by the subject
    pub ip: Ipv4Addr,
    /// Namespace spelled by the subject
    pub namespace: String,
}

impl PodIdentity {
    /// Parses the request subject into a pod identity.
    ///
    /// Octets must be plain decimal without leading zeros so that exactly one
    /// spelling maps to a given address.
    ///
    /// # Errors
    ///
    /// Returns the rejection message describing the first defect found
    pub fn from_request(
        cluster_domain: &str,
        request: &CertificateRequest,
    ) -> Result<Self, String> {
        if request.has_extra_names() {
            return Err("Subject has more than one name component".to_string());
        }

        let cn = &request.common_name;
        let not_pod_format = || format!("Subject \"{cn}\" is not a POD-format name");

        let Some(name) = cn.strip_suffix(&format!(".pod.{cluster_domain}")) else {
            return Err(format!(
                "Subject \"{cn}\" is not in the pod.{cluster_domain} domain"
            ));
        };

        let Some((dashed_ip, namespace)) = name.split_once('.') else {
            return Err(not_pod_format());
        };
        if namespace.is_empty() || namespace.contains('.') {
            return Err(not_pod_format());
        }

        let octets = dashed_ip
            .split('-')
            .map(parse_octet)
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(not_pod_format)?;
        let [a, b, c, d] = octets[..] else {
            return Err(not_pod_format());
        };

        Ok(Self {
            ip: Ipv4Addr::new(a, b, c, d),
            namespace: namespace.to_string(),
        })
    }

    /// Finds the live pod with this identity.
    ///
    /// Pods outside the `Pending`/`Running` phases and pods being deleted are
    /// ignored, as their IP may already belong to someone else.
    ///
    /// # Errors
    ///
    /// Fails when the pod listing fails
    pub async fn find_pod(&self, client: &dyn ClusterRead) -> Result<Option<Pod>, ClusterError> {
        let pods = client
            .list_pods(&self.namespace, &self.ip.to_string())
            .await?;

        Ok(pods.into_iter().find(is_live))
    }

    /// Verdict used when [`PodIdentity::find_pod`] comes back empty
    #[must_use]
    pub fn missing_pod_message(&self) -> String {
        format!(
            "No pending or running POD in namespace \"{}\" with IP \"{}\"",
            self.namespace, self.ip
        )
    }
}

fn parse_octet(segment: &str) -> Option<u8> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if segment.len() > 1 && segment.starts_with('0') {
        return None;
    }
    segment.parse().ok()
}

fn is_live(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Pending" | "Running")
    )
}
