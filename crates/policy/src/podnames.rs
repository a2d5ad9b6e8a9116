//! The DNS names and IPs a pod may legitimately put in a certificate

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;

use crate::{ClusterError, ClusterRead};

/// Names a pod is permitted to claim, either in its own right or through
/// the services selecting it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermittedNames {
    dns_names: Vec<String>,
    ips: Vec<IpAddr>,
}

impl PermittedNames {
    /// Permitted DNS names in discovery order
    #[must_use]
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Permitted IP addresses in discovery order
    #[must_use]
    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    /// DNS names compare ASCII case-insensitively
    #[must_use]
    pub fn permits_dns(&self, name: &str) -> bool {
        self.dns_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    /// IPv4-mapped IPv6 addresses compare equal to their IPv4 form
    #[must_use]
    pub fn permits_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.ips.iter().any(|p| p.to_canonical() == ip)
    }

    fn add_dns(&mut self, name: String) {
        if !self.permits_dns(&name) {
            self.dns_names.push(name);
        }
    }

    fn add_ip(&mut self, ip: &str) {
        let Ok(ip) = ip.parse::<IpAddr>() else {
            return;
        };
        if !self.permits_ip(ip) {
            self.ips.push(ip);
        }
    }
}

/// Collects the names permitted for `pod`, listing the services of its namespace.
///
/// Static endpoints are not taken into account.
///
/// # Errors
///
/// Fails only when the service listing fails
pub async fn names_for_pod(
    client: &dyn ClusterRead,
    pod: &Pod,
    cluster_domain: &str,
) -> Result<PermittedNames, ClusterError> {
    let namespace = pod.namespace().unwrap_or_default();
    let services = client.list_services(&namespace).await?;

    Ok(permitted_names(pod, &services, cluster_domain))
}

/// Computes the permitted names of `pod` given the services of its namespace
#[must_use]
pub fn permitted_names(pod: &Pod, services: &[Service], cluster_domain: &str) -> PermittedNames {
    let namespace = pod.namespace().unwrap_or_default();
    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .unwrap_or_default();

    let mut names = PermittedNames::default();
    names.add_dns(format!(
        "{}.{namespace}.pod.{cluster_domain}",
        pod_ip.replace('.', "-")
    ));

    if let Some(spec) = &pod.spec
        && let (Some(hostname), Some(subdomain)) = (&spec.hostname, &spec.subdomain)
        && !hostname.is_empty()
        && !subdomain.is_empty()
    {
        names.add_dns(format!(
            "{hostname}.{subdomain}.{namespace}.svc.{cluster_domain}"
        ));
    }

    names.add_ip(pod_ip);

    let empty = BTreeMap::new();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);

    for service in services {
        if service.namespace().unwrap_or_default() != namespace {
            continue;
        }
        let Some(spec) = &service.spec else {
            continue;
        };
        let Some(selector) = &spec.selector else {
            continue;
        };
        if !selector.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            continue;
        }

        names.add_dns(format!(
            "{}.{namespace}.svc.{cluster_domain}",
            service.name_any()
        ));

        if spec.type_.as_deref() == Some("ExternalName") {
            if let Some(external_name) = spec.external_name.as_ref().filter(|n| !n.is_empty()) {
                names.add_dns(external_name.clone());
            }
        } else if let Some(cluster_ip) = &spec.cluster_ip {
            names.add_ip(cluster_ip);
        }

        for external_ip in spec.external_ips.iter().flatten() {
            names.add_ip(external_ip);
        }
    }

    names
}
