//! Test doubles shared by the policy and operator test suites
#![allow(clippy::expect_used, clippy::missing_panics_doc, missing_docs)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus, Service, ServiceSpec};
use kube::ResourceExt;
use kube::api::ObjectMeta;
use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, Ia5String, KeyPair, SanType,
};

use crate::{CertificateRequest, ClusterError, ClusterRead};

const RSA_2048_KEY: &str = include_str!("testdata/rsa2048.pem");

/// In-memory pods and services
#[derive(Debug, Default)]
pub struct FakeCluster {
    pods: Vec<Pod>,
    services: Vec<Service>,
    failing: bool,
    reads: AtomicUsize,
}

impl FakeCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_pod(mut self, pod: Pod) -> Self {
        self.pods.push(pod);
        self
    }

    #[must_use]
    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Every read fails with a transport error
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Number of list calls served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<(), ClusterError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(kube::Error::Service("cluster unreachable".into()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterRead for FakeCluster {
    async fn list_pods(&self, namespace: &str, pod_ip: &str) -> Result<Vec<Pod>, ClusterError> {
        self.read()?;
        Ok(self
            .pods
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| p.status.as_ref().and_then(|s| s.pod_ip.as_deref()) == Some(pod_ip))
            .cloned()
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        self.read()?;
        Ok(self
            .services
            .iter()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// A running pod using the `someserviceaccount` service account
#[must_use]
pub fn pod(name: &str, namespace: &str, ip: &str, pod_labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(pod_labels)),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some("someserviceaccount".to_string()),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..PodStatus::default()
        }),
    }
}

/// A `ClusterIP` service with the given selector
#[must_use]
pub fn service(name: &str, namespace: &str, selector: &[(&str, &str)], cluster_ip: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(selector)),
            cluster_ip: Some(cluster_ip.to_string()),
            type_: Some("ClusterIP".to_string()),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

/// A pending `CertificateSigningRequest` carrying `pem`
#[must_use]
pub fn signing_request(name: &str, username: &str, pem: &str) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..ObjectMeta::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(pem.as_bytes().to_vec()),
            signer_name: "example.com/pod-serving".to_string(),
            username: Some(username.to_string()),
            groups: Some(vec!["system:serviceaccounts".to_string()]),
            usages: Some(vec![
                "digital signature".to_string(),
                "key encipherment".to_string(),
                "server auth".to_string(),
            ]),
            ..CertificateSigningRequestSpec::default()
        },
        status: None,
    }
}

/// Builds real, signed certificate requests
#[derive(Clone, Debug, Default)]
pub struct CsrBuilder {
    common_name: String,
    organization: Option<String>,
    alt_names: Vec<SanType>,
    extensions: Vec<(Vec<u64>, Vec<u8>)>,
    rsa: bool,
}

impl CsrBuilder {
    #[must_use]
    pub fn new(common_name: &str) -> Self {
        Self {
            common_name: common_name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn organization(mut self, organization: &str) -> Self {
        self.organization = Some(organization.to_string());
        self
    }

    #[must_use]
    pub fn dns_name(mut self, name: &str) -> Self {
        let name = Ia5String::try_from(name.to_string()).expect("ia5 dns name");
        self.alt_names.push(SanType::DnsName(name));
        self
    }

    #[must_use]
    pub fn ip(mut self, ip: &str) -> Self {
        let ip: IpAddr = ip.parse().expect("ip address");
        self.alt_names.push(SanType::IpAddress(ip));
        self
    }

    #[must_use]
    pub fn email(mut self, email: &str) -> Self {
        let email = Ia5String::try_from(email.to_string()).expect("ia5 email");
        self.alt_names.push(SanType::Rfc822Name(email));
        self
    }

    /// Requests an opaque extension with a DER `NULL` value
    #[must_use]
    pub fn extension(mut self, oid: &[u64]) -> Self {
        self.extension_with_value(oid, &[0x05, 0x00])
    }

    /// Requests an extension carrying `value` verbatim
    #[must_use]
    pub fn extension_with_value(mut self, oid: &[u64], value: &[u8]) -> Self {
        self.extensions.push((oid.to_vec(), value.to_vec()));
        self
    }

    /// Signs with a 2048 bit RSA key instead of P-256
    #[must_use]
    pub fn rsa(mut self) -> Self {
        self.rsa = true;
        self
    }

    #[must_use]
    pub fn pem(&self) -> String {
        self.serialize().pem().expect("pem encode request")
    }

    #[must_use]
    pub fn der(&self) -> Vec<u8> {
        self.serialize().der().to_vec()
    }

    /// The parsed form of the built request
    #[must_use]
    pub fn request(&self) -> CertificateRequest {
        crate::csr::extract(self.pem().as_bytes()).expect("builder produces valid requests")
    }

    fn serialize(&self) -> rcgen::CertificateSigningRequest {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.clone());
        if let Some(organization) = &self.organization {
            dn.push(DnType::OrganizationName, organization.clone());
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names.clone_from(&self.alt_names);
        params.custom_extensions = self
            .extensions
            .iter()
            .map(|(oid, value)| CustomExtension::from_oid_content(oid, value.clone()))
            .collect();

        let key = if self.rsa {
            KeyPair::from_pem_and_sign_algo(RSA_2048_KEY, &rcgen::PKCS_RSA_SHA256)
        } else {
            KeyPair::generate()
        }
        .expect("key pair");

        params.serialize_request(&key).expect("serialize request")
    }
}
