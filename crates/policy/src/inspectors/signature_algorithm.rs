//! Restricts the signature algorithm of the request.
//!
//! As the signature algorithm constrains the key type this also acts as a key
//! type allow-list.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::csr::{self, SignatureAlgorithm};
use crate::{ClusterError, ClusterRead, ConfigError, Inspector};

/// Registered name
pub const NAME: &str = "signaturealgorithm";

/// Objects to signature algorithms outside the permitted set
#[derive(Debug)]
pub struct SignatureAlgorithms {
    permitted: BTreeSet<SignatureAlgorithm>,
}

impl Default for SignatureAlgorithms {
    fn default() -> Self {
        Self {
            permitted: BTreeSet::from([
                SignatureAlgorithm::Sha256WithRsa,
                SignatureAlgorithm::Sha384WithRsa,
                SignatureAlgorithm::Sha512WithRsa,
                SignatureAlgorithm::Sha256WithRsaPss,
                SignatureAlgorithm::Sha384WithRsaPss,
                SignatureAlgorithm::Sha512WithRsaPss,
            ]),
        }
    }
}

// MD2 is deliberately absent: it cannot be permitted.
fn lookup(name: &str) -> Option<SignatureAlgorithm> {
    let algorithm = match name.trim().to_lowercase().as_str() {
        "md5withrsa" => SignatureAlgorithm::Md5WithRsa,
        "sha1withrsa" => SignatureAlgorithm::Sha1WithRsa,
        "sha256withrsa" => SignatureAlgorithm::Sha256WithRsa,
        "sha384withrsa" => SignatureAlgorithm::Sha384WithRsa,
        "sha512withrsa" => SignatureAlgorithm::Sha512WithRsa,
        "ecdsawithsha1" => SignatureAlgorithm::EcdsaWithSha1,
        "ecdsawithsha256" => SignatureAlgorithm::EcdsaWithSha256,
        "ecdsawithsha384" => SignatureAlgorithm::EcdsaWithSha384,
        "ecdsawithsha512" => SignatureAlgorithm::EcdsaWithSha512,
        "sha256withrsapss" => SignatureAlgorithm::Sha256WithRsaPss,
        "sha384withrsapss" => SignatureAlgorithm::Sha384WithRsaPss,
        "sha512withrsapss" => SignatureAlgorithm::Sha512WithRsaPss,
        "ed25519" => SignatureAlgorithm::Ed25519,
        _ => return None,
    };
    Some(algorithm)
}

#[async_trait]
impl Inspector for SignatureAlgorithms {
    fn configure(self: Arc<Self>, config: &str) -> Result<Arc<dyn Inspector>, ConfigError> {
        if config.is_empty() {
            return Ok(self);
        }

        let permitted = config
            .split(',')
            .map(|name| {
                lookup(name).ok_or_else(|| {
                    ConfigError::Invalid(format!("unsupported SignatureAlgorithm {name}"))
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Arc::new(Self { permitted }))
    }

    async fn inspect(
        &self,
        _client: &dyn ClusterRead,
        request: &CertificateSigningRequest,
    ) -> Result<Option<String>, ClusterError> {
        let certificate_request = match csr::from_signing_request(request) {
            Ok(parsed) => parsed,
            Err(rejection) => return Ok(Some(rejection)),
        };

        if self.permitted.contains(&certificate_request.signature_algorithm) {
            return Ok(None);
        }
        Ok(Some(format!(
            "SignatureAlgorithm is {}",
            certificate_request.signature_algorithm
        )))
    }
}
