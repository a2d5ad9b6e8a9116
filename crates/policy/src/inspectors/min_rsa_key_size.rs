//! Minimum RSA modulus size. Requests with non-RSA keys pass; restrict key
//! types with the signature algorithm inspector.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::csr::{self, PublicKeyAlgorithm};
use crate::{ClusterError, ClusterRead, ConfigError, Inspector};

/// Registered name
pub const NAME: &str = "minrsakeysize";

/// Objects to RSA keys shorter than the configured number of bits
#[derive(Debug)]
pub struct MinRsaKeySize {
    min_bits: usize,
}

impl Default for MinRsaKeySize {
    fn default() -> Self {
        Self { min_bits: 3072 }
    }
}

#[async_trait]
impl Inspector for MinRsaKeySize {
    fn configure(self: Arc<Self>, config: &str) -> Result<Arc<dyn Inspector>, ConfigError> {
        if config.is_empty() {
            return Ok(self);
        }

        let min_bits = config
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid key size {config:?}: {e}")))?;

        Ok(Arc::new(Self { min_bits }))
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

        match certificate_request.public_key {
            PublicKeyAlgorithm::Rsa { bits } if bits < self.min_bits => Ok(Some(format!(
                "Public key too small: {bits} < {}",
                self.min_bits
            ))),
            _ => Ok(None),
        }
    }
}
