//! Extension allow-list. Only subjectAltName is permitted unless more OIDs
//! are configured.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use super::describe;
use crate::csr;
use crate::{ClusterError, ClusterRead, ConfigError, Inspector};

/// Registered name
pub const NAME: &str = "noextensions";

const SUBJECT_ALT_NAME: &str = "2.5.29.17";

/// Objects to X.509 extensions outside the permitted set
#[derive(Debug)]
pub struct NoExtensions {
    permitted: BTreeSet<String>,
}

impl Default for NoExtensions {
    fn default() -> Self {
        Self {
            permitted: BTreeSet::from([SUBJECT_ALT_NAME.to_string()]),
        }
    }
}

fn is_dotted_oid(oid: &str) -> bool {
    let arcs = oid.split('.').collect::<Vec<_>>();
    arcs.len() >= 2
        && arcs
            .iter()
            .all(|arc| !arc.is_empty() && arc.bytes().all(|b| b.is_ascii_digit()))
}

#[async_trait]
impl Inspector for NoExtensions {
    fn configure(self: Arc<Self>, config: &str) -> Result<Arc<dyn Inspector>, ConfigError> {
        if config.is_empty() {
            return Ok(self);
        }

        let mut permitted = self.permitted.clone();
        for oid in config.split(',').map(str::trim) {
            if !is_dotted_oid(oid) {
                return Err(ConfigError::Invalid(format!("invalid extension OID {oid}")));
            }
            permitted.insert(oid.to_string());
        }

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

        let bad = certificate_request
            .extensions
            .iter()
            .filter(|extension| !self.permitted.contains(&extension.oid))
            .map(|extension| extension.oid.clone())
            .collect::<Vec<_>>();

        if bad.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("Contains {}", describe("X.509 extension", &bad))))
    }
}
