//! Restricts the key usages a request may ask for

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use super::describe;
use crate::{ClusterError, ClusterRead, ConfigError, Inspector};

/// Registered name
pub const NAME: &str = "keyusage";

// Usage names as spelled by the certificates API
const SUPPORTED: [&str; 23] = [
    "signing",
    "digital signature",
    "content commitment",
    "key encipherment",
    "key agreement",
    "data encipherment",
    "cert sign",
    "crl sign",
    "encipher only",
    "decipher only",
    "any",
    "server auth",
    "client auth",
    "code signing",
    "email protection",
    "s/mime",
    "ipsec end system",
    "ipsec tunnel",
    "ipsec user",
    "timestamping",
    "ocsp signing",
    "microsoft sgc",
    "netscape sgc",
];

const DEFAULT_PERMITTED: [&str; 4] = [
    "digital signature",
    "key encipherment",
    "server auth",
    "client auth",
];

/// Objects to any requested usage outside the permitted set
#[derive(Debug)]
pub struct KeyUsage {
    permitted: BTreeSet<&'static str>,
}

impl Default for KeyUsage {
    fn default() -> Self {
        Self {
            permitted: DEFAULT_PERMITTED.into_iter().collect(),
        }
    }
}

/// Maps a configured usage (any case, `_` for spaces) to its API spelling
fn lookup(usage: &str) -> Option<&'static str> {
    let normalized = usage.trim().to_lowercase().replace('_', " ");
    // historical misspelling
    if normalized == "content committment" {
        return Some("content commitment");
    }
    SUPPORTED.into_iter().find(|s| *s == normalized)
}

#[async_trait]
impl Inspector for KeyUsage {
    fn configure(self: Arc<Self>, config: &str) -> Result<Arc<dyn Inspector>, ConfigError> {
        if config.is_empty() {
            return Ok(self);
        }

        let permitted = config
            .split(',')
            .map(|usage| {
                lookup(usage).ok_or_else(|| ConfigError::Invalid(format!("unsupported usage {usage}")))
            })
            .collect::<Result<_, _>>()?;

        Ok(Arc::new(Self { permitted }))
    }

    async fn inspect(
        &self,
        _client: &dyn ClusterRead,
        request: &CertificateSigningRequest,
    ) -> Result<Option<String>, ClusterError> {
        let bad = request
            .spec
            .usages
            .iter()
            .flatten()
            .filter(|usage| !self.permitted.contains(usage.as_str()))
            .cloned()
            .collect::<Vec<_>>();

        if bad.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("Contains {}", describe("key usage", &bad))))
    }
}
