//! Requires the requesting user to belong to a group

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::{ClusterError, ClusterRead, ConfigError, Inspector};

/// Registered name
pub const NAME: &str = "group";

/// Objects unless the requesting user is in the configured group
#[derive(Debug)]
pub struct Group {
    required: String,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            required: "system:kubelet-bootstrap".to_string(),
        }
    }
}

#[async_trait]
impl Inspector for Group {
    fn configure(self: Arc<Self>, config: &str) -> Result<Arc<dyn Inspector>, ConfigError> {
        if config.is_empty() {
            return Ok(self);
        }
        Ok(Arc::new(Self {
            required: config.to_string(),
        }))
    }

    async fn inspect(
        &self,
        _client: &dyn ClusterRead,
        request: &CertificateSigningRequest,
    ) -> Result<Option<String>, ClusterError> {
        let in_group = request
            .spec
            .groups
            .iter()
            .flatten()
            .any(|g| *g == self.required);

        if in_group {
            return Ok(None);
        }
        Ok(Some(format!(
            "Requesting user is not in the {} group",
            self.required
        )))
    }
}
