//! Requires the request to be submitted by a fixed user

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::{ClusterError, ClusterRead, ConfigError, Inspector};

/// Registered name
pub const NAME: &str = "username";

/// Objects unless the requesting user is the configured one
#[derive(Debug)]
pub struct Username {
    required: String,
}

impl Default for Username {
    fn default() -> Self {
        Self {
            required: "kubelet-bootstrap".to_string(),
        }
    }
}

#[async_trait]
impl Inspector for Username {
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
        if request.spec.username.as_deref() == Some(self.required.as_str()) {
            return Ok(None);
        }
        Ok(Some(format!("Requesting user is not {}", self.required)))
    }
}
