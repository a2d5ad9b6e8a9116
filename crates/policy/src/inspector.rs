//! The inspector contract, the name registry and configured chains

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::{ClusterError, ClusterRead};

/// Inspector configuration failures, fatal at startup
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No inspector is registered under this name
    #[error("unknown inspector {0:?}")]
    Unknown(String),

    /// Two inspectors were registered under the same name
    #[error("inspector {0:?} is registered twice")]
    Duplicate(String),

    /// The inspector did not understand its configuration string
    #[error("{0}")]
    Invalid(String),

    /// A named inspector rejected its configuration
    #[error("inspector {name:?}: {source}")]
    Inspector {
        /// Registered name
        name: String,
        /// What the inspector complained about
        #[source]
        source: Box<ConfigError>,
    },
}

/// A policy check over a certificate signing request.
///
/// Instances are immutable once configured and are shared between concurrent
/// decisions.
#[async_trait]
pub trait Inspector: fmt::Debug + Send + Sync {
    /// Returns an inspector reflecting `config`; an empty string returns `self`.
    ///
    /// # Errors
    ///
    /// Fails when the configuration string is not understood
    fn configure(self: Arc<Self>, config: &str) -> Result<Arc<dyn Inspector>, ConfigError>;

    /// `Ok(None)` means no objection, `Ok(Some(verdict))` is a policy objection.
    ///
    /// # Errors
    ///
    /// Only failures unrelated to the request content (cluster reads) are errors
    async fn inspect(
        &self,
        client: &dyn ClusterRead,
        request: &CertificateSigningRequest,
    ) -> Result<Option<String>, ClusterError>;
}

/// An inspector name with its optional configuration, written `name[=config]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectorSpec {
    /// Registered inspector name
    pub name: String,
    /// Configuration string, empty for defaults
    pub config: String,
}

impl InspectorSpec {
    /// Spec for `name` with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: String::new(),
        }
    }

    /// Spec for `name` with `config`
    #[must_use]
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }
}

impl FromStr for InspectorSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, config) = s.split_once('=').unwrap_or((s, ""));
        if name.is_empty() {
            return Err(ConfigError::Unknown(s.to_string()));
        }
        Ok(Self::new(name).with_config(config))
    }
}

impl fmt::Display for InspectorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.config.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}={}", self.name, self.config)
        }
    }
}

/// Inspectors by name, populated once at startup
#[derive(Clone, Debug, Default)]
pub struct Registry {
    inspectors: BTreeMap<String, Arc<dyn Inspector>>,
}

impl Registry {
    /// A registry holding every built-in inspector
    ///
    /// # Errors
    ///
    /// Fails if two built-in inspectors share a name
    pub fn builtin(cluster_domain: &str) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        crate::inspectors::register_builtin(&mut registry, cluster_domain)?;
        Ok(registry)
    }

    /// Registers `inspector` under `name`
    ///
    /// # Errors
    ///
    /// Fails if the name is taken
    pub fn register(
        &mut self,
        name: impl Into<String>,
        inspector: Arc<dyn Inspector>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.inspectors.contains_key(&name) {
            return Err(ConfigError::Duplicate(name));
        }
        self.inspectors.insert(name, inspector);
        Ok(())
    }

    /// Looks an inspector up by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Inspector>> {
        self.inspectors.get(name).cloned()
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inspectors.keys().map(String::as_str)
    }

    /// Resolves a spec into a configured inspector.
    ///
    /// The registered instance is left untouched, so a failure here never
    /// affects other chains using the same name.
    ///
    /// # Errors
    ///
    /// Fails on unknown names and rejected configurations
    pub fn configure(&self, spec: &InspectorSpec) -> Result<Arc<dyn Inspector>, ConfigError> {
        let inspector = self
            .get(&spec.name)
            .ok_or_else(|| ConfigError::Unknown(spec.name.clone()))?;

        inspector
            .configure(&spec.config)
            .map_err(|source| ConfigError::Inspector {
                name: spec.name.clone(),
                source: Box::new(source),
            })
    }
}

/// One configured step of a [`Chain`]
#[derive(Clone, Debug)]
pub struct Link {
    spec: InspectorSpec,
    inspector: Arc<dyn Inspector>,
}

impl Link {
    /// Registered name, used as the decision reason
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The configured inspector
    #[must_use]
    pub fn inspector(&self) -> &dyn Inspector {
        self.inspector.as_ref()
    }
}

/// An ordered list of configured inspectors
#[derive(Clone, Debug, Default)]
pub struct Chain {
    links: Vec<Link>,
}

impl Chain {
    /// Resolves every spec in order
    ///
    /// # Errors
    ///
    /// Fails on the first spec the registry cannot resolve
    pub fn from_specs(registry: &Registry, specs: &[InspectorSpec]) -> Result<Self, ConfigError> {
        let links = specs
            .iter()
            .map(|spec| {
                Ok(Link {
                    spec: spec.clone(),
                    inspector: registry.configure(spec)?,
                })
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(Self { links })
    }

    /// Configured links in order
    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    /// Number of links
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the chain has no links
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for link in &self.links {
            write!(f, "{sep}{}", link.spec)?;
            sep = ",";
        }
        Ok(())
    }
}
