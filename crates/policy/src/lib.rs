// Copyright 2026 Csrgate Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Policy building blocks for automatic certificate signing request decisions.
//!
//! A decision is assembled from three chains of [`Inspector`]s. Every inspector
//! looks at a `CertificateSigningRequest`, optionally consults the cluster
//! through [`ClusterRead`], and either stays silent or returns a human readable
//! verdict.

pub mod cluster;
pub mod csr;
pub mod inspector;
pub mod inspectors;
pub mod pod;
pub mod podnames;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::{ClusterError, ClusterRead};
pub use csr::{AltName, CertificateRequest, PublicKeyAlgorithm, SignatureAlgorithm};
pub use inspector::{Chain, ConfigError, Inspector, InspectorSpec, Link, Registry};
pub use pod::PodIdentity;
pub use podnames::PermittedNames;

/// Cluster domain used when nothing else is configured
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
