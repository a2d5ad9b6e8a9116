// Copyright 2026 Csrgate Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Operator internals

use csrgate_policy::{ClusterError, ConfigError};

/// Generic Error for the decision lifecycle
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A filter or denier could not reach a verdict
    #[error("Inspector {name} failed: {source}")]
    Inspector {
        /// Registered name of the failing inspector
        name: String,
        /// Underlying cluster failure
        #[source]
        source: ClusterError,
    },

    /// Writing the decision was rejected for a reason other than a conflict
    #[error("Update Error: {0}")]
    Update(#[source] ClusterError),

    /// Re-reading the request after a conflict failed
    #[error("Refetch Error: {0}")]
    Refetch(#[source] ClusterError),

    /// Every decision write conflicted with a concurrent modification
    #[error("Gave up after {0} conflicting updates")]
    ConflictRetriesExhausted(u32),

    /// Invalid inspector configuration
    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),

    /// Kubernetes internal error
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    /// Generic string error messages
    #[error("{0}")]
    Message(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl Error {
    /// Label of the stage that failed, used for error counts
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Error::Inspector { name, .. } => name.as_str(),
            Error::Update(_) => "updateApproval",
            Error::Refetch(_) => "refetch",
            Error::ConflictRetriesExhausted(_) => "conflict",
            Error::Config(_) => "config",
            Error::KubeError(_) => "kube",
            Error::Message(_) => "internal",
        }
    }
}

/// Generic result type to be used in the controller
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod approver;
pub mod cluster;
pub mod config;
pub mod controller;
mod diagnostics;
pub mod scheduler;

pub mod lease;
pub mod telemetry;

pub use crate::controller::{State, run};
pub use crate::diagnostics::*;
