//! Command line and environment configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use csrgate_policy::{Chain, ConfigError, DEFAULT_CLUSTER_DOMAIN, InspectorSpec, Registry};

use crate::approver::{ConflictRetry, Policy};

/// Automatically approves or denies certificate signing requests.
///
/// Inspectors are given as `name` or `name=config`. Several inspectors can be
/// passed in one environment variable separated by `;`.
#[derive(Parser, Clone, Debug)]
#[command(name = "csrgate", version)]
pub struct Settings {
    /// Inspector excluding requests from consideration
    #[arg(long = "filter", env = "CSRGATE_FILTERS", value_delimiter = ';')]
    pub filters: Vec<InspectorSpec>,

    /// Inspector denying requests, consulted in order
    #[arg(long = "denier", env = "CSRGATE_DENIERS", value_delimiter = ';')]
    pub deniers: Vec<InspectorSpec>,

    /// Inspector logging warnings without blocking approval
    #[arg(long = "warner", env = "CSRGATE_WARNERS", value_delimiter = ';')]
    pub warners: Vec<InspectorSpec>,

    /// Delay after which decided requests are deleted
    #[arg(long, env = "CSRGATE_DELETE_AFTER", default_value = "1m", value_parser = humantime::parse_duration)]
    pub delete_after: Duration,

    /// DNS domain of the cluster, the default for pod-aware inspectors
    #[arg(long, env = "CSRGATE_CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,

    /// Requeue interval of undecided requests
    #[arg(long, env = "CSRGATE_RESYNC", default_value = "30s", value_parser = humantime::parse_duration)]
    pub resync: Duration,

    /// Decision writes attempted before giving up on conflicts
    #[arg(long, env = "CSRGATE_CONFLICT_RETRIES", default_value_t = 10)]
    pub conflict_retries: u32,

    /// Address of the health and diagnostics server
    #[arg(long, env = "CSRGATE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,
}

impl Settings {
    /// Resolves the configured inspector chains against the built-in registry.
    ///
    /// # Errors
    ///
    /// Fails on unknown inspector names and configuration strings an inspector
    /// does not understand
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        let registry = Registry::builtin(&self.cluster_domain)?;

        Ok(Policy {
            filters: Chain::from_specs(&registry, &self.filters)?,
            deniers: Chain::from_specs(&registry, &self.deniers)?,
            warners: Chain::from_specs(&registry, &self.warners)?,
        })
    }

    /// Conflict backoff with the configured attempt budget
    #[must_use]
    pub fn conflict_retry(&self) -> ConflictRetry {
        ConflictRetry::with_max_attempts(self.conflict_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 8] = [
        "CSRGATE_FILTERS",
        "CSRGATE_DENIERS",
        "CSRGATE_WARNERS",
        "CSRGATE_DELETE_AFTER",
        "CSRGATE_CLUSTER_DOMAIN",
        "CSRGATE_RESYNC",
        "CSRGATE_CONFLICT_RETRIES",
        "CSRGATE_LISTEN",
    ];

    fn parse(args: &[&str]) -> Result<Settings, clap::Error> {
        Settings::try_parse_from(std::iter::once("csrgate").chain(args.iter().copied()))
    }

    fn without_env<R>(f: impl FnOnce() -> R) -> R {
        temp_env::with_vars_unset(VARS, f)
    }

    #[test]
    fn defaults() {
        let settings = without_env(|| parse(&[])).unwrap();

        assert!(settings.filters.is_empty());
        assert_eq!(settings.delete_after, Duration::from_secs(60));
        assert_eq!(settings.cluster_domain, "cluster.local");
        assert_eq!(settings.resync, Duration::from_secs(30));
        assert_eq!(settings.conflict_retries, 10);
        assert_eq!(settings.listen, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn repeated_flags_keep_their_order() {
        let settings = without_env(|| {
            parse(&[
                "--denier",
                "subjectispodforuser",
                "--denier",
                "keyusage=client auth,server auth",
                "--warner",
                "minrsakeysize=4096",
                "--delete-after",
                "5m 30s",
            ])
        })
        .unwrap();

        let deniers = settings
            .deniers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert_eq!(
            deniers,
            ["subjectispodforuser", "keyusage=client auth,server auth"]
        );
        assert_eq!(settings.warners[0].config, "4096");
        assert_eq!(settings.delete_after, Duration::from_secs(330));
        assert!(settings.policy().is_ok());
    }

    #[test]
    fn reads_the_environment() {
        let settings = temp_env::with_vars(
            [
                ("CSRGATE_FILTERS", Some("username=system:node:a;group")),
                ("CSRGATE_CLUSTER_DOMAIN", Some("corp.internal")),
                ("CSRGATE_CONFLICT_RETRIES", Some("3")),
                ("CSRGATE_DENIERS", None),
                ("CSRGATE_WARNERS", None),
            ],
            || parse(&[]),
        )
        .unwrap();

        assert_eq!(settings.filters.len(), 2);
        assert_eq!(settings.filters[0].name, "username");
        assert_eq!(settings.cluster_domain, "corp.internal");
        assert_eq!(settings.conflict_retry().max_attempts, 3);
    }

    #[test]
    fn rejects_unknown_inspectors() {
        let settings = without_env(|| parse(&["--filter", "nosuchthing"])).unwrap();

        assert_eq!(
            settings.policy().unwrap_err(),
            ConfigError::Unknown("nosuchthing".to_string())
        );
    }

    #[test]
    fn rejects_bad_inspector_configuration() {
        let settings = without_env(|| parse(&["--denier", "minrsakeysize=lots"])).unwrap();

        assert!(matches!(
            settings.policy(),
            Err(ConfigError::Inspector { name, .. }) if name == "minrsakeysize"
        ));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(without_env(|| parse(&["--delete-after", "soon"])).is_err());
    }
}
