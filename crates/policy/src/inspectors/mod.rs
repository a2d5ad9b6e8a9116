//! Built-in inspectors

use std::sync::Arc;

use crate::{ConfigError, Registry};

pub mod alt_names_for_pod;
pub mod group;
pub mod key_usage;
pub mod min_rsa_key_size;
pub mod no_extensions;
pub mod signature_algorithm;
pub mod subject_is_pod_for_user;
pub mod username;

pub use alt_names_for_pod::AltNamesForPod;
pub use group::Group;
pub use key_usage::KeyUsage;
pub use min_rsa_key_size::MinRsaKeySize;
pub use no_extensions::NoExtensions;
pub use signature_algorithm::SignatureAlgorithms;
pub use subject_is_pod_for_user::SubjectIsPodForUser;
pub use username::Username;

/// Registers every built-in inspector with its default configuration.
///
/// `cluster_domain` is the default domain of the pod-aware inspectors.
///
/// # Errors
///
/// Fails if a name is already present in `registry`
pub fn register_builtin(registry: &mut Registry, cluster_domain: &str) -> Result<(), ConfigError> {
    registry.register(
        alt_names_for_pod::NAME,
        Arc::new(AltNamesForPod::new(cluster_domain)),
    )?;
    registry.register(group::NAME, Arc::new(Group::default()))?;
    registry.register(key_usage::NAME, Arc::new(KeyUsage::default()))?;
    registry.register(min_rsa_key_size::NAME, Arc::new(MinRsaKeySize::default()))?;
    registry.register(no_extensions::NAME, Arc::new(NoExtensions::default()))?;
    registry.register(
        signature_algorithm::NAME,
        Arc::new(SignatureAlgorithms::default()),
    )?;
    registry.register(
        subject_is_pod_for_user::NAME,
        Arc::new(SubjectIsPodForUser::new(cluster_domain)),
    )?;
    registry.register(username::NAME, Arc::new(Username::default()))?;
    Ok(())
}

/// Joins offending items and pluralises `noun` when there is more than one
fn describe(noun: &str, items: &[String]) -> String {
    let plural = if items.len() == 1 { "" } else { "s" };
    format!("{noun}{plural} {}", items.join(","))
}
