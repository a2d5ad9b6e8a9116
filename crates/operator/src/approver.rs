//! The decision pipeline: filters, deniers, warners and the status write

use std::sync::Arc;
use std::time::Duration;

use csrgate_policy::{Chain, ClusterRead};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
    CertificateSigningRequestStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::ResourceExt;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::cluster::SigningRequests;
use crate::scheduler::DeletionScheduler;
use crate::{DecisionCounts, Diagnostics, Error, Result};

/// Condition type of an approved request
pub const APPROVED: &str = "Approved";
/// Condition type of a denied request
pub const DENIED: &str = "Denied";
/// Condition type set by signers that could not issue
pub const FAILED: &str = "Failed";

/// Reason recorded on approvals
pub const APPROVED_REASON: &str = "AutoApproved";
/// Message recorded on approvals
pub const APPROVED_MESSAGE: &str = "Approved by csrgate";

/// The three configured inspector chains
#[derive(Clone, Debug, Default)]
pub struct Policy {
    /// Requests objected to by a filter are skipped
    pub filters: Chain,
    /// The first objecting denier denies the request
    pub deniers: Chain,
    /// Objections are logged against approved requests
    pub warners: Chain,
}

/// Backoff between decision attempts that hit a write conflict
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    /// Status writes attempted before giving up
    pub max_attempts: u32,
    /// Delay before the first refetch
    pub initial_delay: Duration,
    /// Upper bound of the doubling delay
    pub max_delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ConflictRetry {
    /// Default backoff with a different attempt budget
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay after the `attempt`th conflict (1-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// A non-blocking objection raised against an approved request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Warning {
    /// Registered name of the warner
    pub warner: String,
    /// Its verdict
    pub message: String,
}

/// What happened to a delivered request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The request already carried a decision; only deletion was scheduled
    AlreadyDecided,
    /// A filter excluded the request; nothing was written
    Filtered {
        /// Registered name of the filter
        filter: String,
        /// Its verdict
        message: String,
    },
    /// The request was denied
    Denied {
        /// Registered name of the denier, also the condition reason
        denier: String,
        /// Its verdict, also the condition message
        message: String,
    },
    /// The request was approved
    Approved {
        /// Objections raised by warners
        warnings: Vec<Warning>,
    },
}

impl Outcome {
    /// Whether the request now carries a decision
    #[must_use]
    pub fn is_decided(&self) -> bool {
        !matches!(self, Outcome::Filtered { .. })
    }
}

/// Whether `request` already carries any condition
///
/// A request holds at most one condition, so any condition at all means it was
/// decided, whoever wrote it.
#[must_use]
pub fn is_decided(request: &CertificateSigningRequest) -> bool {
    request
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| !conditions.is_empty())
}

/// Runs delivered requests through the configured chains and records decisions
pub struct Approver {
    policy: Policy,
    cluster: Arc<dyn ClusterRead>,
    requests: Arc<dyn SigningRequests>,
    scheduler: DeletionScheduler,
    delete_after: Duration,
    retry: ConflictRetry,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl Approver {
    /// Approver reading through `cluster` and writing through `requests`
    #[must_use]
    pub fn new(
        policy: Policy,
        cluster: Arc<dyn ClusterRead>,
        requests: Arc<dyn SigningRequests>,
    ) -> Self {
        Self {
            policy,
            cluster,
            scheduler: DeletionScheduler::new(requests.clone()),
            requests,
            delete_after: Duration::from_mins(1),
            retry: ConflictRetry::default(),
            diagnostics: Arc::default(),
        }
    }

    /// Delay between a decision and the deletion of the request
    #[must_use]
    pub fn delete_after(mut self, delay: Duration) -> Self {
        self.delete_after = delay;
        self
    }

    /// Backoff used when decision writes conflict
    #[must_use]
    pub fn conflict_retry(mut self, retry: ConflictRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Shares decision counts with the diagnostics server
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<RwLock<Diagnostics>>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// The deletion scheduler fed by this approver
    #[must_use]
    pub fn scheduler(&self) -> &DeletionScheduler {
        &self.scheduler
    }

    /// Decides a delivered request.
    ///
    /// A write rejected by a concurrent modification restarts the decision on
    /// a freshly read object, up to the configured attempt budget.
    ///
    /// # Errors
    ///
    /// Fails when an inspector cannot reach a verdict or the decision cannot
    /// be written; the request is then left pending.
    #[instrument(skip(self, request), fields(
        request_name = %request.name_any(),
        username = request.spec.username.as_deref().unwrap_or_default(),
    ))]
    pub async fn handle(&self, request: CertificateSigningRequest) -> Result<Outcome> {
        let result = self.decide(request).await;
        if let Err(e) = &result {
            let mut diagnostics = self.diagnostics.write().await;
            DecisionCounts::bump(&mut diagnostics.decisions.errored, e.stage());
        }
        result
    }

    async fn decide(&self, mut request: CertificateSigningRequest) -> Result<Outcome> {
        let name = request
            .metadata
            .name
            .clone()
            .ok_or_else(|| "Object has a missing name".to_string())?;
        let mut conflicts = 0;

        loop {
            if is_decided(&request) {
                debug!("request already decided");
                self.scheduler.schedule(self.delete_after, &name).await;
                return Ok(Outcome::AlreadyDecided);
            }

            let outcome = self.evaluate(&request).await?;
            let decision = match &outcome {
                Outcome::Filtered { filter, message } => {
                    info!(filter = %filter, message = %message, "skipping request");
                    self.record(&outcome).await;
                    return Ok(outcome);
                }
                Outcome::Denied { denier, message } => condition(DENIED, denier, message),
                _ => condition(APPROVED, APPROVED_REASON, APPROVED_MESSAGE),
            };

            request
                .status
                .get_or_insert_with(CertificateSigningRequestStatus::default)
                .conditions
                .get_or_insert_with(Vec::new)
                .push(decision);

            match self.requests.update_approval(&request).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts >= self.retry.max_attempts {
                        return Err(Error::ConflictRetriesExhausted(conflicts));
                    }
                    let delay = self.retry.delay(conflicts);
                    warn!(
                        attempt = conflicts,
                        delay_ms = delay.as_millis(),
                        "request modified concurrently, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    request = self.requests.get(&name).await.map_err(Error::Refetch)?;
                    continue;
                }
                Err(e) => return Err(Error::Update(e)),
            }

            match &outcome {
                Outcome::Denied { denier, message } => {
                    info!(denier = %denier, message = %message, "denied request");
                }
                _ => info!("approved request"),
            }
            self.record(&outcome).await;
            self.scheduler.schedule(self.delete_after, &name).await;
            return Ok(outcome);
        }
    }

    /// Runs the chains; the outcome is not yet written.
    async fn evaluate(&self, request: &CertificateSigningRequest) -> Result<Outcome> {
        let cluster = self.cluster.as_ref();

        for link in self.policy.filters.iter() {
            let verdict = link
                .inspector()
                .inspect(cluster, request)
                .await
                .map_err(|source| Error::Inspector {
                    name: link.name().to_string(),
                    source,
                })?;
            if let Some(message) = verdict {
                return Ok(Outcome::Filtered {
                    filter: link.name().to_string(),
                    message,
                });
            }
        }

        for link in self.policy.deniers.iter() {
            let verdict = link
                .inspector()
                .inspect(cluster, request)
                .await
                .map_err(|source| Error::Inspector {
                    name: link.name().to_string(),
                    source,
                })?;
            if let Some(message) = verdict {
                return Ok(Outcome::Denied {
                    denier: link.name().to_string(),
                    message,
                });
            }
        }

        let mut warnings = Vec::new();
        for link in self.policy.warners.iter() {
            match link.inspector().inspect(cluster, request).await {
                Ok(Some(message)) => {
                    warn!(warner = link.name(), message = %message, "approving despite warning");
                    warnings.push(Warning {
                        warner: link.name().to_string(),
                        message,
                    });
                }
                Ok(None) => {}
                Err(e) => debug!(warner = link.name(), error = %e, "ignoring warner failure"),
            }
        }

        Ok(Outcome::Approved { warnings })
    }

    async fn record(&self, outcome: &Outcome) {
        let mut diagnostics = self.diagnostics.write().await;
        let counts = &mut diagnostics.decisions;
        match outcome {
            Outcome::AlreadyDecided => return,
            Outcome::Filtered { filter, .. } => DecisionCounts::bump(&mut counts.filtered, filter),
            Outcome::Denied { denier, .. } => DecisionCounts::bump(&mut counts.denied, denier),
            Outcome::Approved { warnings } => {
                counts.approved += 1;
                for warning in warnings {
                    DecisionCounts::bump(&mut counts.warned, &warning.warner);
                }
            }
        }
        if outcome.is_decided() {
            diagnostics.last_event = Utc::now();
        }
    }
}

fn condition(type_: &str, reason: &str, message: &str) -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_update_time: Some(Time(Utc::now())),
        ..CertificateSigningRequestCondition::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_backoff_doubles_up_to_the_cap() {
        let retry = ConflictRetry::default();

        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(6), Duration::from_millis(3200));
        assert_eq!(retry.delay(7), Duration::from_secs(5));
        assert_eq!(retry.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn any_condition_counts_as_decided() {
        let mut request = CertificateSigningRequest::default();
        assert!(!is_decided(&request));

        request.status = Some(CertificateSigningRequestStatus {
            conditions: Some(vec![]),
            ..CertificateSigningRequestStatus::default()
        });
        assert!(!is_decided(&request));

        request.status = Some(CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "SomethingElse".to_string(),
                status: "True".to_string(),
                ..CertificateSigningRequestCondition::default()
            }]),
            ..CertificateSigningRequestStatus::default()
        });
        assert!(is_decided(&request));

        for type_ in [APPROVED, DENIED, FAILED] {
            request.status = Some(CertificateSigningRequestStatus {
                conditions: Some(vec![condition(type_, "x", "y")]),
                ..CertificateSigningRequestStatus::default()
            });
            assert!(is_decided(&request), "{type_}");
        }
    }
}
