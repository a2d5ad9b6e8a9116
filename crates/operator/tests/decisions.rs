//! Decision scenarios against in-memory cluster collaborators
#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use csrgate::approver::{APPROVED, Approver, ConflictRetry, DENIED, Outcome, Policy, Warning};
use csrgate::cluster::SigningRequests;
use csrgate::{Diagnostics, Error};
use csrgate_policy::testing::{CsrBuilder, FakeCluster, pod, signing_request};
use csrgate_policy::{
    Chain, ClusterError, ClusterRead, ConfigError, Inspector, InspectorSpec, Registry,
};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
    CertificateSigningRequestStatus,
};
use tokio::sync::RwLock;

const CN: &str = "172-1-0-3.ns.pod.cluster.local";
const OWNER: &str = "system:serviceaccount:ns:someserviceaccount";

/// Stores a single request and fails the next `conflicts` approval writes
#[derive(Default)]
struct FakeRequests {
    stored: Mutex<Option<CertificateSigningRequest>>,
    conflicts: AtomicUsize,
    failing_update: bool,
    failing_get: bool,
    updates: Mutex<Vec<CertificateSigningRequest>>,
    deletes: Mutex<Vec<String>>,
}

impl FakeRequests {
    fn holding(request: &CertificateSigningRequest) -> Self {
        Self {
            stored: Mutex::new(Some(request.clone())),
            ..Self::default()
        }
    }

    fn conflicting(self, times: usize) -> Self {
        self.conflicts.store(times, Ordering::SeqCst);
        self
    }

    fn failing_update(mut self) -> Self {
        self.failing_update = true;
        self
    }

    fn failing_get(mut self) -> Self {
        self.failing_get = true;
        self
    }

    fn stored(&self) -> CertificateSigningRequest {
        self.stored.lock().unwrap().clone().expect("stored request")
    }

    fn updates(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SigningRequests for FakeRequests {
    async fn get(&self, _name: &str) -> Result<CertificateSigningRequest, ClusterError> {
        if self.failing_get {
            return Err(unavailable());
        }
        Ok(self.stored())
    }

    async fn update_approval(
        &self,
        request: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, ClusterError> {
        self.updates.lock().unwrap().push(request.clone());
        if self.failing_update {
            return Err(unavailable());
        }

        let conflicting = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicting {
            // a third party touched the object in the meantime
            let mut stored = self.stored.lock().unwrap();
            if let Some(stored) = stored.as_mut() {
                stored.metadata.resource_version = Some("2".to_string());
            }
            return Err(ClusterError::Conflict(
                "the object has been modified".to_string(),
            ));
        }

        *self.stored.lock().unwrap() = Some(request.clone());
        Ok(request.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        self.deletes.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

fn unavailable() -> ClusterError {
    ClusterError::KubeError(kube::Error::Service("apiserver unavailable".into()))
}

/// Returns a fixed verdict and counts its invocations
#[derive(Debug)]
struct Probe {
    verdict: Result<Option<String>, ()>,
    calls: Arc<AtomicUsize>,
}

impl Probe {
    fn new(verdict: Result<Option<&str>, ()>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(Self {
            verdict: verdict.map(|v| v.map(ToString::to_string)),
            calls: calls.clone(),
        });
        (probe, calls)
    }
}

#[async_trait]
impl Inspector for Probe {
    fn configure(self: Arc<Self>, _config: &str) -> Result<Arc<dyn Inspector>, ConfigError> {
        Ok(self)
    }

    async fn inspect(
        &self,
        _client: &dyn ClusterRead,
        _request: &CertificateSigningRequest,
    ) -> Result<Option<String>, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
            .clone()
            .map_err(|()| ClusterError::KubeError(kube::Error::Service("probe failed".into())))
    }
}

fn chain(registry: &Registry, names: &[&str]) -> Chain {
    let specs = names
        .iter()
        .map(|name| name.parse::<InspectorSpec>().unwrap())
        .collect::<Vec<_>>();
    Chain::from_specs(registry, &specs).unwrap()
}

fn pod_policy() -> Policy {
    let registry = Registry::builtin("cluster.local").unwrap();
    Policy {
        filters: Chain::default(),
        deniers: chain(&registry, &["subjectispodforuser", "altnamesforpod"]),
        warners: chain(&registry, &["minrsakeysize"]),
    }
}

fn pod_cluster() -> Arc<FakeCluster> {
    Arc::new(FakeCluster::new().with_pod(pod("web", "ns", "172.1.0.3", &[])))
}

fn pod_request(builder: CsrBuilder) -> CertificateSigningRequest {
    signing_request("pod-csr", OWNER, &builder.pem())
}

fn conditions(request: &CertificateSigningRequest) -> Vec<CertificateSigningRequestCondition> {
    request
        .status
        .as_ref()
        .and_then(|status| status.conditions.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn approves_a_pod_requesting_its_own_names() {
    let request = pod_request(CsrBuilder::new(CN).dns_name(CN).ip("172.1.0.3"));
    let requests = Arc::new(FakeRequests::holding(&request));
    let approver = Approver::new(pod_policy(), pod_cluster(), requests.clone());

    let outcome = approver.handle(request).await.unwrap();

    assert_eq!(outcome, Outcome::Approved { warnings: vec![] });
    let conditions = conditions(&requests.stored());
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].type_, APPROVED);
    assert_eq!(conditions[0].status, "True");
    assert_eq!(conditions[0].reason.as_deref(), Some("AutoApproved"));
    assert!(approver.scheduler().is_scheduled("pod-csr").await);
}

#[tokio::test]
async fn denies_names_the_pod_may_not_claim() {
    let request = pod_request(
        CsrBuilder::new(CN)
            .dns_name(CN)
            .ip("172.1.0.3")
            .dns_name("evil.example.com"),
    );
    let requests = Arc::new(FakeRequests::holding(&request));
    let approver = Approver::new(pod_policy(), pod_cluster(), requests.clone());

    let outcome = approver.handle(request).await.unwrap();

    let message = "Subject Alt Name contains disallowed name: evil.example.com";
    assert_eq!(
        outcome,
        Outcome::Denied {
            denier: "altnamesforpod".to_string(),
            message: message.to_string(),
        }
    );
    let conditions = conditions(&requests.stored());
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].type_, DENIED);
    assert_eq!(conditions[0].reason.as_deref(), Some("altnamesforpod"));
    assert_eq!(conditions[0].message.as_deref(), Some(message));
}

#[tokio::test]
async fn filtering_the_same_request_writes_nothing() {
    let registry = Registry::builtin("cluster.local").unwrap();
    let policy = Policy {
        filters: chain(&registry, &["altnamesforpod"]),
        ..pod_policy()
    };
    let request = pod_request(CsrBuilder::new(CN).dns_name("evil.example.com"));
    let requests = Arc::new(FakeRequests::holding(&request));
    let approver = Approver::new(policy, pod_cluster(), requests.clone());

    let outcome = approver.handle(request).await.unwrap();

    assert!(matches!(outcome, Outcome::Filtered { ref filter, .. } if filter == "altnamesforpod"));
    assert_eq!(requests.updates(), 0);
    assert!(!approver.scheduler().is_scheduled("pod-csr").await);
}

#[tokio::test(start_paused = true)]
async fn redelivered_decisions_only_schedule_deletion() {
    let mut request = pod_request(CsrBuilder::new(CN));
    request.status = Some(CertificateSigningRequestStatus {
        conditions: Some(vec![CertificateSigningRequestCondition {
            type_: DENIED.to_string(),
            status: "True".to_string(),
            reason: Some("someone".to_string()),
            ..CertificateSigningRequestCondition::default()
        }]),
        ..CertificateSigningRequestStatus::default()
    });
    let requests = Arc::new(FakeRequests::holding(&request));
    let approver = Approver::new(pod_policy(), pod_cluster(), requests.clone())
        .delete_after(Duration::from_secs(60));

    assert_eq!(approver.handle(request.clone()).await.unwrap(), Outcome::AlreadyDecided);
    assert_eq!(approver.handle(request).await.unwrap(), Outcome::AlreadyDecided);
    assert_eq!(requests.updates(), 0);
    assert!(approver.scheduler().is_scheduled("pod-csr").await);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(requests.deletes(), vec!["pod-csr".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn conflicts_refetch_and_append_a_single_condition() {
    let request = pod_request(CsrBuilder::new(CN).dns_name(CN));
    let requests = Arc::new(FakeRequests::holding(&request).conflicting(1));
    let approver = Approver::new(pod_policy(), pod_cluster(), requests.clone());

    let outcome = approver.handle(request).await.unwrap();

    assert_eq!(outcome, Outcome::Approved { warnings: vec![] });
    assert_eq!(requests.updates(), 2);
    let stored = requests.stored();
    assert_eq!(conditions(&stored).len(), 1);
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn conflicts_give_up_after_the_budget() {
    let request = pod_request(CsrBuilder::new(CN).dns_name(CN));
    let requests = Arc::new(FakeRequests::holding(&request).conflicting(usize::MAX));
    let diagnostics = Arc::new(RwLock::new(Diagnostics::default()));
    let approver = Approver::new(pod_policy(), pod_cluster(), requests.clone())
        .conflict_retry(ConflictRetry::with_max_attempts(3))
        .diagnostics(diagnostics.clone());

    let err = approver.handle(request).await.unwrap_err();

    assert!(matches!(err, Error::ConflictRetriesExhausted(3)));
    assert_eq!(requests.updates(), 3);
    assert_eq!(diagnostics.read().await.decisions.errored.get("conflict"), Some(&1));
    assert!(!approver.scheduler().is_scheduled("pod-csr").await);
}

#[tokio::test]
async fn failed_writes_are_not_retried() {
    let request = pod_request(CsrBuilder::new(CN).dns_name(CN));
    let requests = Arc::new(FakeRequests::holding(&request).failing_update());
    let diagnostics = Arc::new(RwLock::new(Diagnostics::default()));
    let approver = Approver::new(pod_policy(), pod_cluster(), requests.clone())
        .diagnostics(diagnostics.clone());

    let err = approver.handle(request).await.unwrap_err();

    assert!(matches!(err, Error::Update(ClusterError::KubeError(_))));
    assert_eq!(requests.updates(), 1);
    assert!(conditions(&requests.stored()).is_empty());
    assert!(!approver.scheduler().is_scheduled("pod-csr").await);
    let counts = diagnostics.read().await.decisions.clone();
    assert_eq!(counts.errored.get("updateApproval"), Some(&1));
    assert_eq!(counts.approved, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_refetch_after_conflict_leaves_the_request_pending() {
    let request = pod_request(CsrBuilder::new(CN).dns_name(CN));
    let requests = Arc::new(
        FakeRequests::holding(&request)
            .conflicting(1)
            .failing_get(),
    );
    let diagnostics = Arc::new(RwLock::new(Diagnostics::default()));
    let approver = Approver::new(pod_policy(), pod_cluster(), requests.clone())
        .diagnostics(diagnostics.clone());

    let err = approver.handle(request).await.unwrap_err();

    assert!(matches!(err, Error::Refetch(ClusterError::KubeError(_))));
    assert_eq!(requests.updates(), 1);
    assert!(conditions(&requests.stored()).is_empty());
    assert!(!approver.scheduler().is_scheduled("pod-csr").await);
    assert_eq!(diagnostics.read().await.decisions.errored.get("refetch"), Some(&1));
}

#[tokio::test]
async fn first_objecting_filter_short_circuits() {
    let mut registry = Registry::default();
    let (a, a_calls) = Probe::new(Ok(Some("out of scope")));
    let (b, b_calls) = Probe::new(Ok(Some("also out of scope")));
    let (denier, denier_calls) = Probe::new(Ok(None));
    registry.register("a", a).unwrap();
    registry.register("b", b).unwrap();
    registry.register("denier", denier).unwrap();
    let policy = Policy {
        filters: chain(&registry, &["a", "b"]),
        deniers: chain(&registry, &["denier"]),
        warners: Chain::default(),
    };
    let request = signing_request("csr", "someone", "");
    let requests = Arc::new(FakeRequests::holding(&request));
    let approver = Approver::new(policy, Arc::new(FakeCluster::new()), requests.clone());

    let outcome = approver.handle(request).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Filtered {
            filter: "a".to_string(),
            message: "out of scope".to_string(),
        }
    );
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(denier_calls.load(Ordering::SeqCst), 0);
    assert_eq!(requests.updates(), 0);
}

#[tokio::test]
async fn first_objecting_denier_wins() {
    let mut registry = Registry::default();
    let (a, a_calls) = Probe::new(Ok(Some("first")));
    let (b, b_calls) = Probe::new(Ok(Some("second")));
    let (warner, warner_calls) = Probe::new(Ok(Some("never asked")));
    registry.register("a", a).unwrap();
    registry.register("b", b).unwrap();
    registry.register("warner", warner).unwrap();
    let policy = Policy {
        filters: Chain::default(),
        deniers: chain(&registry, &["a", "b"]),
        warners: chain(&registry, &["warner"]),
    };
    let request = signing_request("csr", "someone", "");
    let requests = Arc::new(FakeRequests::holding(&request));
    let approver = Approver::new(policy, Arc::new(FakeCluster::new()), requests.clone());

    let outcome = approver.handle(request).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Denied {
            denier: "a".to_string(),
            message: "first".to_string(),
        }
    );
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(warner_calls.load(Ordering::SeqCst), 0);
    assert_eq!(conditions(&requests.stored())[0].reason.as_deref(), Some("a"));
}

#[tokio::test]
async fn warners_never_alter_the_decision() {
    let verdicts: [Result<Option<&str>, ()>; 3] = [Ok(None), Ok(Some("looks odd")), Err(())];

    for first in verdicts {
        for second in verdicts {
            let mut registry = Registry::default();
            let (one, one_calls) = Probe::new(first);
            let (two, two_calls) = Probe::new(second);
            registry.register("one", one).unwrap();
            registry.register("two", two).unwrap();
            let policy = Policy {
                warners: chain(&registry, &["one", "two"]),
                ..Policy::default()
            };
            let request = signing_request("csr", "someone", "");
            let requests = Arc::new(FakeRequests::holding(&request));
            let approver = Approver::new(policy, Arc::new(FakeCluster::new()), requests.clone());

            let outcome = approver.handle(request).await.unwrap();

            let expected = [("one", first), ("two", second)]
                .into_iter()
                .filter_map(|(warner, verdict)| {
                    verdict.ok().flatten().map(|message| Warning {
                        warner: warner.to_string(),
                        message: message.to_string(),
                    })
                })
                .collect::<Vec<_>>();
            assert_eq!(outcome, Outcome::Approved { warnings: expected });
            assert_eq!(conditions(&requests.stored())[0].type_, APPROVED);
            assert_eq!(one_calls.load(Ordering::SeqCst), 1);
            assert_eq!(two_calls.load(Ordering::SeqCst), 1);
        }
    }
}

#[tokio::test]
async fn inspector_failures_leave_the_request_pending() {
    let mut registry = Registry::default();
    let (broken, _) = Probe::new(Err(()));
    registry.register("broken", broken).unwrap();
    let policy = Policy {
        deniers: chain(&registry, &["broken"]),
        ..Policy::default()
    };
    let request = signing_request("csr", "someone", "");
    let requests = Arc::new(FakeRequests::holding(&request));
    let diagnostics = Arc::new(RwLock::new(Diagnostics::default()));
    let approver = Approver::new(policy, Arc::new(FakeCluster::new()), requests.clone())
        .diagnostics(diagnostics.clone());

    let err = approver.handle(request).await.unwrap_err();

    assert!(matches!(err, Error::Inspector { ref name, .. } if name == "broken"));
    assert_eq!(requests.updates(), 0);
    assert_eq!(diagnostics.read().await.decisions.errored.get("broken"), Some(&1));
}

#[tokio::test]
async fn decisions_are_counted() {
    let diagnostics = Arc::new(RwLock::new(Diagnostics::default()));
    let cluster = pod_cluster();

    let good = pod_request(CsrBuilder::new(CN).dns_name(CN).rsa());
    let approver = Approver::new(pod_policy(), cluster.clone(), Arc::new(FakeRequests::holding(&good)))
        .diagnostics(diagnostics.clone());
    approver.handle(good).await.unwrap();

    let bad = pod_request(CsrBuilder::new(CN).dns_name("evil.example.com"));
    let approver = Approver::new(pod_policy(), cluster, Arc::new(FakeRequests::holding(&bad)))
        .diagnostics(diagnostics.clone());
    approver.handle(bad).await.unwrap();

    let counts = diagnostics.read().await.decisions.clone();
    assert_eq!(counts.approved, 1);
    assert_eq!(counts.warned.get("minrsakeysize"), Some(&1));
    assert_eq!(counts.denied.get("altnamesforpod"), Some(&1));
    assert!(counts.filtered.is_empty());
}
