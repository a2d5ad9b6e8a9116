use std::sync::Arc;
use std::time::Duration;

use crate::approver::{Approver, Outcome};
use crate::cluster::KubeCluster;
use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::{Error, Result, lease, telemetry};
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::Controller;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher::Config;
use kube::{Api, Resource, ResourceExt};
use kube::{Client, runtime::controller::Action};
use tokio::sync::{RwLock, watch};
use tracing::{Span, debug, error, field, info, instrument};

/// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Decision pipeline
    pub approver: Arc<Approver>,
    /// Kubernetes event emitter
    pub recorder: Recorder,
    /// Whether this replica currently holds the lease
    pub leader: watch::Receiver<bool>,
    /// Requeue interval of undecided requests
    pub resync: Duration,
}

/// Holds the state of the whole application
#[derive(Clone, Default)]
pub struct State {
    /// Atomic lock for kubernetes diagnostics
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// Getter for diagnostics with read lock
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Converts the application state to controller context
    ///
    /// # Errors
    ///
    /// Fails when the configured inspector chains cannot be resolved
    pub async fn to_ctrl_context(
        &self,
        client: Client,
        settings: &Settings,
        leader: watch::Receiver<bool>,
    ) -> Result<Arc<Context>> {
        let policy = settings.policy()?;
        info!(
            filters = %policy.filters,
            deniers = %policy.deniers,
            warners = %policy.warners,
            "inspector chains configured"
        );

        let cluster = Arc::new(KubeCluster::new(client.clone()));
        let approver = Approver::new(policy, cluster.clone(), cluster)
            .delete_after(settings.delete_after)
            .conflict_retry(settings.conflict_retry())
            .diagnostics(self.diagnostics.clone());

        Ok(Arc::new(Context {
            approver: Arc::new(approver),
            recorder: self.diagnostics.read().await.recorder(client),
            leader,
            resync: settings.resync,
        }))
    }
}

/// Initialize the controller and shared state
///
/// # Errors
///
/// Fails when no kube client can be built or the configuration is invalid
#[instrument(skip(state, settings))]
pub async fn run(state: State, settings: Settings) -> Result<()> {
    info!("initializing csrgate controller");

    let client = Client::try_default().await?;
    info!("kubernetes client initialized successfully");

    let (leader_tx, leader_rx) = watch::channel(false);
    tokio::spawn(lease::run_leader_election(client.clone(), leader_tx));

    let ctx = state.to_ctrl_context(client.clone(), &settings, leader_rx).await?;
    let requests = Api::<CertificateSigningRequest>::all(client);

    Controller::new(requests, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    info!("controller shutdown complete");
    Ok(())
}

/// Requeue policy for a successfully handled request
fn action_for(outcome: &Outcome, resync: Duration) -> Action {
    if outcome.is_decided() {
        Action::await_change()
    } else {
        Action::requeue(resync)
    }
}

#[instrument(skip(request, ctx), fields(
    request_name = %request.name_any(),
    username = request.spec.username.as_deref(),
    signer = %request.spec.signer_name,
    trace_id = field::Empty,
))]
#[allow(clippy::needless_pass_by_value)]
async fn reconcile(request: Arc<CertificateSigningRequest>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }

    if !*ctx.leader.borrow() {
        debug!("not the leader, skipping");
        return Ok(Action::requeue(ctx.resync));
    }

    let oref = request.object_ref(&());
    let outcome = ctx.approver.handle(request.as_ref().clone()).await?;

    match &outcome {
        Outcome::Denied { denier, message } => {
            publish_event(
                &ctx.recorder,
                EventType::Warning,
                "Denied",
                "Decide",
                Some(format!("Denied by {denier}: {message}")),
                &oref,
            )
            .await;
        }
        Outcome::Approved { warnings } => {
            let note = warnings
                .iter()
                .map(|w| format!("{}: {}", w.warner, w.message))
                .collect::<Vec<_>>();
            publish_event(
                &ctx.recorder,
                EventType::Normal,
                "Approved",
                "Decide",
                (!note.is_empty()).then(|| format!("Approved despite {}", note.join("; "))),
                &oref,
            )
            .await;
        }
        Outcome::AlreadyDecided | Outcome::Filtered { .. } => {}
    }

    Ok(action_for(&outcome, ctx.resync))
}

#[instrument(skip(request, err, ctx), fields(
    request_name = %request.name_any(),
    stage = err.stage(),
))]
#[allow(clippy::needless_pass_by_value)]
fn error_policy(request: Arc<CertificateSigningRequest>, err: &Error, ctx: Arc<Context>) -> Action {
    let err_msg = err.to_string();

    error!(
        error = %err_msg,
        requeue_after_secs = ctx.resync.as_secs(),
        "decision failed, leaving request pending"
    );

    let recorder = ctx.recorder.clone();
    let oref = request.object_ref(&());

    tokio::spawn(async move {
        publish_event(
            &recorder,
            EventType::Warning,
            "DecisionFailed",
            "Decide",
            Some(format!("Error: {err_msg}")),
            &oref,
        )
        .await;
    });

    Action::requeue(ctx.resync)
}

/// Helper function to publish a Kubernetes event
async fn publish_event(
    recorder: &Recorder,
    event_type: EventType,
    reason: impl Into<String>,
    action: impl Into<String>,
    note: Option<String>,
    oref: &ObjectReference,
) {
    if let Err(e) = recorder
        .publish(
            &Event {
                type_: event_type,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            oref,
        )
        .await
    {
        debug!(error = %e, "failed to publish event");
    }
}
