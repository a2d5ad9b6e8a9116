//! Delayed, deduplicated deletion of decided requests

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};

use crate::cluster::SigningRequests;

/// Deletes requests some time after they were decided.
///
/// At most one timer is outstanding per request name; the set of scheduled
/// names is only held locked for membership updates, never across the timer
/// or the delete call.
#[derive(Clone)]
pub struct DeletionScheduler {
    requests: Arc<dyn SigningRequests>,
    scheduled: Arc<Mutex<HashSet<String>>>,
}

impl DeletionScheduler {
    /// Scheduler deleting through `requests`
    #[must_use]
    pub fn new(requests: Arc<dyn SigningRequests>) -> Self {
        Self {
            requests,
            scheduled: Arc::default(),
        }
    }

    /// Arms a timer deleting `name` after `delay`, unless one is already armed.
    ///
    /// Returns whether a new timer was armed. Deletion failures are logged and
    /// not retried.
    pub async fn schedule(&self, delay: Duration, name: &str) -> bool {
        let mut scheduled = self.scheduled.lock().await;
        if !scheduled.insert(name.to_string()) {
            return false;
        }

        let this = self.clone();
        let name = name.to_string();
        let span = info_span!("delete_request", request_name = %name);
        tokio::spawn(
            async move {
                sleep(delay).await;
                match this.requests.delete(&name).await {
                    Ok(()) => info!("deleted request"),
                    Err(e) => error!(error = %e, "failed to delete request"),
                }
                this.scheduled.lock().await.remove(&name);
            }
            .instrument(span),
        );

        true
    }

    /// Whether a deletion of `name` is outstanding
    pub async fn is_scheduled(&self, name: &str) -> bool {
        self.scheduled.lock().await.contains(name)
    }
}
