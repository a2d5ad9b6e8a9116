use std::collections::BTreeMap;

use k8s_openapi::chrono::{DateTime, Utc};
use kube::{
    Client,
    runtime::events::{Recorder, Reporter},
};
use serde::Serialize;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    /// Last time a request was approved or denied
    pub last_event: DateTime<Utc>,
    /// Outcome counters
    pub decisions: DecisionCounts,
    /// Kubernetes event reporter
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            decisions: DecisionCounts::default(),
            reporter: "csrgate".into(),
        }
    }
}

impl Diagnostics {
    /// Creates a new recorder wrapper around self
    #[must_use]
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Decision counts, labeled by the inspector or stage responsible
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    /// Approved requests
    pub approved: u64,
    /// Denied requests by denier
    pub denied: BTreeMap<String, u64>,
    /// Skipped requests by filter
    pub filtered: BTreeMap<String, u64>,
    /// Warnings raised on approved requests by warner
    pub warned: BTreeMap<String, u64>,
    /// Abandoned decisions by failing stage
    pub errored: BTreeMap<String, u64>,
}

impl DecisionCounts {
    /// Bumps `label` in one of the labeled counters
    pub fn bump(counter: &mut BTreeMap<String, u64>, label: &str) {
        *counter.entry(label.to_string()).or_default() += 1;
    }
}
