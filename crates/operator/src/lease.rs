// Copyright 2026 Csrgate Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Leader election components, using the k8s lease pattern.
//! <https://kubernetes.io/docs/concepts/architecture/leases/>
//!
//! Only the leader writes decisions; other replicas keep watching so they can
//! take over when the lease expires.

use std::{env, time::Duration};

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::{sync::watch, time::sleep};
use tracing::{error, info};

/// Name of the Lease object contended for
pub const LEASE_NAME: &str = "csrgate-lease";

const LEASE_TTL: Duration = Duration::from_secs(15);
const RENEW_EVERY: Duration = Duration::from_secs(5);

/// Contends for the lease in the client's default namespace using HOSTNAME as
/// the holder id, publishing leadership changes through `leader_tx`.
///
/// Returns once every receiver has been dropped.
pub async fn run_leader_election(client: Client, leader_tx: watch::Sender<bool>) {
    let holder_id = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let namespace = client.default_namespace().to_string();

    let leadership = LeaseLock::new(
        client,
        &namespace,
        LeaseLockParams {
            holder_id: holder_id.clone(),
            lease_name: LEASE_NAME.into(),
            lease_ttl: LEASE_TTL,
        },
    );

    while !leader_tx.is_closed() {
        match leadership.try_acquire_or_renew().await {
            Ok(ll) => {
                leader_tx.send_if_modified(|leading| {
                    if *leading == ll.acquired_lease {
                        return false;
                    }
                    info!(%holder_id, leading = ll.acquired_lease, "leadership changed");
                    *leading = ll.acquired_lease;
                    true
                });
            }
            Err(err) => error!(error = %err, "failed to acquire lease lock"),
        }

        sleep(RENEW_EVERY).await;
    }
}
