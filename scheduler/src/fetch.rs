// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading the current upgrade policies of an instance's clusters

use slog::{Logger, debug, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use upgrade_scheduler_interface::Gateway;
use upgrade_scheduler_planning::planner::{CurrentState, MultiplePoliciesError};
use upgrade_scheduler_types::ids::ClusterName;

#[derive(Debug, Error, SlogInlineError)]
pub enum FetchError {
    #[error("current state is inconsistent")]
    MultiplePolicies(#[from] MultiplePoliciesError),
    #[error("fetch task failed")]
    Join(#[from] JoinError),
    #[error("fetching current state was cancelled")]
    Cancelled,
}

/// Asks the gateway for the current policies of every one of `clusters`,
/// with at most `max_parallelism` requests in flight
///
/// A cluster whose request fails is recorded as unknown.  More than one
/// policy for a cluster fails the whole fetch.
pub async fn fetch_current_state(
    log: &Logger,
    gateway: &Arc<dyn Gateway>,
    clusters: impl IntoIterator<Item = ClusterName>,
    max_parallelism: usize,
    cancel: &CancellationToken,
) -> Result<CurrentState, FetchError> {
    let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
    let mut tasks = JoinSet::new();
    for cluster in clusters {
        let semaphore = Arc::clone(&semaphore);
        let gateway = Arc::clone(gateway);
        tasks.spawn(async move {
            // Hold the permit until the request finishes.  The semaphore is
            // never closed, so acquiring only waits.
            let _permit = semaphore.acquire_owned().await;
            let result = gateway.current_policies(&cluster).await;
            (cluster, result)
        });
    }

    let mut current = CurrentState::new();
    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                return Err(FetchError::Cancelled);
            }
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };

        let (cluster, result) = joined?;
        match result {
            Ok(policies) => {
                debug!(
                    log, "fetched current policies";
                    "cluster" => &cluster,
                    "policies" => policies.len(),
                );
                current.insert(cluster, policies)?;
            }
            Err(err) => {
                warn!(
                    log, "failed to fetch current policies; \
                          treating cluster as busy for this pass";
                    "cluster" => &cluster,
                    InlineErrorChain::new(&err)
                );
                current.mark_unknown(cluster);
            }
        }
    }
    Ok(current)
}
