use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::controller::Controller;
use crate::model::RunHistory;

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Whether a deployment launched at `launch_time` has been idle past `threshold`.
///
/// A young launch is never stale and a collection that never ran is stale
/// once old enough. A run that is still open, or ended within the threshold,
/// keeps the collection fresh.
#[must_use]
pub fn is_collection_stale(
    last_run: Option<&RunHistory>,
    launch_time: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    if age(launch_time, now) < threshold {
        return false;
    }
    match last_run {
        None => true,
        Some(RunHistory {
            end_time: Some(end_time),
            ..
        }) => age(*end_time, now) >= threshold,
        Some(_) => false,
    }
}

async fn stale(controller: &Controller, collection_id: i64, launch_time: DateTime<Utc>, threshold: Duration) -> bool {
    match controller.store().last_run(collection_id).await {
        Ok(last_run) => is_collection_stale(last_run.as_ref(), launch_time, Utc::now(), threshold),
        Err(err) => {
            tracing::warn!("Reading last run of collection {} failed: {}", collection_id, err);
            false
        }
    }
}

/// Purge stale collections, then stale node pools; returns how many were removed.
pub(super) async fn purge_pass(controller: &Controller, threshold: Duration, on_demand: bool) -> usize {
    let scheduler = controller.scheduler();
    let mut purged: usize = 0;

    let mut deployed = match scheduler.deployed_collections().await {
        Ok(deployed) => deployed,
        Err(err) => {
            tracing::error!("Listing deployed collections failed: {}", err);
            return purged;
        }
    };
    let launches: Vec<_> = deployed.iter().map(|(id, launch)| (*id, *launch)).collect();
    for (collection_id, launch_time) in launches {
        if !stale(controller, collection_id, launch_time, threshold).await {
            continue;
        }
        tracing::info!("Collection {} is idle, purging", collection_id);
        match controller.term_and_purge_collection(collection_id).await {
            Ok(()) => {
                deployed.remove(&collection_id);
                purged = purged.saturating_add(1);
            }
            Err(err) => tracing::warn!("Purging collection {} failed: {}", collection_id, err),
        }
    }

    if !on_demand || !scheduler.supports_node_pools() {
        return purged;
    }
    let pools = match scheduler.node_pools().await {
        Ok(pools) => pools,
        Err(err) => {
            tracing::error!("Listing node pools failed: {}", err);
            return purged;
        }
    };
    for (collection_id, pool) in pools {
        // Pools under a deployed collection stay, ready or not.
        if deployed.contains_key(&collection_id) {
            continue;
        }
        if !stale(controller, collection_id, pool.launch_time, threshold).await {
            continue;
        }
        match scheduler.purge_node_pool(collection_id).await {
            Ok(()) => {
                tracing::info!("Node pool of collection {} ({} nodes) is purged", collection_id, pool.size);
                purged = purged.saturating_add(1);
            }
            Err(err) => tracing::warn!("Purging node pool of {} failed: {}", collection_id, err),
        }
    }
    purged
}
