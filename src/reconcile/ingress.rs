use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::controller::Controller;
use crate::error::StoreError;
use crate::model::DeployedCollections;

/// Last known use of each exposed project, kept across passes.
pub(super) type LastUsed = HashMap<i64, DateTime<Utc>>;

/// Latest use per project: a deployed collection's launch, or the end of its
/// last run (an open run counts as `now`).
async fn project_activity(
    controller: &Controller,
    deployed: DeployedCollections,
    now: DateTime<Utc>,
) -> Result<HashMap<i64, DateTime<Utc>>, StoreError> {
    let store = controller.store();
    let mut activity: HashMap<i64, DateTime<Utc>> = HashMap::new();
    for (collection_id, launch_time) in deployed {
        let collection = store.get_collection(collection_id).await?;
        let ran = store
            .last_run(collection_id)
            .await?
            .map(|run| run.end_time.unwrap_or(now));
        let used = ran.map_or(launch_time, |ran| ran.max(launch_time));
        activity
            .entry(collection.project_id)
            .and_modify(|latest| *latest = (*latest).max(used))
            .or_insert(used);
    }
    Ok(activity)
}

/// Remove the ingress of projects unused for longer than `lifespan`.
pub(super) async fn ingress_pass(
    controller: &Controller,
    lifespan: Duration,
    last_used: &mut LastUsed,
    now: DateTime<Utc>,
) -> usize {
    let scheduler = controller.scheduler();
    let exposed = match scheduler.exposed_projects().await {
        Ok(exposed) => exposed,
        Err(err) => {
            tracing::warn!("Listing project ingress failed: {}", err);
            return 0;
        }
    };
    last_used.retain(|project_id, _| exposed.contains_key(project_id));
    if exposed.is_empty() {
        return 0;
    }
    let deployed = match scheduler.deployed_collections().await {
        Ok(deployed) => deployed,
        Err(err) => {
            tracing::warn!("Listing deployed collections failed: {}", err);
            return 0;
        }
    };
    let activity = match project_activity(controller, deployed, now).await {
        Ok(activity) => activity,
        Err(err) => {
            tracing::warn!("Reading project activity failed: {}", err);
            return 0;
        }
    };

    let mut purged: usize = 0;
    for (project_id, created_at) in exposed {
        let used = [last_used.get(&project_id), activity.get(&project_id)]
            .into_iter()
            .flatten()
            .fold(created_at, |latest, seen| latest.max(*seen));
        last_used.insert(project_id, used);
        let idle = now
            .signed_duration_since(used)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if idle <= lifespan {
            continue;
        }
        tracing::info!("Project {} was last used at {}, purging its ingress", project_id, used);
        match scheduler.purge_project_ingress(project_id).await {
            Ok(()) => {
                last_used.remove(&project_id);
                purged = purged.saturating_add(1);
            }
            Err(err) => tracing::warn!("Purging ingress of project {} failed: {}", project_id, err),
        }
    }
    purged
}
