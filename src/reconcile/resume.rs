use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::controller::Controller;
use crate::error::AppResult;
use crate::model::Collection;

/// Re-subscribe every engine of every plan the store marks as running.
///
/// Safe to call repeatedly: engines already registered are skipped. Returns
/// how many engines were newly registered.
///
/// # Errors
///
/// Fails only when the running plans cannot be listed; per-plan failures are
/// logged.
pub async fn resume_on_boot(controller: &Controller) -> AppResult<usize> {
    let store = controller.store();
    let running_plans = store.running_plans().await?;
    let mut collections: HashMap<i64, Arc<Collection>> = HashMap::new();
    let mut registered: usize = 0;

    for running in running_plans {
        let collection = match collections.entry(running.collection_id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => match store.get_collection(running.collection_id).await {
                Ok(collection) => Arc::clone(entry.insert(Arc::new(collection))),
                Err(err) => {
                    tracing::warn!("Cannot resume collection {}: {}", running.collection_id, err);
                    continue;
                }
            },
        };
        let plan = match store
            .execution_plan(running.collection_id, running.plan_id)
            .await
        {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!("Cannot resume plan {}: {}", running.plan_id, err);
                continue;
            }
        };
        let run_id = match store.current_run(running.collection_id).await {
            Ok(Some(run_id)) => run_id,
            Ok(None) => {
                tracing::warn!(
                    "Plan {} is marked running but collection {} has no current run",
                    running.plan_id,
                    running.collection_id
                );
                continue;
            }
            Err(err) => {
                tracing::warn!("Cannot read run of collection {}: {}", running.collection_id, err);
                continue;
            }
        };
        match controller
            .plan_controller(collection, plan)
            .subscribe(run_id)
            .await
        {
            Ok(count) => registered = registered.saturating_add(count),
            Err(err) => tracing::warn!("Resuming plan {} failed: {}", running.plan_id, err),
        }
    }

    tracing::info!("Resumed streams of {} engines", registered);
    Ok(registered)
}
