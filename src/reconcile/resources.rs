use crate::controller::Controller;

/// Refresh cpu and mem gauges of every engine in every deployed collection.
pub(super) async fn resources_pass(controller: &Controller) {
    let deployed = match controller.scheduler().deployed_collections().await {
        Ok(deployed) => deployed,
        Err(err) => {
            tracing::warn!("Listing deployed collections failed: {}", err);
            return;
        }
    };
    for collection_id in deployed.into_keys() {
        let plans = match controller.store().execution_plans(collection_id).await {
            Ok(plans) => plans,
            Err(err) => {
                tracing::debug!("No plans for collection {}: {}", collection_id, err);
                continue;
            }
        };
        for plan in plans {
            let usage = match controller
                .scheduler()
                .pods_metrics(collection_id, plan.plan_id)
                .await
            {
                Ok(usage) => usage,
                Err(err) => {
                    tracing::debug!("No pod metrics for plan {}: {}", plan.plan_id, err);
                    continue;
                }
            };
            for (engine_no, resources) in usage {
                let cpu = resources.get("cpu").copied().unwrap_or(0.0);
                let mem = resources.get("mem").copied().unwrap_or(0.0);
                controller
                    .sink()
                    .record_resource_usage(collection_id, plan.plan_id, &engine_no, cpu, mem);
            }
        }
    }
}
