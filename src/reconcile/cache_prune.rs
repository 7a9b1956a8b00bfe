use crate::controller::Controller;

/// Drop the series of runs that have finished; returns how many runs were dropped.
pub(super) async fn prune_pass(controller: &Controller) -> usize {
    let sink = controller.sink();
    let mut pruned: usize = 0;
    for (run_id, collection_id) in sink.cached_runs() {
        match controller.store().get_run(run_id).await {
            Ok(run) if run.end_time.is_some() => {
                sink.delete_run(run_id);
                tracing::info!("Deleted metrics of run {} (collection {})", run_id, collection_id);
                pruned = pruned.saturating_add(1);
            }
            Ok(_) => {}
            Err(err) => tracing::debug!("Keeping metrics of run {}: {}", run_id, err),
        }
    }
    pruned
}
