use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::controller::Controller;
use crate::error::AppError;
use crate::model::{Collection, ExecutionPlan};
use crate::shutdown::{ShutdownReceiver, ShutdownSender};

/// Plans queued per worker before the producer waits.
const QUEUE_PER_WORKER: usize = 16;

#[derive(Debug)]
pub(super) struct CheckItem {
    collection: Arc<Collection>,
    plan: ExecutionPlan,
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<CheckItem>>>;

pub(super) fn spawn(
    controller: &Controller,
    interval: Duration,
    workers: usize,
    shutdown_tx: &ShutdownSender,
) -> Vec<JoinHandle<()>> {
    let workers = workers.max(1);
    let (queue_tx, queue_rx) = mpsc::channel(workers.saturating_mul(QUEUE_PER_WORKER));
    let queue: SharedQueue = Arc::new(Mutex::new(queue_rx));

    let mut handles: Vec<JoinHandle<()>> = (0..workers)
        .map(|worker| {
            let controller = controller.clone();
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(item) = next_item(&queue).await {
                    check_plan(&controller, item).await;
                }
                tracing::debug!("Check worker {} stopped", worker);
            })
        })
        .collect();
    handles.push(tokio::spawn(refill(
        controller.clone(),
        interval,
        queue_tx,
        shutdown_tx.subscribe(),
    )));
    handles
}

async fn next_item(queue: &SharedQueue) -> Option<CheckItem> {
    queue.lock().await.recv().await
}

/// Queue every running plan once per tick; a tick is skipped while the
/// previous batch is still being drained.
async fn refill(
    controller: Controller,
    interval: Duration,
    queue_tx: mpsc::Sender<CheckItem>,
    mut shutdown_rx: ShutdownReceiver,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if queue_tx.capacity() < queue_tx.max_capacity() {
                    continue;
                }
                for item in running_items(&controller).await {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            tracing::info!("Check-running loop stopped");
                            return;
                        }
                        sent = queue_tx.send(item) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
    tracing::info!("Check-running loop stopped");
}

/// Running plans resolved against a per-pass collection cache.
pub(super) async fn running_items(controller: &Controller) -> Vec<CheckItem> {
    let store = controller.store();
    let running_plans = match store.running_plans().await {
        Ok(running_plans) => running_plans,
        Err(err) => {
            tracing::error!("Listing running plans failed: {}", err);
            return Vec::new();
        }
    };
    let mut collections: HashMap<i64, Arc<Collection>> = HashMap::new();
    let mut items = Vec::with_capacity(running_plans.len());
    for running in running_plans {
        let collection = match collections.get(&running.collection_id) {
            Some(collection) => Arc::clone(collection),
            None => match store.get_collection(running.collection_id).await {
                Ok(collection) => {
                    let collection = Arc::new(collection);
                    collections.insert(running.collection_id, Arc::clone(&collection));
                    collection
                }
                Err(err) => {
                    tracing::warn!("Skipping collection {}: {}", running.collection_id, err);
                    continue;
                }
            },
        };
        match store
            .execution_plan(running.collection_id, running.plan_id)
            .await
        {
            Ok(plan) => items.push(CheckItem { collection, plan }),
            Err(err) => tracing::warn!("Skipping plan {}: {}", running.plan_id, err),
        }
    }
    items
}

/// Terminate an idle plan and close the run once no plan of the collection runs.
pub(super) async fn check_plan(controller: &Controller, item: CheckItem) {
    let collection_id = item.collection.id;
    let plan_id = item.plan.plan_id;
    let plan = controller.plan_controller(item.collection, item.plan);
    if plan.progress().await {
        return;
    }
    let store = controller.store();
    let run_id = match store.current_run(collection_id).await {
        Ok(Some(run_id)) => run_id,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!("Reading run of collection {} failed: {}", collection_id, err);
            return;
        }
    };
    match plan.terminate(false).await {
        Ok(()) => tracing::info!("Plan {} of collection {} is finished", plan_id, collection_id),
        Err(AppError::Engine(err)) => {
            tracing::warn!("Plan {} finished with a failed stop: {}", plan_id, err);
        }
        Err(err) => {
            tracing::warn!("Terminating plan {} failed: {}", plan_id, err);
            return;
        }
    }

    match store.has_running_plan(collection_id).await {
        Ok(true) => {}
        Ok(false) => {
            let finished = async {
                store.stop_run(collection_id).await?;
                store.run_finish(collection_id, run_id).await
            }
            .await;
            match finished {
                Ok(()) => tracing::info!("Run {} of collection {} is finished", run_id, collection_id),
                Err(err) => tracing::warn!("Finishing run {} failed: {}", run_id, err),
            }
        }
        Err(err) => tracing::warn!("Reading running plans of {} failed: {}", collection_id, err),
    }
}
