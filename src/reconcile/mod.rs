//! Background loops that keep the cluster in line with the store.
//!
//! Every loop logs collaborator failures and carries on with the next item or
//! tick; all of them stop on the shutdown broadcast.
mod cache_prune;
mod check_running;
mod ingress;
mod purge;
mod resources;
mod resume;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::controller::Controller;
use crate::shutdown::{ShutdownReceiver, ShutdownSender};

pub use purge::is_collection_stale;
pub use resume::resume_on_boot;

/// Periods and pool sizes of the reconciliation loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub check_interval: Duration,
    pub check_workers: usize,
    pub purge_interval: Duration,
    pub cache_prune_interval: Duration,
    pub resource_interval: Duration,
    /// Idle time after which a deployed collection is purged.
    pub gc_duration: Duration,
    pub on_demand: bool,
    /// Unused time after which a project's ingress is removed.
    pub ingress_lifespan: Duration,
    pub ingress_gc_interval: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2),
            check_workers: 3,
            purge_interval: Duration::from_secs(60),
            cache_prune_interval: Duration::from_secs(120),
            resource_interval: Duration::from_secs(5),
            gc_duration: Duration::from_secs(900),
            on_demand: false,
            ingress_lifespan: Duration::from_secs(1800),
            ingress_gc_interval: Duration::from_secs(30),
        }
    }
}

/// Run `pass` on every tick of `period` until shutdown.
async fn every<F, Fut>(name: &'static str, period: Duration, mut shutdown_rx: ShutdownReceiver, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("{} loop stopped", name);
                break;
            }
            _ = ticker.tick() => pass().await,
        }
    }
}

/// Spawn the periodic loops; resume-on-boot is run separately beforehand.
#[must_use]
pub fn spawn_loops(
    controller: &Controller,
    settings: &ReconcileSettings,
    shutdown_tx: &ShutdownSender,
) -> Vec<JoinHandle<()>> {
    let mut handles = check_running::spawn(
        controller,
        settings.check_interval,
        settings.check_workers,
        shutdown_tx,
    );

    let purging = controller.clone();
    let (threshold, on_demand) = (settings.gc_duration, settings.on_demand);
    handles.push(tokio::spawn(every(
        "Auto-purge",
        settings.purge_interval,
        shutdown_tx.subscribe(),
        move || {
            let controller = purging.clone();
            async move {
                purge::purge_pass(&controller, threshold, on_demand).await;
            }
        },
    )));

    let pruning = controller.clone();
    handles.push(tokio::spawn(every(
        "Cache prune",
        settings.cache_prune_interval,
        shutdown_tx.subscribe(),
        move || {
            let controller = pruning.clone();
            async move {
                cache_prune::prune_pass(&controller).await;
            }
        },
    )));

    let sampling = controller.clone();
    handles.push(tokio::spawn(every(
        "Engine health",
        settings.resource_interval,
        shutdown_tx.subscribe(),
        move || {
            let controller = sampling.clone();
            async move {
                resources::resources_pass(&controller).await;
            }
        },
    )));

    let collecting = controller.clone();
    let last_used = Arc::new(Mutex::new(ingress::LastUsed::new()));
    let lifespan = settings.ingress_lifespan;
    handles.push(tokio::spawn(every(
        "Ingress GC",
        settings.ingress_gc_interval,
        shutdown_tx.subscribe(),
        move || {
            let controller = collecting.clone();
            let last_used = Arc::clone(&last_used);
            async move {
                let mut last_used = last_used.lock().await;
                ingress::ingress_pass(&controller, lifespan, &mut last_used, Utc::now()).await;
            }
        },
    )));

    tracing::info!(
        "Reconciliation loops started ({} check workers)",
        settings.check_workers
    );
    handles
}
