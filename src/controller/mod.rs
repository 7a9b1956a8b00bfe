//! Composition root: collection-level operations over per-plan controllers.
mod plan;
mod prepare;
mod readers;
mod registry;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};

use crate::artifacts::ArtifactSource;
use crate::broker::{MetricBroker, Subscription};
use crate::engine::{EngineClient, EngineKind, RetryPolicy};
use crate::error::{AppError, AppResult, ControllerError};
use crate::metrics::MetricsSink;
use crate::model::{Collection, ExecutionPlan, RunningPlan};
use crate::scheduler::{CollectionStatus, ContainerSpec, EngineScheduler};
use crate::store::{ExecutionStore, LaunchCounts};

pub(crate) use plan::PlanController;
pub use prepare::{prepare_collection, prepare_plan};
pub use readers::MetricReaders;
pub use registry::{ConnectedEngines, Registration};

/// Per-plan outcome of a background collection deploy.
pub type DeployOutcome = Vec<(i64, AppResult<()>)>;

/// Collaborators and tunables handed to [`Controller::new`].
pub struct ControllerParts {
    pub context: String,
    pub scheduler: Arc<dyn EngineScheduler>,
    pub store: Arc<dyn ExecutionStore>,
    pub artifacts: Arc<dyn ArtifactSource>,
    pub sink: Arc<dyn MetricsSink>,
    pub broker: MetricBroker,
    pub client: EngineClient,
    pub engine_kind: EngineKind,
    pub container: ContainerSpec,
    pub max_engines_in_collection: usize,
}

pub(crate) struct ControllerCore {
    pub(crate) context: String,
    pub(crate) scheduler: Arc<dyn EngineScheduler>,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) artifacts: Arc<dyn ArtifactSource>,
    pub(crate) sink: Arc<dyn MetricsSink>,
    pub(crate) engines: ConnectedEngines,
    pub(crate) client: EngineClient,
    pub(crate) engine_kind: EngineKind,
    pub(crate) container: ContainerSpec,
    pub(crate) retry: RetryPolicy,
    pub(crate) max_engines_in_collection: usize,
    pub(crate) broker: MetricBroker,
}

/// Entry point for the API layer and the reconciliation loops.
#[derive(Clone)]
pub struct Controller {
    core: Arc<ControllerCore>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("context", &self.core.context)
            .field("scheduler", &self.core.scheduler.name())
            .field("engines", &self.core.engines.len())
            .finish_non_exhaustive()
    }
}

fn total_engines(plans: &[ExecutionPlan]) -> usize {
    plans
        .iter()
        .map(|plan| plan.engines)
        .fold(0, usize::saturating_add)
}

fn total_virtual_users(plans: &[ExecutionPlan]) -> u64 {
    plans
        .iter()
        .map(ExecutionPlan::virtual_users)
        .fold(0, u64::saturating_add)
}

/// A deployed collection keeps its pods; only durations and rampups may change.
fn changes_deployed_layout(current: &[ExecutionPlan], updated: &[ExecutionPlan]) -> bool {
    if current.len() != updated.len() {
        return true;
    }
    let current: BTreeMap<i64, &ExecutionPlan> =
        current.iter().map(|plan| (plan.plan_id, plan)).collect();
    updated.iter().any(|plan| match current.get(&plan.plan_id) {
        Some(existing) => {
            existing.engines != plan.engines || existing.concurrency != plan.concurrency
        }
        None => true,
    })
}

impl Controller {
    #[must_use]
    pub fn new(parts: ControllerParts) -> Self {
        let readers = MetricReaders::new(Arc::clone(&parts.sink), parts.broker.clone());
        let engines = ConnectedEngines::new(&parts.context, readers);
        let retry = parts.client.retry();
        Self {
            core: Arc::new(ControllerCore {
                context: parts.context,
                scheduler: parts.scheduler,
                store: parts.store,
                artifacts: parts.artifacts,
                sink: parts.sink,
                engines,
                client: parts.client,
                engine_kind: parts.engine_kind,
                container: parts.container,
                retry,
                max_engines_in_collection: parts.max_engines_in_collection,
                broker: parts.broker,
            }),
        }
    }

    #[must_use]
    pub fn context(&self) -> &str {
        &self.core.context
    }

    #[must_use]
    pub fn engines(&self) -> &ConnectedEngines {
        &self.core.engines
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.core.store
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn EngineScheduler> {
        &self.core.scheduler
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.core.sink
    }

    pub(crate) fn plan_controller(
        &self,
        collection: Arc<Collection>,
        plan: ExecutionPlan,
    ) -> PlanController {
        PlanController::new(Arc::clone(&self.core), collection, plan)
    }

    /// Record the launch, expose the project and deploy every plan in the background.
    ///
    /// The returned handle resolves once every plan finished deploying.
    ///
    /// # Errors
    ///
    /// Fails before anything is deployed when a plan still has registered
    /// engines, the engine quota is exceeded, a launch is already open or the
    /// project cannot be exposed.
    pub async fn deploy_collection(
        &self,
        collection_id: i64,
        owner: &str,
    ) -> AppResult<JoinHandle<DeployOutcome>> {
        let collection = Arc::new(self.core.store.get_collection(collection_id).await?);
        let plans = self.core.store.execution_plans(collection_id).await?;
        if let Some(plan) = plans.iter().find(|plan| {
            self.core
                .engines
                .contains_plan(collection_id, plan.plan_id, plan.engines)
        }) {
            return Err(AppError::controller(ControllerError::PlanStillRegistered {
                collection_id,
                plan_id: plan.plan_id,
            }));
        }
        let engines = total_engines(&plans);
        if engines > self.core.max_engines_in_collection {
            return Err(AppError::controller(ControllerError::TooManyEngines {
                requested: engines,
                max: self.core.max_engines_in_collection,
            }));
        }

        self.core
            .store
            .new_launch_entry(
                collection_id,
                owner,
                &self.core.context,
                LaunchCounts {
                    engines: u64::try_from(engines).unwrap_or(u64::MAX),
                    nodes: 0,
                    virtual_users: total_virtual_users(&plans),
                },
            )
            .await?;
        let project_id = collection.project_id;
        self.core
            .retry
            .run("Exposing project", || {
                self.core.scheduler.expose_project(project_id)
            })
            .await
            .map_err(|err| AppError::scheduler(err.last_error))?;

        let core = Arc::clone(&self.core);
        Ok(tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for plan in plans {
                let retry = core.retry;
                let controller =
                    PlanController::new(Arc::clone(&core), Arc::clone(&collection), plan);
                tasks.spawn(async move {
                    let plan_id = controller.plan().plan_id;
                    let result = retry
                        .run("Deploying plan", || controller.deploy())
                        .await
                        .map_err(|err| err.last_error);
                    (plan_id, result)
                });
            }
            let mut outcome = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((plan_id, result)) => {
                        if let Err(err) = &result {
                            tracing::error!("Deploying plan {} failed: {}", plan_id, err);
                        }
                        outcome.push((plan_id, result));
                    }
                    Err(err) => tracing::error!("Plan deploy task failed: {}", err),
                }
            }
            outcome.sort_by_key(|(plan_id, _)| *plan_id);
            tracing::info!("Collection {} deploy finished", collection.id);
            outcome
        }))
    }

    /// Start a run: trigger and subscribe every plan concurrently.
    ///
    /// When every plan failed, the collection is force-terminated.
    ///
    /// # Errors
    ///
    /// Returns `MissingTestFile` before starting when a plan lacks a test
    /// file, `RunInProgress` when a run is open, and `PlanErrors` listing the
    /// plans that failed.
    pub async fn trigger_collection(&self, collection_id: i64) -> AppResult<i64> {
        let collection = Arc::new(self.core.store.get_collection(collection_id).await?);
        let plans = self.core.store.execution_plans(collection_id).await?;
        for execution_plan in &plans {
            let plan = self.core.store.get_plan(execution_plan.plan_id).await?;
            if plan.test_file.is_none() {
                return Err(AppError::controller(ControllerError::MissingTestFile {
                    plan_id: plan.id,
                }));
            }
        }
        let run_id = self.core.store.start_run(collection_id).await?;
        let layouts = prepare_collection(&collection, plans.len());

        let mut tasks = JoinSet::new();
        for (execution_plan, inherited) in plans.iter().cloned().zip(layouts) {
            let store = Arc::clone(&self.core.store);
            let controller = self.plan_controller(Arc::clone(&collection), execution_plan);
            tasks.spawn(async move {
                let plan_id = controller.plan().plan_id;
                let result = async {
                    controller.trigger(&inherited, run_id).await?;
                    controller.subscribe(run_id).await?;
                    store.add_running_plan(collection_id, plan_id).await?;
                    Ok::<(), AppError>(())
                }
                .await;
                (plan_id, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (plan_id, result) = joined?;
            if let Err(err) = result {
                tracing::error!("Triggering plan {} failed: {}", plan_id, err);
                errors.push((plan_id, err.to_string()));
            }
        }
        self.core.store.new_run(collection_id, run_id).await?;
        if !plans.is_empty() && errors.len() == plans.len() {
            if let Err(err) = self.term_collection(collection_id, true).await {
                tracing::warn!("Cleaning up collection {} failed: {}", collection_id, err);
            }
        }
        if errors.is_empty() {
            tracing::info!("Collection {} started run {}", collection_id, run_id);
            return Ok(run_id);
        }
        errors.sort();
        Err(AppError::controller(ControllerError::PlanErrors {
            collection_id,
            errors: errors
                .into_iter()
                .map(|(plan_id, message)| format!("plan {}: {}", plan_id, message))
                .collect(),
        }))
    }

    /// Terminate every plan and close the collection's current run.
    ///
    /// # Errors
    ///
    /// Returns store failures, else the first plan failure. Every plan is
    /// attempted and the run is closed before a plan failure is returned.
    pub async fn term_collection(&self, collection_id: i64, force: bool) -> AppResult<()> {
        let collection = Arc::new(self.core.store.get_collection(collection_id).await?);
        let plans = self.core.store.execution_plans(collection_id).await?;
        let mut tasks = JoinSet::new();
        for execution_plan in plans {
            let controller = self.plan_controller(Arc::clone(&collection), execution_plan);
            tasks.spawn(async move { controller.terminate(force).await });
        }
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(AppError::from).and_then(|result| result);
            if let Err(err) = outcome {
                tracing::error!(
                    "Terminating a plan of collection {} failed: {}",
                    collection_id,
                    err
                );
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        let current_run = self.core.store.current_run(collection_id).await?;
        self.core.store.stop_run(collection_id).await?;
        if let Some(run_id) = current_run {
            self.core.store.run_finish(collection_id, run_id).await?;
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        tracing::info!("Collection {} is terminated", collection_id);
        Ok(())
    }

    /// Force-terminate, delete the cluster resources and close the launch.
    ///
    /// Termination failures are logged and do not stop the purge. The launch
    /// is closed even when the purge fails.
    ///
    /// # Errors
    ///
    /// Returns the purge failure, else the launch update failure.
    pub async fn term_and_purge_collection(&self, collection_id: i64) -> AppResult<()> {
        let plans = self.core.store.execution_plans(collection_id).await?;
        if let Err(err) = self.term_collection(collection_id, true).await {
            tracing::warn!("Terminating collection {} failed: {}", collection_id, err);
        }
        let purged = self.core.scheduler.purge_collection(collection_id).await;
        if purged.is_ok() {
            for plan in &plans {
                self.core
                    .sink
                    .delete_engine_health(collection_id, plan.plan_id, plan.engines);
            }
        }
        let finished = self
            .core
            .store
            .mark_usage_finished(collection_id, &self.core.context, total_virtual_users(&plans))
            .await;
        purged?;
        finished?;
        tracing::info!("Collection {} is purged", collection_id);
        Ok(())
    }

    /// Scheduler view of the collection, enriched with running state.
    ///
    /// # Errors
    ///
    /// Returns store or scheduler failures.
    pub async fn collection_status(&self, collection_id: i64) -> AppResult<CollectionStatus> {
        let collection = self.core.store.get_collection(collection_id).await?;
        let plans = self.core.store.execution_plans(collection_id).await?;
        let mut status = self
            .core
            .scheduler
            .collection_status(collection.project_id, collection_id, &plans)
            .await?;
        let running: BTreeMap<i64, RunningPlan> = self
            .core
            .store
            .running_plans_by_collection(collection_id)
            .await?
            .into_iter()
            .map(|running| (running.plan_id, running))
            .collect();
        for plan in &mut status.plans {
            if let Some(running) = running.get(&plan.plan_id) {
                plan.in_progress = true;
                plan.started_time = Some(running.started_time);
            }
        }
        Ok(status)
    }

    /// Receive live metric events of one collection.
    ///
    /// # Errors
    ///
    /// Returns `BrokerClosed` after shutdown.
    pub async fn subscribe_collection(&self, collection_id: i64) -> AppResult<Subscription> {
        Ok(self.core.broker.subscribe(collection_id).await?)
    }

    /// # Errors
    ///
    /// Returns `BrokerClosed` after shutdown.
    pub fn unsubscribe(&self, subscription: &Subscription) -> AppResult<()> {
        Ok(self.core.broker.unsubscribe(subscription)?)
    }

    /// Delete a collection that has neither running plans nor ready pods.
    ///
    /// # Errors
    ///
    /// Returns `CollectionBusy` while the collection is in use.
    pub async fn delete_collection(&self, collection_id: i64) -> AppResult<()> {
        if self.core.scheduler.pod_ready_count(collection_id).await? > 0 {
            return Err(AppError::controller(ControllerError::CollectionBusy {
                collection_id,
                reason: "engines are still deployed, purge them first",
            }));
        }
        if self.core.store.has_running_plan(collection_id).await? {
            return Err(AppError::controller(ControllerError::CollectionBusy {
                collection_id,
                reason: "plans are still running",
            }));
        }
        self.core.store.delete_collection(collection_id).await?;
        tracing::info!("Collection {} is deleted", collection_id);
        Ok(())
    }

    /// Replace the collection's execution plans after validating them.
    ///
    /// # Errors
    ///
    /// Rejects plans without engines, duplicate plan ids, more engines than
    /// allowed, collections with running plans, and layout changes while the
    /// collection is deployed.
    pub async fn update_execution_plans(
        &self,
        collection_id: i64,
        plans: Vec<ExecutionPlan>,
    ) -> AppResult<()> {
        let mut seen = BTreeSet::new();
        for plan in &plans {
            if plan.engines == 0 {
                return Err(AppError::controller(ControllerError::InvalidPlan {
                    plan_id: plan.plan_id,
                    reason: "engines must be greater than 0".to_owned(),
                }));
            }
            if !seen.insert(plan.plan_id) {
                return Err(AppError::controller(ControllerError::InvalidPlan {
                    plan_id: plan.plan_id,
                    reason: "plan appears more than once".to_owned(),
                }));
            }
        }
        let engines = total_engines(&plans);
        if engines > self.core.max_engines_in_collection {
            return Err(AppError::controller(ControllerError::TooManyEngines {
                requested: engines,
                max: self.core.max_engines_in_collection,
            }));
        }
        self.core.store.get_collection(collection_id).await?;
        if self.core.store.has_running_plan(collection_id).await? {
            return Err(AppError::controller(ControllerError::CollectionBusy {
                collection_id,
                reason: "plans are still running",
            }));
        }
        if self.core.scheduler.pod_ready_count(collection_id).await? > 0 {
            let current = self.core.store.execution_plans(collection_id).await?;
            if changes_deployed_layout(&current, &plans) {
                return Err(AppError::controller(ControllerError::CollectionBusy {
                    collection_id,
                    reason: "deployed collections cannot change plans, engines or concurrency",
                }));
            }
        }
        self.core
            .store
            .replace_execution_plans(collection_id, &plans)
            .await?;
        tracing::info!(
            "Collection {} now has {} execution plans",
            collection_id,
            plans.len()
        );
        Ok(())
    }

    /// Logs of the plan's first engine as kept by the scheduler.
    ///
    /// # Errors
    ///
    /// Returns scheduler failures.
    pub async fn plan_log(&self, collection_id: i64, plan_id: i64) -> AppResult<String> {
        Ok(self
            .core
            .scheduler
            .download_pod_log(collection_id, plan_id)
            .await?)
    }
}
