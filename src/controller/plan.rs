use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::task::JoinSet;

use crate::engine::{Engine, EngineId};
use crate::error::{AppError, AppResult, ControllerError, EngineFailure, SchedulerError};
use crate::model::{Collection, EngineDataConfig, EngineFile, ExecutionPlan, FileShard};
use crate::partition::build_execution_data;

use super::ControllerCore;
use super::prepare::prepare_plan;
use super::registry::Registration;

/// Drives every engine of one execution plan.
pub(crate) struct PlanController {
    core: Arc<ControllerCore>,
    collection: Arc<Collection>,
    plan: ExecutionPlan,
}

impl PlanController {
    pub(crate) fn new(core: Arc<ControllerCore>, collection: Arc<Collection>, plan: ExecutionPlan) -> Self {
        Self {
            core,
            collection,
            plan,
        }
    }

    pub(crate) const fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    fn engine_id(&self, engine_index: usize) -> EngineId {
        EngineId {
            project_id: self.collection.project_id,
            collection_id: self.collection.id,
            plan_id: self.plan.plan_id,
            engine_index,
        }
    }

    fn engine(&self, engine_index: usize) -> Engine {
        Engine::new(
            &self.core.context,
            self.engine_id(engine_index),
            self.core.engine_kind,
            self.core.client.clone(),
        )
    }

    /// Engine handles with their addresses resolved through the scheduler.
    async fn engines_with_address(&self) -> Result<Vec<Engine>, SchedulerError> {
        let mut engines = Vec::with_capacity(self.plan.engines);
        for engine_index in 0..self.plan.engines {
            let address = self
                .core
                .scheduler
                .engine_address(&self.engine_id(engine_index))
                .await?;
            engines.push(self.engine(engine_index).with_address(address));
        }
        Ok(engines)
    }

    /// Deploy every engine concurrently; successes are kept when others fail.
    pub(crate) async fn deploy(&self) -> AppResult<()> {
        let mut tasks = JoinSet::new();
        for engine_index in 0..self.plan.engines {
            let engine = self.engine(engine_index);
            let core = Arc::clone(&self.core);
            tasks.spawn(async move {
                let result = engine
                    .deploy(core.scheduler.as_ref(), &core.container)
                    .await;
                (engine_index, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (engine_index, result) = joined?;
            if let Err(err) = result {
                tracing::warn!(
                    "Deploying engine #{} of plan {} failed: {}",
                    engine_index,
                    self.plan.plan_id,
                    err
                );
                failures.push(EngineFailure {
                    engine_index,
                    message: err.to_string(),
                });
            }
        }
        if failures.is_empty() {
            tracing::info!(
                "Deployed {} engines for plan {}",
                self.plan.engines,
                self.plan.plan_id
            );
            return Ok(());
        }
        failures.sort_by_key(|failure| failure.engine_index);
        Err(AppError::controller(ControllerError::PartialDeploy {
            plan_id: self.plan.plan_id,
            failures,
        }))
    }

    async fn fetch_payloads(&self, filepaths: BTreeSet<String>) -> AppResult<HashMap<String, Bytes>> {
        let mut tasks = JoinSet::new();
        for filepath in filepaths {
            let artifacts = Arc::clone(&self.core.artifacts);
            tasks.spawn(async move {
                let payload = artifacts.fetch(&filepath).await;
                (filepath, payload)
            });
        }
        let mut payloads = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (filepath, payload) = joined?;
            payloads.insert(filepath, payload.map_err(AppError::data)?);
        }
        Ok(payloads)
    }

    /// Send each engine its share of the input and the run parameters.
    pub(crate) async fn trigger(
        &self,
        inherited: &BTreeMap<String, FileShard>,
        run_id: i64,
    ) -> AppResult<()> {
        let plan = self.core.store.get_plan(self.plan.plan_id).await?;
        let test_file = plan
            .test_file
            .clone()
            .ok_or(ControllerError::MissingTestFile {
                plan_id: self.plan.plan_id,
            })?;
        let layout = prepare_plan(inherited, &self.plan, &plan, &test_file);
        let filepaths: BTreeSet<String> = layout
            .iter()
            .flat_map(|files| files.values().map(|shard| shard.filepath.clone()))
            .collect();
        let payloads = self.fetch_payloads(filepaths).await?;
        let data = build_execution_data(&layout, &payloads).await?;
        let engines = self.engines_with_address().await?;

        let mut tasks = JoinSet::new();
        for (engine, files) in engines.into_iter().zip(data) {
            let engine_index = engine.id().engine_index;
            let config = EngineDataConfig {
                engine_data: files
                    .iter()
                    .map(|(filename, payload)| {
                        (filename.clone(), EngineFile::encode(filename, payload))
                    })
                    .collect(),
                duration: self.plan.duration.to_string(),
                concurrency: self.plan.concurrency.to_string(),
                rampup: self.plan.rampup.to_string(),
                run_id,
                engine_id: engine_index,
            };
            tasks.spawn(async move { (engine_index, engine.trigger(&config).await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (engine_index, result) = joined?;
            if let Err(err) = result {
                failures.push(EngineFailure {
                    engine_index,
                    message: err.to_string(),
                });
            }
        }
        if !failures.is_empty() {
            failures.sort_by_key(|failure| failure.engine_index);
            return Err(AppError::controller(ControllerError::PartialTrigger {
                plan_id: self.plan.plan_id,
                failures,
            }));
        }
        tracing::info!("Triggering for plan {} is finished", self.plan.plan_id);
        Ok(())
    }

    /// Open metric streams and register them; returns how many were new.
    ///
    /// Engines whose stream cannot be opened are skipped and can be retried.
    pub(crate) async fn subscribe(&self, run_id: i64) -> AppResult<usize> {
        let engines = self.engines_with_address().await?;
        let mut tasks = JoinSet::new();
        for engine in engines {
            let core = Arc::clone(&self.core);
            tasks.spawn(async move {
                match engine.subscribe(run_id).await {
                    Ok(stream) => Some(core.engines.register(Arc::new(engine), stream)),
                    Err(err) => {
                        tracing::warn!("Subscribing to {} failed: {}", engine.key(), err);
                        None
                    }
                }
            });
        }
        let mut registered: usize = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined? == Some(Registration::Registered) {
                registered = registered.saturating_add(1);
            }
        }
        tracing::info!(
            "Subscribed to plan {} ({} new engines)",
            self.plan.plan_id,
            registered
        );
        Ok(registered)
    }

    /// Whether any engine of the plan still runs.
    ///
    /// An unavailable ingress counts as running.
    pub(crate) async fn progress(&self) -> bool {
        let engines = match self.engines_with_address().await {
            Ok(engines) => engines,
            Err(err) if err.is_ingress() => {
                tracing::error!("{}", err);
                return true;
            }
            Err(err) => {
                tracing::warn!("Cannot resolve engines of plan {}: {}", self.plan.plan_id, err);
                return false;
            }
        };
        join_all(engines.iter().map(Engine::progress))
            .await
            .into_iter()
            .any(|running| running)
    }

    /// Stop registered engines, drop them from the registry and clear the running marker.
    ///
    /// Every engine is stopped before the first stop failure is returned.
    pub(crate) async fn terminate(&self, force: bool) -> AppResult<()> {
        let engines =
            self.core
                .engines
                .plan_engines(self.collection.id, self.plan.plan_id, self.plan.engines);
        let results = join_all(engines.iter().map(|engine| async move {
            let result = engine.terminate(force).await;
            self.core.engines.remove(engine.key());
            tracing::info!("Engine {} is terminated", engine.key());
            result
        }))
        .await;
        let mut first_error = None;
        for err in results.into_iter().filter_map(Result::err) {
            tracing::warn!("Stopping engine failed: {}", err);
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
        self.core
            .store
            .delete_running_plan(self.collection.id, self.plan.plan_id)
            .await?;
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
