use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::artifacts::LocalArtifacts;
use crate::broker::MetricBroker;
use crate::engine::{EngineClient, EngineId, EngineKind, RetryPolicy};
use crate::error::{AppError, AppResult, SchedulerError};
use crate::metrics::TimeSeriesRegistry;
use crate::model::{
    Collection, DataFile, DeployedCollections, ExecutionPlan, Plan, ResourceUsage,
};
use crate::scheduler::{
    CollectionStatus, ContainerSpec, EngineScheduler, ExposedProjects, NodePoolInfo, PlanStatus,
};
use crate::shutdown::ShutdownSender;
use crate::shutdown_handlers::shutdown_channel;
use crate::store::{ExecutionStore, MemoryStore};

use super::{Controller, ControllerParts};

pub(crate) const FAST_RETRY: RetryPolicy = RetryPolicy::new(1, Duration::from_millis(10));
pub(crate) const COLLECTION_ID: i64 = 12;
pub(crate) const PROJECT_ID: i64 = 3;

pub(crate) fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| AppError::controller(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

/// Scheduler double that routes every engine to `<address>/<service-name>`.
#[derive(Debug, Default)]
pub(crate) struct FakeScheduler {
    pub(crate) address: String,
    pub(crate) failing_engine: Option<usize>,
    pub(crate) ingress_down: AtomicBool,
    pub(crate) ready: AtomicUsize,
    pub(crate) deployed: Mutex<BTreeSet<EngineId>>,
    pub(crate) purged: Mutex<Vec<i64>>,
    pub(crate) launches: Mutex<DeployedCollections>,
    pub(crate) pools: Mutex<BTreeMap<i64, NodePoolInfo>>,
    pub(crate) purged_pools: Mutex<Vec<i64>>,
    pub(crate) usage: Mutex<ResourceUsage>,
    pub(crate) exposed: Mutex<ExposedProjects>,
    pub(crate) purged_ingress: Mutex<Vec<i64>>,
}

impl FakeScheduler {
    pub(crate) fn with_address(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            ..Self::default()
        }
    }

    pub(crate) async fn launched(&self, collection_id: i64, launch_time: DateTime<Utc>) {
        self.launches.lock().await.insert(collection_id, launch_time);
    }
}

#[async_trait]
impl EngineScheduler for FakeScheduler {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn deploy_engine(
        &self,
        engine: &EngineId,
        _spec: &ContainerSpec,
    ) -> Result<(), SchedulerError> {
        if self.failing_engine == Some(engine.engine_index) {
            return Err(SchedulerError::Deploy {
                engine: engine.engine_name(),
                message: "quota exceeded".to_owned(),
            });
        }
        self.deployed.lock().await.insert(*engine);
        Ok(())
    }

    async fn expose_project(&self, project_id: i64) -> Result<(), SchedulerError> {
        self.exposed
            .lock()
            .await
            .entry(project_id)
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn purge_project_ingress(&self, project_id: i64) -> Result<(), SchedulerError> {
        self.exposed.lock().await.remove(&project_id);
        self.purged_ingress.lock().await.push(project_id);
        Ok(())
    }

    async fn exposed_projects(&self) -> Result<ExposedProjects, SchedulerError> {
        Ok(self.exposed.lock().await.clone())
    }

    async fn engine_address(&self, engine: &EngineId) -> Result<String, SchedulerError> {
        if self.ingress_down.load(Ordering::Acquire) {
            return Err(SchedulerError::IngressUnavailable {
                collection_id: engine.collection_id,
                message: "ingress restarting".to_owned(),
            });
        }
        Ok(format!("{}/{}", self.address, engine.service_name()))
    }

    async fn pod_ready_count(&self, _collection_id: i64) -> Result<usize, SchedulerError> {
        Ok(self.ready.load(Ordering::Acquire))
    }

    async fn purge_collection(&self, collection_id: i64) -> Result<(), SchedulerError> {
        self.purged.lock().await.push(collection_id);
        self.launches.lock().await.remove(&collection_id);
        Ok(())
    }

    async fn deployed_collections(&self) -> Result<DeployedCollections, SchedulerError> {
        Ok(self.launches.lock().await.clone())
    }

    async fn collection_status(
        &self,
        _project_id: i64,
        _collection_id: i64,
        plans: &[ExecutionPlan],
    ) -> Result<CollectionStatus, SchedulerError> {
        Ok(CollectionStatus {
            plans: plans
                .iter()
                .map(|plan| PlanStatus {
                    plan_id: plan.plan_id,
                    engines_reachable: true,
                    engines: plan.engines,
                    engines_deployed: plan.engines,
                    in_progress: false,
                    started_time: None,
                })
                .collect(),
            pool_size: 0,
            pool_status: String::new(),
        })
    }

    async fn download_pod_log(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<String, SchedulerError> {
        Ok(format!("log of {}/{}", collection_id, plan_id))
    }

    async fn pods_metrics(
        &self,
        _collection_id: i64,
        _plan_id: i64,
    ) -> Result<ResourceUsage, SchedulerError> {
        Ok(self.usage.lock().await.clone())
    }

    async fn service_reachable(&self, _engine: &EngineId) -> bool {
        true
    }

    fn supports_node_pools(&self) -> bool {
        true
    }

    async fn node_pools(&self) -> Result<BTreeMap<i64, NodePoolInfo>, SchedulerError> {
        Ok(self.pools.lock().await.clone())
    }

    async fn purge_node_pool(&self, collection_id: i64) -> Result<(), SchedulerError> {
        self.pools.lock().await.remove(&collection_id);
        self.purged_pools.lock().await.push(collection_id);
        Ok(())
    }
}

/// A controller wired to in-memory collaborators.
pub(crate) struct Harness {
    pub(crate) controller: Controller,
    pub(crate) scheduler: Arc<FakeScheduler>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) registry: Arc<TimeSeriesRegistry>,
    pub(crate) shutdown_tx: ShutdownSender,
    pub(crate) artifacts: TempDir,
}

impl Harness {
    pub(crate) fn new(scheduler: FakeScheduler) -> AppResult<Self> {
        Self::with_max_engines(scheduler, 100)
    }

    pub(crate) fn with_max_engines(
        scheduler: FakeScheduler,
        max_engines_in_collection: usize,
    ) -> AppResult<Self> {
        let (shutdown_tx, _shutdown_rx) = shutdown_channel();
        let scheduler = Arc::new(scheduler);
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(TimeSeriesRegistry::new());
        let artifacts = tempfile::tempdir()?;
        let controller = build_controller(
            Arc::clone(&scheduler) as Arc<dyn EngineScheduler>,
            &store,
            &registry,
            &artifacts,
            &shutdown_tx,
            max_engines_in_collection,
        )?;
        Ok(Self {
            controller,
            scheduler,
            store,
            registry,
            shutdown_tx,
            artifacts,
        })
    }

    /// A second controller process over the same store, with an empty
    /// engine registry and its own scheduler adapter.
    pub(crate) fn restarted(&self, scheduler: Arc<dyn EngineScheduler>) -> AppResult<Controller> {
        build_controller(
            scheduler,
            &self.store,
            &self.registry,
            &self.artifacts,
            &self.shutdown_tx,
            100,
        )
    }

    /// Write an artifact under the harness root.
    pub(crate) fn artifact(&self, filepath: &str, contents: &str) -> AppResult<DataFile> {
        let target = self.artifacts.path().join(filepath);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, contents)?;
        let filename = filepath.rsplit('/').next().unwrap_or(filepath).to_owned();
        Ok(DataFile {
            filename,
            filepath: filepath.to_owned(),
        })
    }

    /// Store a collection whose plans each get a test script.
    pub(crate) async fn seed(&self, csv_split: bool, plans: &[ExecutionPlan]) -> AppResult<()> {
        let users = self.artifact("3/users.csv", "alice\nbob\ncarol\ndave\n")?;
        self.store
            .put_collection(&Collection {
                id: COLLECTION_ID,
                name: "checkout".to_owned(),
                project_id: PROJECT_ID,
                data: vec![users],
                csv_split,
            })
            .await?;
        for execution_plan in plans {
            let test_file = self.artifact(
                &format!("plans/{}/test.jmx", execution_plan.plan_id),
                "<jmeterTestPlan/>",
            )?;
            self.store
                .put_plan(&Plan {
                    id: execution_plan.plan_id,
                    name: execution_plan.name.clone(),
                    project_id: PROJECT_ID,
                    test_file: Some(test_file),
                    data: Vec::new(),
                })
                .await?;
            self.store
                .put_execution_plan(COLLECTION_ID, execution_plan)
                .await?;
        }
        Ok(())
    }
}

fn build_controller(
    scheduler: Arc<dyn EngineScheduler>,
    store: &Arc<MemoryStore>,
    registry: &Arc<TimeSeriesRegistry>,
    artifacts: &TempDir,
    shutdown_tx: &ShutdownSender,
    max_engines_in_collection: usize,
) -> AppResult<Controller> {
    let (broker, _handle) = MetricBroker::spawn(shutdown_tx.subscribe());
    Ok(Controller::new(ControllerParts {
        context: "test".to_owned(),
        scheduler,
        store: Arc::clone(store) as Arc<dyn ExecutionStore>,
        artifacts: Arc::new(LocalArtifacts::new(artifacts.path())),
        sink: Arc::clone(registry) as Arc<dyn crate::metrics::MetricsSink>,
        broker,
        client: EngineClient::new(Duration::from_secs(2), FAST_RETRY)?,
        engine_kind: EngineKind::Jmeter,
        container: ContainerSpec {
            engine_kind: EngineKind::Jmeter,
            image: EngineKind::Jmeter.default_image().to_owned(),
            cpu: "1".to_owned(),
            mem: "512Mi".to_owned(),
        },
        max_engines_in_collection,
    }))
}

impl Drop for Harness {
    fn drop(&mut self) {
        drop(self.shutdown_tx.send(()));
    }
}

pub(crate) fn execution_plan(plan_id: i64, engines: usize) -> ExecutionPlan {
    ExecutionPlan {
        plan_id,
        name: format!("plan-{}", plan_id),
        engines,
        concurrency: 10,
        rampup: 5,
        duration: 60,
        csv_split: false,
    }
}
