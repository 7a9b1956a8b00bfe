//! Cluster scheduler port and the adapters selected by configuration.
mod gateway;


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::{EngineId, EngineKind};
use crate::error::SchedulerError;
use crate::model::{DeployedCollections, ExecutionPlan, ResourceUsage};

pub use gateway::GatewayScheduler;

/// What the scheduler needs to start one worker container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub engine_kind: EngineKind,
    pub image: String,
    pub cpu: String,
    pub mem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStatus {
    pub plan_id: i64,
    pub engines_reachable: bool,
    pub engines: usize,
    pub engines_deployed: usize,
    pub in_progress: bool,
    pub started_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStatus {
    #[serde(rename = "status")]
    pub plans: Vec<PlanStatus>,
    pub pool_size: usize,
    pub pool_status: String,
}

/// Project id to ingress creation time.
pub type ExposedProjects = BTreeMap<i64, DateTime<Utc>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodePoolInfo {
    pub size: usize,
    pub launch_time: DateTime<Utc>,
}

/// Cluster technology that creates and destroys workers.
#[async_trait]
pub trait EngineScheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deploying an engine that already exists must succeed.
    async fn deploy_engine(&self, engine: &EngineId, spec: &ContainerSpec)
    -> Result<(), SchedulerError>;

    async fn expose_project(&self, project_id: i64) -> Result<(), SchedulerError>;

    /// Remove the project's ingress; a missing ingress is not an error.
    async fn purge_project_ingress(&self, project_id: i64) -> Result<(), SchedulerError>;

    /// Exposed projects and when their ingress was created.
    async fn exposed_projects(&self) -> Result<ExposedProjects, SchedulerError>;

    /// Base URL of the worker's HTTP endpoints.
    async fn engine_address(&self, engine: &EngineId) -> Result<String, SchedulerError>;

    async fn pod_ready_count(&self, collection_id: i64) -> Result<usize, SchedulerError>;

    async fn purge_collection(&self, collection_id: i64) -> Result<(), SchedulerError>;

    async fn deployed_collections(&self) -> Result<DeployedCollections, SchedulerError>;

    async fn collection_status(
        &self,
        project_id: i64,
        collection_id: i64,
        plans: &[ExecutionPlan],
    ) -> Result<CollectionStatus, SchedulerError>;

    async fn download_pod_log(&self, collection_id: i64, plan_id: i64)
    -> Result<String, SchedulerError>;

    async fn pods_metrics(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<ResourceUsage, SchedulerError>;

    async fn service_reachable(&self, engine: &EngineId) -> bool;

    /// Whether this scheduler provisions node pools per collection.
    fn supports_node_pools(&self) -> bool {
        false
    }

    async fn node_pools(&self) -> Result<BTreeMap<i64, NodePoolInfo>, SchedulerError> {
        Err(SchedulerError::FeatureUnavailable {
            feature: "node pools",
        })
    }

    async fn purge_node_pool(&self, _collection_id: i64) -> Result<(), SchedulerError> {
        Err(SchedulerError::FeatureUnavailable {
            feature: "node pools",
        })
    }
}

/// Scheduler variant chosen at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerKind {
    Gateway { base_url: String },
}

/// Build the configured scheduler.
///
/// # Errors
///
/// Returns an error when the scheduler's HTTP client cannot be created.
pub fn build_scheduler(
    kind: &SchedulerKind,
    request_timeout: Duration,
) -> Result<Arc<dyn EngineScheduler>, reqwest::Error> {
    match kind {
        SchedulerKind::Gateway { base_url } => Ok(Arc::new(GatewayScheduler::new(
            base_url,
            request_timeout,
        )?)),
    }
}
