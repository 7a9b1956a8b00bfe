//! Durable store port and its adapters.
mod memory;
mod sqlite;


use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Collection, ExecutionPlan, Plan, RunHistory, RunningPlan};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Counts recorded when a collection is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchCounts {
    pub engines: u64,
    pub nodes: u64,
    pub virtual_users: u64,
}

/// Query contract of the relational store that owns collections, plans and runs.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn put_collection(&self, collection: &Collection) -> Result<(), StoreError>;

    async fn get_collection(&self, collection_id: i64) -> Result<Collection, StoreError>;

    async fn delete_collection(&self, collection_id: i64) -> Result<(), StoreError>;

    async fn put_execution_plan(
        &self,
        collection_id: i64,
        plan: &ExecutionPlan,
    ) -> Result<(), StoreError>;

    /// Swap the collection's whole plan list in one step.
    async fn replace_execution_plans(
        &self,
        collection_id: i64,
        plans: &[ExecutionPlan],
    ) -> Result<(), StoreError>;

    async fn execution_plans(&self, collection_id: i64) -> Result<Vec<ExecutionPlan>, StoreError>;

    async fn execution_plan(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<ExecutionPlan, StoreError>;

    async fn put_plan(&self, plan: &Plan) -> Result<(), StoreError>;

    async fn get_plan(&self, plan_id: i64) -> Result<Plan, StoreError>;

    async fn add_running_plan(&self, collection_id: i64, plan_id: i64) -> Result<(), StoreError>;

    async fn delete_running_plan(&self, collection_id: i64, plan_id: i64)
    -> Result<(), StoreError>;

    async fn running_plans(&self) -> Result<Vec<RunningPlan>, StoreError>;

    async fn running_plans_by_collection(
        &self,
        collection_id: i64,
    ) -> Result<Vec<RunningPlan>, StoreError>;

    async fn running_plan(&self, collection_id: i64, plan_id: i64)
    -> Result<RunningPlan, StoreError>;

    async fn has_running_plan(&self, collection_id: i64) -> Result<bool, StoreError>;

    /// Open the collection's current run, failing when one is already open.
    async fn start_run(&self, collection_id: i64) -> Result<i64, StoreError>;

    async fn stop_run(&self, collection_id: i64) -> Result<(), StoreError>;

    async fn current_run(&self, collection_id: i64) -> Result<Option<i64>, StoreError>;

    /// Record the run in the collection's history.
    async fn new_run(&self, collection_id: i64, run_id: i64) -> Result<(), StoreError>;

    async fn run_finish(&self, collection_id: i64, run_id: i64) -> Result<(), StoreError>;

    async fn last_run(&self, collection_id: i64) -> Result<Option<RunHistory>, StoreError>;

    async fn get_run(&self, run_id: i64) -> Result<RunHistory, StoreError>;

    /// Fails with `LaunchInProgress` while a previous launch is still open.
    async fn new_launch_entry(
        &self,
        collection_id: i64,
        owner: &str,
        context: &str,
        counts: LaunchCounts,
    ) -> Result<(), StoreError>;

    /// Close the open launch; a missing launch is not an error.
    async fn mark_usage_finished(
        &self,
        collection_id: i64,
        context: &str,
        virtual_users: u64,
    ) -> Result<(), StoreError>;
}
