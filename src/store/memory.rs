use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{Collection, ExecutionPlan, LaunchEntry, Plan, RunHistory, RunningPlan};

use super::{ExecutionStore, LaunchCounts};

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<i64, Collection>,
    execution_plans: HashMap<i64, BTreeMap<i64, ExecutionPlan>>,
    plans: HashMap<i64, Plan>,
    running_plans: BTreeMap<(i64, i64), RunningPlan>,
    current_runs: HashMap<i64, i64>,
    run_history: BTreeMap<i64, RunHistory>,
    launches: HashMap<i64, LaunchEntry>,
    launch_history: Vec<LaunchEntry>,
    next_run_id: i64,
}

/// Process-local store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closed and open launches recorded for a collection.
    pub async fn launch_history(&self, collection_id: i64) -> Vec<LaunchEntry> {
        let state = self.state.lock().await;
        state
            .launch_history
            .iter()
            .filter(|entry| entry.collection_id == collection_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn put_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.collections.insert(collection.id, collection.clone());
        Ok(())
    }

    async fn get_collection(&self, collection_id: i64) -> Result<Collection, StoreError> {
        let state = self.state.lock().await;
        state
            .collections
            .get(&collection_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("collection", collection_id))
    }

    async fn delete_collection(&self, collection_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.collections.remove(&collection_id).is_none() {
            return Err(StoreError::not_found("collection", collection_id));
        }
        state.execution_plans.remove(&collection_id);
        Ok(())
    }

    async fn put_execution_plan(
        &self,
        collection_id: i64,
        plan: &ExecutionPlan,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .execution_plans
            .entry(collection_id)
            .or_default()
            .insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn replace_execution_plans(
        &self,
        collection_id: i64,
        plans: &[ExecutionPlan],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let replaced = plans
            .iter()
            .map(|plan| (plan.plan_id, plan.clone()))
            .collect();
        state.execution_plans.insert(collection_id, replaced);
        Ok(())
    }

    async fn execution_plans(&self, collection_id: i64) -> Result<Vec<ExecutionPlan>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .execution_plans
            .get(&collection_id)
            .map(|plans| plans.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn execution_plan(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<ExecutionPlan, StoreError> {
        let state = self.state.lock().await;
        state
            .execution_plans
            .get(&collection_id)
            .and_then(|plans| plans.get(&plan_id))
            .cloned()
            .ok_or_else(|| {
                StoreError::not_found("execution plan", format!("{}/{}", collection_id, plan_id))
            })
    }

    async fn put_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: i64) -> Result<Plan, StoreError> {
        let state = self.state.lock().await;
        state
            .plans
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("plan", plan_id))
    }

    async fn add_running_plan(&self, collection_id: i64, plan_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .running_plans
            .entry((collection_id, plan_id))
            .or_insert_with(|| RunningPlan {
                collection_id,
                plan_id,
                started_time: Utc::now(),
            });
        Ok(())
    }

    async fn delete_running_plan(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.running_plans.remove(&(collection_id, plan_id));
        Ok(())
    }

    async fn running_plans(&self) -> Result<Vec<RunningPlan>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.running_plans.values().copied().collect())
    }

    async fn running_plans_by_collection(
        &self,
        collection_id: i64,
    ) -> Result<Vec<RunningPlan>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .running_plans
            .values()
            .filter(|plan| plan.collection_id == collection_id)
            .copied()
            .collect())
    }

    async fn running_plan(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<RunningPlan, StoreError> {
        let state = self.state.lock().await;
        state
            .running_plans
            .get(&(collection_id, plan_id))
            .copied()
            .ok_or_else(|| {
                StoreError::not_found("running plan", format!("{}/{}", collection_id, plan_id))
            })
    }

    async fn has_running_plan(&self, collection_id: i64) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .running_plans
            .keys()
            .any(|(collection, _)| *collection == collection_id))
    }

    async fn start_run(&self, collection_id: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.current_runs.contains_key(&collection_id) {
            return Err(StoreError::RunInProgress { collection_id });
        }
        state.next_run_id = state.next_run_id.saturating_add(1);
        let run_id = state.next_run_id;
        state.current_runs.insert(collection_id, run_id);
        Ok(run_id)
    }

    async fn stop_run(&self, collection_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.current_runs.remove(&collection_id);
        Ok(())
    }

    async fn current_run(&self, collection_id: i64) -> Result<Option<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.current_runs.get(&collection_id).copied())
    }

    async fn new_run(&self, collection_id: i64, run_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.run_history.insert(
            run_id,
            RunHistory {
                run_id,
                collection_id,
                started_time: Utc::now(),
                end_time: None,
            },
        );
        Ok(())
    }

    async fn run_finish(&self, collection_id: i64, run_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.run_history.get_mut(&run_id) {
            Some(run) if run.collection_id == collection_id => {
                run.end_time = Some(Utc::now());
                Ok(())
            }
            Some(_) | None => Err(StoreError::not_found("run", run_id)),
        }
    }

    async fn last_run(&self, collection_id: i64) -> Result<Option<RunHistory>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .run_history
            .values()
            .rev()
            .find(|run| run.collection_id == collection_id)
            .copied())
    }

    async fn get_run(&self, run_id: i64) -> Result<RunHistory, StoreError> {
        let state = self.state.lock().await;
        state
            .run_history
            .get(&run_id)
            .copied()
            .ok_or_else(|| StoreError::not_found("run", run_id))
    }

    async fn new_launch_entry(
        &self,
        collection_id: i64,
        owner: &str,
        context: &str,
        counts: LaunchCounts,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.launches.contains_key(&collection_id) {
            return Err(StoreError::LaunchInProgress { collection_id });
        }
        let entry = LaunchEntry {
            collection_id,
            owner: owner.to_owned(),
            context: context.to_owned(),
            engines: counts.engines,
            nodes: counts.nodes,
            virtual_users: counts.virtual_users,
            started_time: Utc::now(),
            end_time: None,
        };
        state.launches.insert(collection_id, entry.clone());
        state.launch_history.push(entry);
        Ok(())
    }

    async fn mark_usage_finished(
        &self,
        collection_id: i64,
        context: &str,
        virtual_users: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let finished = Utc::now();
        if let Some(entry) = state.launch_history.iter_mut().rev().find(|entry| {
            entry.collection_id == collection_id
                && entry.context == context
                && entry.end_time.is_none()
        }) {
            entry.end_time = Some(finished);
            entry.virtual_users = virtual_users;
        }
        state.launches.remove(&collection_id);
        Ok(())
    }
}
