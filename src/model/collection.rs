use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to a stored artifact; `filepath` is resolved through the artifact source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub filename: String,
    pub filepath: String,
}

/// A named group of plans deployed and run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    #[serde(default)]
    pub data: Vec<DataFile>,
    #[serde(default)]
    pub csv_split: bool,
}

/// A plan bound into a collection with concrete load parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: i64,
    pub name: String,
    pub engines: usize,
    pub concurrency: u32,
    pub rampup: u32,
    pub duration: u32,
    #[serde(default)]
    pub csv_split: bool,
}

impl ExecutionPlan {
    /// Virtual users this plan contributes to a launch.
    #[must_use]
    pub fn virtual_users(&self) -> u64 {
        (self.engines as u64).saturating_mul(u64::from(self.concurrency))
    }
}

/// Reusable test script plus the data files uploaded with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub test_file: Option<DataFile>,
    #[serde(default)]
    pub data: Vec<DataFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningPlan {
    pub collection_id: i64,
    pub plan_id: i64,
    pub started_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistory {
    pub run_id: i64,
    pub collection_id: i64,
    pub started_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Usage record opened when a collection is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchEntry {
    pub collection_id: i64,
    pub owner: String,
    pub context: String,
    pub engines: u64,
    pub nodes: u64,
    pub virtual_users: u64,
    pub started_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Collection id to launch time, as reported by the scheduler.
pub type DeployedCollections = BTreeMap<i64, DateTime<Utc>>;
