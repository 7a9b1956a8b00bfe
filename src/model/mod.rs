//! Durable entities read through the store and transient values passed between components.
mod collection;
mod engine_data;
mod metric;

pub use collection::{
    Collection, DataFile, DeployedCollections, ExecutionPlan, LaunchEntry, Plan, RunHistory,
    RunningPlan,
};
pub use engine_data::{EngineDataConfig, EngineFile, FileShard, ShardLayout};
pub use metric::{EngineMetric, MetricEvent, ResourceUsage};
