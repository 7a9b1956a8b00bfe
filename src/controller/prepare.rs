//! Shard layouts for a collection run.
use std::collections::BTreeMap;

use crate::model::{Collection, DataFile, ExecutionPlan, FileShard, Plan, ShardLayout};

/// Collection-level files for each of `plan_count` plans.
///
/// With `csv_split` the plan at position `i` takes split `i` of `plan_count`.
#[must_use]
pub fn prepare_collection(collection: &Collection, plan_count: usize) -> ShardLayout {
    (0..plan_count)
        .map(|plan_index| {
            collection
                .data
                .iter()
                .map(|file| {
                    let mut shard = FileShard::whole(&file.filename, &file.filepath);
                    if collection.csv_split {
                        shard.total_splits = plan_count;
                        shard.current_split = plan_index;
                    }
                    (file.filename.clone(), shard)
                })
                .collect()
        })
        .collect()
}

/// Per-engine layout of one plan.
///
/// Collection files inherited by a splitting plan are split again across its
/// engines. The test file goes to every engine whole, and plan files replace
/// inherited files of the same name.
#[must_use]
pub fn prepare_plan(
    inherited: &BTreeMap<String, FileShard>,
    execution_plan: &ExecutionPlan,
    plan: &Plan,
    test_file: &DataFile,
) -> ShardLayout {
    let engines = execution_plan.engines;
    (0..engines)
        .map(|engine_index| {
            let mut files = inherited.clone();
            if execution_plan.csv_split {
                for shard in files.values_mut() {
                    shard.total_splits = shard.total_splits.saturating_mul(engines);
                    shard.current_split = shard
                        .current_split
                        .saturating_mul(engines)
                        .saturating_add(engine_index);
                }
            }
            files.insert(
                test_file.filename.clone(),
                FileShard::whole(&test_file.filename, &test_file.filepath),
            );
            for file in &plan.data {
                let mut shard = FileShard::whole(&file.filename, &file.filepath);
                if execution_plan.csv_split {
                    shard.total_splits = engines;
                    shard.current_split = engine_index;
                }
                files.insert(file.filename.clone(), shard);
            }
            files
        })
        .collect()
}
