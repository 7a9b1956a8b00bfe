use std::collections::BTreeMap;

use serde::Serialize;

/// One observation decoded from an engine's metric stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineMetric {
    pub threads: f64,
    pub latency: f64,
    pub label: String,
    pub status: String,
    pub raw: String,
    pub collection_id: i64,
    pub plan_id: i64,
    pub run_id: i64,
    pub engine_id: usize,
}

/// What stream subscribers receive for each metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricEvent {
    pub collection_id: i64,
    pub plan_id: i64,
    #[serde(rename = "metrics")]
    pub raw: String,
}

impl From<&EngineMetric> for MetricEvent {
    fn from(metric: &EngineMetric) -> Self {
        Self {
            collection_id: metric.collection_id,
            plan_id: metric.plan_id,
            raw: metric.raw.clone(),
        }
    }
}

/// Resource name (`cpu` in millicores, `mem` in bytes) per engine number.
pub type ResourceUsage = BTreeMap<String, BTreeMap<String, f64>>;
