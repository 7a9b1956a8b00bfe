use std::time::Duration;

use serde::Deserialize;

/// On-disk configuration; every field is optional and defaulted in
/// [`super::ControllerSettings`].
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub context: Option<String>,
    /// Split the API role and the reconciler role across processes.
    pub distributed_mode: Option<bool>,
    pub scheduler: Option<SchedulerConfig>,
    pub engine: Option<EngineConfig>,
    pub retry: Option<RetryConfig>,
    pub reconcile: Option<ReconcileConfig>,
    pub ingress: Option<IngressConfig>,
    pub store: Option<StoreConfig>,
    pub artifacts: Option<ArtifactsConfig>,
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SchedulerConfig {
    pub kind: Option<String>,
    pub gateway: Option<String>,
    pub gc_duration: Option<DurationValue>,
    pub on_demand: Option<bool>,
    pub max_engines_in_collection: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EngineConfig {
    pub kind: Option<String>,
    pub image: Option<String>,
    pub cpu: Option<String>,
    pub mem: Option<String>,
    pub request_timeout: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryConfig {
    pub attempts: Option<u32>,
    pub interval: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileConfig {
    pub check_interval: Option<DurationValue>,
    pub check_workers: Option<usize>,
    pub purge_interval: Option<DurationValue>,
    pub cache_prune_interval: Option<DurationValue>,
    pub resource_interval: Option<DurationValue>,
}

/// Project ingress garbage collection.
#[derive(Debug, Default, Deserialize)]
pub struct IngressConfig {
    pub lifespan: Option<DurationValue>,
    pub gc_interval: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file; the in-memory store is used when unset.
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ArtifactsConfig {
    pub root: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(0) => Err("Duration must be > 0.".to_owned()),
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(text) => super::parse_duration_value(text),
        }
    }
}
