use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::args::{ControllerArgs, Role};
use crate::engine::{EngineKind, RetryPolicy};
use crate::error::{AppError, AppResult, ConfigError};
use crate::reconcile::ReconcileSettings;
use crate::scheduler::{ContainerSpec, SchedulerKind};

use super::types::{ConfigFile, DurationValue};

const DEFAULT_CONTEXT: &str = "local";
const DEFAULT_MAX_ENGINES: usize = 500;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CPU: &str = "1";
const DEFAULT_MEM: &str = "1Gi";
const DEFAULT_ARTIFACTS_ROOT: &str = "./artifacts";

/// Validated runtime settings of one controller process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub context: String,
    pub role: Role,
    pub scheduler: SchedulerKind,
    pub max_engines_in_collection: usize,
    pub engine_kind: EngineKind,
    pub container: ContainerSpec,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub reconcile: ReconcileSettings,
    pub store_path: Option<PathBuf>,
    pub artifacts_root: PathBuf,
    pub metrics_listen: Option<SocketAddr>,
}

fn duration_or(
    field: &'static str,
    value: Option<&DurationValue>,
    default: Duration,
) -> AppResult<Duration> {
    match value {
        Some(value) => value.to_duration().map_err(|message| {
            AppError::config(ConfigError::InvalidDuration { field, message })
        }),
        None => Ok(default),
    }
}

fn positive<T>(field: &'static str, value: Option<T>, default: T) -> AppResult<T>
where
    T: Copy + PartialEq + Default,
{
    match value {
        Some(value) if value == T::default() => {
            Err(AppError::config(ConfigError::FieldMustBePositive { field }))
        }
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn scheduler_kind(kind: Option<&str>, gateway: Option<&str>) -> AppResult<SchedulerKind> {
    match kind.map(str::trim).unwrap_or("gateway") {
        "gateway" => {
            let value = gateway.ok_or(ConfigError::MissingGateway)?;
            let base_url = url::Url::parse(value).map_err(|source| ConfigError::InvalidGatewayUrl {
                value: value.to_owned(),
                source,
            })?;
            Ok(SchedulerKind::Gateway {
                base_url: base_url.as_str().trim_end_matches('/').to_owned(),
            })
        }
        other => Err(AppError::config(ConfigError::UnsupportedSchedulerKind {
            kind: other.to_owned(),
        })),
    }
}

impl ControllerSettings {
    /// Merge the config file with CLI overrides and apply defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown scheduler or engine kinds, a missing or
    /// malformed gateway URL, zero counts, bad durations and bad listen
    /// addresses.
    pub fn from_config(config: Option<ConfigFile>, args: &ControllerArgs) -> AppResult<Self> {
        let config = config.unwrap_or_default();
        let scheduler = config.scheduler.unwrap_or_default();
        let engine = config.engine.unwrap_or_default();
        let retry = config.retry.unwrap_or_default();
        let reconcile = config.reconcile.unwrap_or_default();
        let ingress = config.ingress.unwrap_or_default();
        let defaults = ReconcileSettings::default();
        let default_retry = RetryPolicy::default();

        let context = args
            .context
            .clone()
            .or(config.context)
            .unwrap_or_else(|| DEFAULT_CONTEXT.to_owned());
        let role = args.role.unwrap_or(if config.distributed_mode.unwrap_or(false) {
            Role::Api
        } else {
            Role::All
        });

        let engine_kind: EngineKind = engine.kind.as_deref().unwrap_or("jmeter").parse()?;
        let container = ContainerSpec {
            engine_kind,
            image: engine
                .image
                .unwrap_or_else(|| engine_kind.default_image().to_owned()),
            cpu: engine.cpu.unwrap_or_else(|| DEFAULT_CPU.to_owned()),
            mem: engine.mem.unwrap_or_else(|| DEFAULT_MEM.to_owned()),
        };

        let metrics_listen = config
            .metrics
            .and_then(|metrics| metrics.listen)
            .map(|value| {
                value
                    .parse::<SocketAddr>()
                    .map_err(|source| ConfigError::InvalidListenAddr { value, source })
            })
            .transpose()?;

        Ok(Self {
            context,
            role,
            scheduler: scheduler_kind(scheduler.kind.as_deref(), scheduler.gateway.as_deref())?,
            max_engines_in_collection: positive(
                "scheduler.max_engines_in_collection",
                scheduler.max_engines_in_collection,
                DEFAULT_MAX_ENGINES,
            )?,
            engine_kind,
            container,
            request_timeout: duration_or(
                "engine.request_timeout",
                engine.request_timeout.as_ref(),
                DEFAULT_REQUEST_TIMEOUT,
            )?,
            retry: RetryPolicy::new(
                positive("retry.attempts", retry.attempts, default_retry.attempts)?,
                duration_or("retry.interval", retry.interval.as_ref(), default_retry.interval)?,
            ),
            reconcile: ReconcileSettings {
                check_interval: duration_or(
                    "reconcile.check_interval",
                    reconcile.check_interval.as_ref(),
                    defaults.check_interval,
                )?,
                check_workers: positive(
                    "reconcile.check_workers",
                    reconcile.check_workers,
                    defaults.check_workers,
                )?,
                purge_interval: duration_or(
                    "reconcile.purge_interval",
                    reconcile.purge_interval.as_ref(),
                    defaults.purge_interval,
                )?,
                cache_prune_interval: duration_or(
                    "reconcile.cache_prune_interval",
                    reconcile.cache_prune_interval.as_ref(),
                    defaults.cache_prune_interval,
                )?,
                resource_interval: duration_or(
                    "reconcile.resource_interval",
                    reconcile.resource_interval.as_ref(),
                    defaults.resource_interval,
                )?,
                gc_duration: duration_or(
                    "scheduler.gc_duration",
                    scheduler.gc_duration.as_ref(),
                    defaults.gc_duration,
                )?,
                on_demand: scheduler.on_demand.unwrap_or(false),
                ingress_lifespan: duration_or(
                    "ingress.lifespan",
                    ingress.lifespan.as_ref(),
                    defaults.ingress_lifespan,
                )?,
                ingress_gc_interval: duration_or(
                    "ingress.gc_interval",
                    ingress.gc_interval.as_ref(),
                    defaults.ingress_gc_interval,
                )?,
            },
            store_path: config.store.and_then(|store| store.path).map(PathBuf::from),
            artifacts_root: PathBuf::from(
                config
                    .artifacts
                    .and_then(|artifacts| artifacts.root)
                    .unwrap_or_else(|| DEFAULT_ARTIFACTS_ROOT.to_owned()),
            ),
            metrics_listen,
        })
    }
}
