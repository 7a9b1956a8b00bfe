//! Handles for individual workers and the protocol used to drive them.
mod kind;
mod protocol;
mod retry;
mod stream;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::{EngineError, SchedulerError};
use crate::model::EngineDataConfig;
use crate::scheduler::{ContainerSpec, EngineScheduler};

pub use kind::{EngineKind, MetricLine};
pub use protocol::{EngineClient, TriggerOutcome};
pub use retry::{RetryExhausted, RetryPolicy};
pub use stream::{ByteStream, MetricStream, StreamTags};

/// Identity of one worker within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId {
    pub project_id: i64,
    pub collection_id: i64,
    pub plan_id: i64,
    pub engine_index: usize,
}

impl EngineId {
    fn resource_name(&self, kind: &str) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            kind, self.project_id, self.collection_id, self.plan_id, self.engine_index
        )
    }

    #[must_use]
    pub fn engine_name(&self) -> String {
        self.resource_name("engine")
    }

    #[must_use]
    pub fn service_name(&self) -> String {
        self.resource_name("service")
    }
}

/// Registry key, stable across re-subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineKey(String);

impl EngineKey {
    #[must_use]
    pub fn new(context: &str, collection_id: i64, plan_id: i64, engine_index: usize) -> Self {
        Self(format!(
            "{}-{}-{}-{}",
            context, collection_id, plan_id, engine_index
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Created = 0,
    Deployed = 1,
    Subscribed = 2,
    Triggered = 3,
    Terminated = 4,
}

impl EngineState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Deployed,
            2 => EngineState::Subscribed,
            3 => EngineState::Triggered,
            4 => EngineState::Terminated,
            _ => EngineState::Created,
        }
    }
}

const NO_RUN: i64 = 0;

#[derive(Debug)]
pub struct Engine {
    id: EngineId,
    key: EngineKey,
    kind: EngineKind,
    address: Option<String>,
    client: EngineClient,
    state: AtomicU8,
    run_id: AtomicI64,
    cancel: watch::Sender<bool>,
}

impl Engine {
    #[must_use]
    pub fn new(context: &str, id: EngineId, kind: EngineKind, client: EngineClient) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            key: EngineKey::new(context, id.collection_id, id.plan_id, id.engine_index),
            id,
            kind,
            address: None,
            client,
            state: AtomicU8::new(EngineState::Created as u8),
            run_id: AtomicI64::new(NO_RUN),
            cancel,
        }
    }

    /// Attach the base URL resolved through the scheduler.
    #[must_use]
    pub fn with_address(mut self, address: String) -> Self {
        self.address = Some(address);
        self
    }

    #[must_use]
    pub const fn id(&self) -> &EngineId {
        &self.id
    }

    #[must_use]
    pub const fn key(&self) -> &EngineKey {
        &self.key
    }

    #[must_use]
    pub const fn kind(&self) -> EngineKind {
        self.kind
    }

    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run id this engine currently serves, if subscribed.
    #[must_use]
    pub fn run_id(&self) -> Option<i64> {
        match self.run_id.load(Ordering::Acquire) {
            NO_RUN => None,
            run_id => Some(run_id),
        }
    }

    fn base(&self) -> Result<&str, EngineError> {
        self.address
            .as_deref()
            .ok_or_else(|| EngineError::AddressUnresolved {
                engine: self.key.to_string(),
            })
    }

    /// Ask the scheduler to materialize this worker.
    ///
    /// # Errors
    ///
    /// Returns the scheduler failure; callers decide whether to retry.
    pub async fn deploy(
        &self,
        scheduler: &dyn EngineScheduler,
        spec: &ContainerSpec,
    ) -> Result<(), SchedulerError> {
        scheduler.deploy_engine(&self.id, spec).await?;
        if self.state() == EngineState::Created {
            self.set_state(EngineState::Deployed);
        }
        Ok(())
    }

    /// Open the worker's metric stream for `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is unknown or the stream cannot be
    /// opened; the engine stays usable for a later attempt.
    pub async fn subscribe(&self, run_id: i64) -> Result<MetricStream, EngineError> {
        let base = self.base()?;
        let body = self.client.open_stream(self.key.as_str(), base).await?;
        self.run_id.store(run_id, Ordering::Release);
        self.set_state(EngineState::Subscribed);
        Ok(MetricStream::new(
            self.key.to_string(),
            self.kind,
            StreamTags {
                collection_id: self.id.collection_id,
                plan_id: self.id.plan_id,
                run_id,
                engine_id: self.id.engine_index,
            },
            body,
            self.cancel.subscribe(),
        ))
    }

    /// Send the engine's share of the input to `POST /start`.
    ///
    /// # Errors
    ///
    /// Returns an error when the body cannot be serialized or every attempt failed.
    pub async fn trigger(&self, config: &EngineDataConfig) -> Result<TriggerOutcome, EngineError> {
        let base = self.base()?;
        let body = serde_json::to_vec(config).map_err(|source| EngineError::Serialize {
            context: "engine data config",
            source,
        })?;
        let outcome = self
            .client
            .start(self.key.as_str(), base, Bytes::from(body))
            .await?;
        match outcome {
            TriggerOutcome::AlreadyRunning => {
                tracing::info!("{} is already triggered", self.key);
            }
            TriggerOutcome::Started => tracing::info!("{} is triggered", self.key),
        }
        self.set_state(EngineState::Triggered);
        Ok(outcome)
    }

    /// Whether the worker is still executing; failures count as idle.
    pub async fn progress(&self) -> bool {
        let base = match self.base() {
            Ok(base) => base,
            Err(err) => {
                tracing::warn!("{}", err);
                return false;
            }
        };
        match self.client.progress(self.key.as_str(), base).await {
            Ok(running) => running,
            Err(err) => {
                tracing::warn!("Progress check failed: {}", err);
                false
            }
        }
    }

    /// Stop the worker and close the local stream.
    ///
    /// With `force` only the local stream is closed. The stream is closed even
    /// when the stop request fails.
    ///
    /// # Errors
    ///
    /// Returns the stop request failure.
    pub async fn terminate(&self, force: bool) -> Result<(), EngineError> {
        let result = if force {
            Ok(())
        } else {
            match self.base() {
                Ok(base) => self.client.stop(self.key.as_str(), base).await,
                Err(err) => Err(err),
            }
        };
        self.close_stream();
        self.set_state(EngineState::Terminated);
        result
    }

    pub async fn reachable(&self, scheduler: &dyn EngineScheduler) -> bool {
        scheduler.service_reachable(&self.id).await
    }

    /// Cancel every stream opened from this handle.
    pub fn close_stream(&self) {
        self.cancel.send_replace(true);
    }

    #[must_use]
    pub fn is_stream_closed(&self) -> bool {
        *self.cancel.borrow()
    }
}
