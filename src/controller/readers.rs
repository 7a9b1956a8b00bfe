use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::broker::MetricBroker;
use crate::engine::{Engine, MetricStream};
use crate::metrics::MetricsSink;
use crate::model::MetricEvent;

/// Spawns one reader task per registered engine.
///
/// Each reader forwards metrics, in stream order, to the time-series sink and
/// to the fan-out broker.
#[derive(Clone)]
pub struct MetricReaders {
    sink: Arc<dyn MetricsSink>,
    broker: MetricBroker,
}

impl std::fmt::Debug for MetricReaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricReaders")
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

impl MetricReaders {
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>, broker: MetricBroker) -> Self {
        Self { sink, broker }
    }

    pub(crate) fn spawn(&self, engine: Arc<Engine>, stream: MetricStream) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let broker = self.broker.clone();
        tokio::spawn(async move {
            let key = engine.key().clone();
            let mut metrics = stream.into_metrics();
            let mut forwarded: u64 = 0;
            while let Some(metric) = metrics.recv().await {
                sink.observe(&metric);
                if broker.publish(MetricEvent::from(&metric)).is_err() {
                    tracing::warn!("Broker closed, stopping reader of {}", key);
                    break;
                }
                forwarded = forwarded.saturating_add(1);
            }
            tracing::info!("Reader of {} finished after {} metrics", key, forwarded);
        })
    }
}
