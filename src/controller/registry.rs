use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::{Engine, EngineKey, MetricStream};

use super::readers::MetricReaders;

/// Result of handing a freshly subscribed engine to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Duplicate,
}

/// Engines with an open metric stream, at most one per key.
#[derive(Debug)]
pub struct ConnectedEngines {
    context: String,
    engines: DashMap<EngineKey, Arc<Engine>>,
    readers: MetricReaders,
}

impl ConnectedEngines {
    #[must_use]
    pub fn new(context: &str, readers: MetricReaders) -> Self {
        Self {
            context: context.to_owned(),
            engines: DashMap::new(),
            readers,
        }
    }

    /// Insert the engine if its key is free and start its reader.
    ///
    /// A duplicate closes the new stream and drops the handle.
    pub fn register(&self, engine: Arc<Engine>, stream: MetricStream) -> Registration {
        match self.engines.entry(engine.key().clone()) {
            Entry::Occupied(_) => {
                let key = engine.key().clone();
                engine.close_stream();
                stream.close();
                tracing::info!("Duplicate stream of engine {} is closed", key);
                Registration::Duplicate
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&engine));
                tracing::info!("Engine {} is subscribed", engine.key());
                self.readers.spawn(engine, stream);
                Registration::Registered
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &EngineKey) -> Option<Arc<Engine>> {
        self.engines.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, key: &EngineKey) -> Option<Arc<Engine>> {
        self.engines.remove(key).map(|(_, engine)| engine)
    }

    /// Registered engines among `0..engines` of a plan.
    #[must_use]
    pub fn plan_engines(&self, collection_id: i64, plan_id: i64, engines: usize) -> Vec<Arc<Engine>> {
        (0..engines)
            .filter_map(|idx| self.get(&EngineKey::new(&self.context, collection_id, plan_id, idx)))
            .collect()
    }

    #[must_use]
    pub fn contains_plan(&self, collection_id: i64, plan_id: i64, engines: usize) -> bool {
        (0..engines).any(|idx| {
            self.engines
                .contains_key(&EngineKey::new(&self.context, collection_id, plan_id, idx))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<EngineKey> {
        let mut keys: Vec<EngineKey> = self.engines.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }
}
