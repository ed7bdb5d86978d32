//! Static mapping from queue name to its work store. Immutable after startup so lookups
//! stay lock-free on the dispatcher's hot path.

use std::collections::HashMap;
use std::sync::Arc;

use dispatcher_common::QueueStore;

#[derive(Clone, Default)]
pub struct QueueRegistry {
    stores: HashMap<String, Arc<dyn QueueStore>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, store: Arc<dyn QueueStore>) {
        self.stores.insert(name.into(), store);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn QueueStore>> {
        self.stores.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn QueueStore>> {
        self.stores.values()
    }
}
