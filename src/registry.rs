//! Registry mapping queue names to their processors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{job::QueueName, processor::Processor};

/// Keeps track of which processor handles which queue. Registration is
/// last-writer-wins and safe to call while workers are already looking
/// queues up.
pub(crate) struct ProcessorRegistry {
    processors: RwLock<HashMap<QueueName, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, queue: QueueName, processor: Arc<dyn Processor>) {
        self.processors
            .write()
            .expect("Couldn't lock processor registry")
            .insert(queue, processor);
    }

    pub fn lookup(&self, queue: &QueueName) -> Option<Arc<dyn Processor>> {
        self.processors
            .read()
            .expect("Couldn't lock processor registry")
            .get(queue)
            .cloned()
    }
}
