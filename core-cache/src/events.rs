//! Optional fan-out of cache events onto the shared [`EventBus`].

use core_runtime::events::{CacheEvent, CoreEvent, EventBus, NetworkEvent};
use parking_lot::RwLock;
use tracing::trace;

#[derive(Default)]
pub struct EventEmitter {
    bus: RwLock<Option<EventBus>>,
}

impl EventEmitter {
    pub fn new(bus: Option<EventBus>) -> Self {
        Self {
            bus: RwLock::new(bus),
        }
    }

    pub fn set_bus(&self, bus: EventBus) {
        *self.bus.write() = Some(bus);
    }

    pub fn cache(&self, event: CacheEvent) {
        self.emit(CoreEvent::Cache(event));
    }

    pub fn network(&self, event: NetworkEvent) {
        self.emit(CoreEvent::Network(event));
    }

    fn emit(&self, event: CoreEvent) {
        let bus = self.bus.read().clone();
        if let Some(bus) = bus {
            // No subscribers is not an error for the cache
            if bus.emit(event).is_err() {
                trace!("Cache event dropped: no subscribers");
            }
        }
    }
}
