//! Short-lived memo of file checks so repeated lookups skip filesystem I/O.

use bridge_traits::Clock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Judgment {
    valid: bool,
    checked_at_ms: i64,
}

pub struct ValidationCache {
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    judgments: Mutex<HashMap<String, Judgment>>,
}

impl ValidationCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            judgments: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh judgment for `id`, or `None` when absent or expired.
    pub fn is_valid(&self, id: &str) -> Option<bool> {
        let now = self.clock.unix_timestamp_millis();
        let mut judgments = self.judgments.lock();

        match judgments.get(id) {
            Some(j) if now.saturating_sub(j.checked_at_ms) < self.ttl_ms => Some(j.valid),
            Some(_) => {
                judgments.remove(id);
                None
            }
            None => None,
        }
    }

    pub fn record(&self, id: &str, valid: bool) {
        let checked_at_ms = self.clock.unix_timestamp_millis();
        self.judgments
            .lock()
            .insert(id.to_string(), Judgment { valid, checked_at_ms });
    }

    pub fn invalidate(&self, id: &str) {
        self.judgments.lock().remove(id);
    }

    pub fn clear(&self) {
        self.judgments.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.judgments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.judgments.lock().is_empty()
    }
}
