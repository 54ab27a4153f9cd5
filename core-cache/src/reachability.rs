//! # Reachability
//!
//! Cached view of whether the device can reach the network. Observations
//! from the host monitor's change stream update the view immediately; a
//! direct check is made only when the last observation is older than the
//! re-check interval. Without a monitor the device is assumed online.

use crate::events::EventEmitter;
use bridge_traits::{Clock, NetworkMonitor};
use core_runtime::events::NetworkEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Observation {
    online: bool,
    observed_at_ms: i64,
}

pub struct Reachability {
    monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Arc<dyn Clock>,
    recheck_ms: i64,
    last: Mutex<Option<Observation>>,
}

impl Reachability {
    pub fn new(
        monitor: Option<Arc<dyn NetworkMonitor>>,
        clock: Arc<dyn Clock>,
        recheck: Duration,
    ) -> Self {
        Self {
            monitor,
            clock,
            recheck_ms: i64::try_from(recheck.as_millis()).unwrap_or(i64::MAX),
            last: Mutex::new(None),
        }
    }

    /// Whether the device is online, probing the monitor when the cached
    /// observation is stale.
    pub async fn is_online(&self) -> bool {
        let monitor = match &self.monitor {
            Some(monitor) => monitor,
            None => return true,
        };

        let now = self.clock.unix_timestamp_millis();
        if let Some(obs) = *self.last.lock() {
            if now.saturating_sub(obs.observed_at_ms) < self.recheck_ms {
                return obs.online;
            }
        }

        let online = monitor.is_connected().await;
        self.observe(online);
        online
    }

    /// Last observation without probing.
    pub fn last_known(&self) -> Option<bool> {
        if self.monitor.is_none() {
            return Some(true);
        }
        self.last.lock().map(|obs| obs.online)
    }

    /// Record an observation. Returns `true` when it differs from the
    /// previous one.
    pub fn observe(&self, online: bool) -> bool {
        let observed_at_ms = self.clock.unix_timestamp_millis();
        let mut last = self.last.lock();
        let changed = last.map_or(true, |prev| prev.online != online);
        *last = Some(Observation {
            online,
            observed_at_ms,
        });
        changed
    }

    /// Follow the monitor's change stream until it ends, publishing flips.
    ///
    /// Returns `None` when there is no monitor or it cannot be subscribed to;
    /// checks on demand still work in that case.
    pub async fn watch(self: Arc<Self>, events: Arc<EventEmitter>) -> Option<JoinHandle<()>> {
        let monitor = self.monitor.clone()?;

        let mut stream = match monitor.subscribe_changes().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Network change subscription unavailable");
                return None;
            }
        };

        let handle = tokio::spawn(async move {
            while let Some(info) = stream.next().await {
                let online = info.is_connected();
                if self.observe(online) {
                    info!(online, "Connectivity changed");
                    events.network(NetworkEvent::ConnectivityChanged { online });
                }
            }
            debug!("Network change stream ended");
        });

        Some(handle)
    }
}
