use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::util::stoppable::StopSignal;

pub type HealthCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Tracks whether the client is in contact with the network. Every successful poll marks the
///  network healthy; going without one for longer than the timeout marks it unhealthy.
///  Callbacks are invoked on transitions only.
pub struct HealthTracker {
    healthy: watch::Sender<bool>,
    callbacks: Mutex<BTreeMap<u64, HealthCallback>>,
    next_callback_id: AtomicU64,
    last_contact: Mutex<Option<Instant>>,
    timeout: Duration,
}

impl HealthTracker {
    pub fn new(timeout: Duration) -> HealthTracker {
        let (healthy, _) = watch::channel(false);
        HealthTracker {
            healthy,
            callbacks: Default::default(),
            next_callback_id: AtomicU64::new(1),
            last_contact: Default::default(),
            timeout,
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self.healthy.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.healthy.subscribe()
    }

    /// returns an ID for removing the callback
    pub fn add_health_callback(&self, callback: HealthCallback) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().unwrap().insert(id, callback);
        id
    }

    pub fn remove_health_callback(&self, id: u64) {
        self.callbacks.lock().unwrap().remove(&id);
    }

    /// called after every successful exchange with the network
    pub fn contact(&self) {
        *self.last_contact.lock().unwrap() = Some(Instant::now());
        self.report(true);
    }

    pub fn report(&self, healthy: bool) {
        let changed = self.healthy.send_if_modified(|current| {
            if *current == healthy {
                false
            }
            else {
                *current = healthy;
                true
            }
        });
        if !changed {
            return;
        }

        if healthy {
            info!("network is healthy");
        }
        else {
            warn!("network is unhealthy");
        }

        let callbacks = self.callbacks.lock().unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for callback in callbacks {
            callback(healthy);
        }
    }

    fn check_timeout(&self) {
        let last_contact = *self.last_contact.lock().unwrap();
        let timed_out = match last_contact {
            Some(t) => t.elapsed() > self.timeout,
            None => false,
        };
        if timed_out && self.is_healthy() {
            debug!("no contact with the network for more than {:?}", self.timeout);
            self.report(false);
        }
    }

    pub async fn run_timeout_monitor(self: Arc<Self>, stop: StopSignal) {
        let mut interval = time::interval(self.timeout / 4);
        loop {
            select! {
                _ = interval.tick() => self.check_timeout(),
                _ = stop.stopped() => break,
            }
        }
        debug!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::util::stoppable::Stoppable;
    use super::*;

    fn recording_callback() -> (HealthCallback, Arc<Mutex<Vec<bool>>>) {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let recorded2 = recorded.clone();
        (Arc::new(move |h| recorded2.lock().unwrap().push(h)), recorded)
    }

    #[test]
    fn test_callbacks_on_transitions_only() {
        let tracker = HealthTracker::new(Duration::from_secs(30));
        let (callback, recorded) = recording_callback();
        tracker.add_health_callback(callback);

        tracker.report(false);
        tracker.report(true);
        tracker.report(true);
        tracker.report(false);

        assert_eq!(*recorded.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_remove_callback() {
        let tracker = HealthTracker::new(Duration::from_secs(30));
        let (callback, recorded) = recording_callback();
        let id = tracker.add_health_callback(callback);
        tracker.remove_health_callback(id);

        tracker.report(true);
        assert!(recorded.lock().unwrap().is_empty());
        assert!(tracker.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_monitor() {
        let tracker = Arc::new(HealthTracker::new(Duration::from_secs(30)));
        let mut receiver = tracker.subscribe();

        let mut stoppable = Stoppable::new("health");
        stoppable.spawn("monitor", tracker.clone().run_timeout_monitor(stoppable.signal()));

        tracker.contact();
        assert!(tracker.is_healthy());

        time::sleep(Duration::from_secs(20)).await;
        assert!(tracker.is_healthy());

        time::sleep(Duration::from_secs(20)).await;
        assert!(!tracker.is_healthy());
        assert!(receiver.has_changed().unwrap());
        assert!(!*receiver.borrow_and_update());

        stoppable.stop(Duration::from_secs(1)).await.unwrap();
    }
}
