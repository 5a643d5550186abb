//! Live view of the signed-in user's non-terminal rides.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SubscriptionConfig;
use crate::model::{Ride, RideId, UserId};
use crate::ride::RideMachine;
use crate::store::{RideSetCallback, RideSetEvent, RideStore, StoreError};
use crate::tracking::TrackingRequests;

pub type RideSetListener = Box<dyn Fn(Vec<Ride>) + Send + Sync>;

/// Runs the listener under a lock so `unsubscribe` can wait out a callback
/// that is already running.
struct Delivery {
    listener: RideSetListener,
    closed: Mutex<bool>,
}

impl Delivery {
    fn deliver(&self, rides: Vec<Ride>) -> bool {
        let Ok(closed) = self.closed.lock() else {
            return false;
        };
        if *closed {
            return false;
        }
        (self.listener)(rides);
        true
    }

    fn close(&self) {
        match self.closed.lock() {
            Ok(mut closed) => *closed = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
    }
}

/// Handle for one observation. Dropping it unsubscribes.
pub struct ObserverHandle {
    delivery: Arc<Delivery>,
    task: JoinHandle<()>,
}

impl ObserverHandle {
    /// Idempotent. Once this returns the listener is never called again.
    /// Must not be called from inside the listener itself.
    pub fn unsubscribe(&self) {
        self.delivery.close();
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        self.delivery.closed.lock().map(|c| !*c).unwrap_or(false) && !self.task.is_finished()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

pub struct ActiveRideSetObserver {
    store: Arc<dyn RideStore>,
    config: SubscriptionConfig,
}

impl ActiveRideSetObserver {
    pub fn new(store: Arc<dyn RideStore>, config: SubscriptionConfig) -> Self {
        Self { store, config }
    }

    /// Calls `on_change` with the full active set: first the initial
    /// snapshot, then after every change. Bursts collapse into the newest
    /// snapshot and a dropped stream is resubscribed with backoff.
    pub fn subscribe(
        &self,
        user: UserId,
        on_change: impl Fn(Vec<Ride>) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let delivery = Arc::new(Delivery {
            listener: Box::new(on_change),
            closed: Mutex::new(false),
        });
        let task = tokio::spawn(run_observer(
            Arc::clone(&self.store),
            self.config.clone(),
            user,
            Arc::clone(&delivery),
        ));
        ObserverHandle { delivery, task }
    }
}

#[instrument(skip_all, fields(user_id = %user))]
async fn run_observer(
    store: Arc<dyn RideStore>,
    config: SubscriptionConfig,
    user: UserId,
    delivery: Arc<Delivery>,
) {
    let mut attempt: u32 = 0;
    let mut last_delivered: Option<Vec<Ride>> = None;

    loop {
        let (tx, mut events) = mpsc::unbounded_channel();
        let callback: RideSetCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let subscription = store.subscribe_active_by_user(&user, callback);
        debug!(attempt, "subscribed to active rides");

        let failure = loop {
            let Some(first) = events.recv().await else {
                break StoreError::SubscriptionDropped("event stream closed".into());
            };

            let mut latest = None;
            let mut failure = None;
            let mut next = Some(first);
            while let Some(event) = next {
                match event {
                    RideSetEvent::Snapshot(rides) => latest = Some(rides),
                    RideSetEvent::Error(e) => {
                        failure = Some(e);
                        break;
                    }
                }
                next = events.try_recv().ok();
            }

            if let Some(mut rides) = latest {
                attempt = 0;
                rides.retain(Ride::is_active);
                if last_delivered.as_ref() != Some(&rides) {
                    if !delivery.deliver(rides.clone()) {
                        return;
                    }
                    last_delivered = Some(rides);
                }
            }
            if let Some(e) = failure {
                break e;
            }
        };

        subscription.unsubscribe();
        let delay = config.retry_delay(attempt);
        warn!(error = %failure, attempt, delay_ms = delay.as_millis() as u64, "active ride stream dropped, resubscribing");
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

/// Feeds active-set snapshots to the tracking controller and to the ride
/// machines this client drives.
#[derive(Clone)]
pub struct ActiveRideBridge {
    tracking: Arc<dyn TrackingRequests>,
    machines: Arc<Mutex<HashMap<RideId, RideMachine>>>,
}

impl ActiveRideBridge {
    pub fn new(tracking: Arc<dyn TrackingRequests>) -> Self {
        Self {
            tracking,
            machines: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&self, machine: RideMachine) {
        if let Ok(mut machines) = self.machines.lock() {
            machines.insert(machine.id().clone(), machine);
        }
    }

    pub fn machine(&self, id: &RideId) -> Option<RideMachine> {
        self.machines.lock().ok()?.get(id).cloned()
    }

    pub fn machines(&self) -> Vec<RideMachine> {
        self.machines
            .lock()
            .map(|machines| machines.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn start(&self, observer: &ActiveRideSetObserver, user: UserId) -> ObserverHandle {
        let bridge = self.clone();
        observer.subscribe(user, move |rides| bridge.on_snapshot(rides))
    }

    /// A ride missing from the set has usually reached a terminal status
    /// elsewhere. Its machine re-reads the ride and is released once that
    /// is confirmed.
    fn on_snapshot(&self, rides: Vec<Ride>) {
        let ids: Vec<RideId> = rides.iter().map(|r| r.id.clone()).collect();
        info!(active = ids.len(), "active ride set changed");
        self.tracking.active_rides_changed(ids.clone());

        let present: HashSet<RideId> = ids.into_iter().collect();
        let (updated, departed) = match self.machines.lock() {
            Ok(machines) => {
                let updated: Vec<(RideMachine, Ride)> = rides
                    .into_iter()
                    .filter_map(|ride| machines.get(&ride.id).cloned().map(|m| (m, ride)))
                    .collect();
                let departed: Vec<RideMachine> = machines
                    .iter()
                    .filter(|(id, _)| !present.contains(*id))
                    .map(|(_, machine)| machine.clone())
                    .collect();
                (updated, departed)
            }
            Err(_) => return,
        };

        for (machine, ride) in updated {
            tokio::spawn(async move { machine.apply_remote(ride).await });
        }
        for machine in departed {
            let bridge = self.clone();
            tokio::spawn(async move {
                match machine.refresh().await {
                    Ok(status) if status.is_terminal() => bridge.release(machine.id()),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(ride_id = %machine.id(), error = %e, "refresh of departed ride failed");
                    }
                }
            });
        }
    }

    fn release(&self, id: &RideId) {
        if let Ok(mut machines) = self.machines.lock() {
            if machines.remove(id).is_some() {
                debug!(ride_id = %id, "ride machine released");
            }
        }
    }
}
