use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::{RideSetCallback, RideSetEvent, RideStore, StoreError, Subscription, UserStore};
use crate::clock::SharedClock;
use crate::model::{Coordinate, NewRide, Ride, RideId, RidePatch, UnixTimeMs, UserId};

#[derive(Default)]
struct RideTable {
    rides: HashMap<RideId, Ride>,
    subscribers: HashMap<u64, (UserId, RideSetCallback)>,
    next_subscriber: u64,
}

impl RideTable {
    fn active_for(&self, user: &UserId) -> Vec<Ride> {
        let mut rides: Vec<Ride> = self
            .rides
            .values()
            .filter(|r| &r.rider_id == user && r.is_active())
            .cloned()
            .collect();
        rides.sort_by_key(|r| r.created_at);
        rides
    }

    fn listeners_for(&self, user: &UserId) -> Vec<RideSetCallback> {
        self.subscribers
            .values()
            .filter(|(u, _)| u == user)
            .map(|(_, cb)| cb.clone())
            .collect()
    }
}

/// In-process ride store with live queries and failure injection.
pub struct MemoryRideStore {
    table: Arc<Mutex<RideTable>>,
    clock: SharedClock,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryRideStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            table: Arc::new(Mutex::new(RideTable::default())),
            clock,
            fail_writes: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Makes every subsequent create/update fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stores `ride` as-is, as if loaded from an earlier session.
    pub fn insert(&self, ride: Ride) {
        let user = ride.rider_id.clone();
        if let Ok(mut table) = self.table.lock() {
            table.rides.insert(ride.id.clone(), ride);
        }
        self.notify(&user);
    }

    /// Applies a change made by another party (e.g. the driver app).
    pub fn apply_remote(&self, id: &RideId, patch: &RidePatch) -> Option<Ride> {
        let now = self.clock.now();
        let updated = {
            let mut table = self.table.lock().ok()?;
            let ride = table.rides.get_mut(id)?;
            ride.apply(patch);
            ride.updated_at = ride.updated_at.max(now);
            ride.clone()
        };
        self.notify(&updated.rider_id);
        Some(updated)
    }

    /// Pushes a stream error to every subscriber of `user`.
    pub fn inject_subscription_error(&self, user: &UserId, reason: &str) {
        let listeners = match self.table.lock() {
            Ok(table) => table.listeners_for(user),
            Err(_) => return,
        };
        for listener in listeners {
            listener(RideSetEvent::Error(StoreError::SubscriptionDropped(
                reason.to_string(),
            )));
        }
    }

    pub fn ride(&self, id: &RideId) -> Option<Ride> {
        self.table.lock().ok()?.rides.get(id).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.table.lock().map(|t| t.subscribers.len()).unwrap_or(0)
    }

    fn notify(&self, user: &UserId) {
        let (snapshot, listeners) = match self.table.lock() {
            Ok(table) => (table.active_for(user), table.listeners_for(user)),
            Err(_) => return,
        };
        for listener in listeners {
            listener(RideSetEvent::Snapshot(snapshot.clone()));
        }
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RideStore for MemoryRideStore {
    async fn create(&self, ride: NewRide) -> Result<Ride, StoreError> {
        self.before_write().await?;
        let ride = ride.into_ride(RideId::generate(), self.clock.now());
        self.insert(ride.clone());
        debug!(ride_id = %ride.id, "ride created");
        Ok(ride)
    }

    async fn update(&self, id: &RideId, patch: &RidePatch) -> Result<Ride, StoreError> {
        self.before_write().await?;
        self.apply_remote(id, patch)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_by_id(&self, id: &RideId) -> Result<Option<Ride>, StoreError> {
        Ok(self.ride(id))
    }

    fn subscribe_active_by_user(&self, user: &UserId, callback: RideSetCallback) -> Subscription {
        let (key, snapshot) = match self.table.lock() {
            Ok(mut table) => {
                let key = table.next_subscriber;
                table.next_subscriber += 1;
                table
                    .subscribers
                    .insert(key, (user.clone(), callback.clone()));
                (key, table.active_for(user))
            }
            Err(_) => {
                callback(RideSetEvent::Error(StoreError::Unavailable(
                    "ride table poisoned".into(),
                )));
                return Subscription::noop();
            }
        };
        callback(RideSetEvent::Snapshot(snapshot));

        let table = Arc::clone(&self.table);
        Subscription::new(move || {
            if let Ok(mut table) = table.lock() {
                table.subscribers.remove(&key);
            }
        })
    }
}

/// Last-known locations written by the tracking controller.
#[derive(Default)]
pub struct MemoryUserStore {
    locations: Mutex<HashMap<UserId, Vec<(Coordinate, UnixTimeMs)>>>,
    fail_writes: AtomicBool,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn last_known(&self, user: &UserId) -> Option<Coordinate> {
        self.locations
            .lock()
            .ok()?
            .get(user)
            .and_then(|history| history.last())
            .map(|(c, _)| *c)
    }

    pub fn write_count(&self, user: &UserId) -> usize {
        self.locations
            .lock()
            .map(|l| l.get(user).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl UserStore for MemoryUserStore {
    async fn update_last_known_location(
        &self,
        user: &UserId,
        coordinate: Coordinate,
        at: UnixTimeMs,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.locations
            .lock()
            .map_err(|_| StoreError::Unavailable("location table poisoned".into()))?
            .entry(user.clone())
            .or_default()
            .push((coordinate, at));
        Ok(())
    }
}
