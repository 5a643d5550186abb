//! Backend collaborators: the ride and user document stores.
//!
//! Both are consumed through traits so the shell can plug in its managed
//! document store client. `memory` holds in-process implementations.

pub mod memory;

use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::{AppError, ErrorKind};
use crate::model::{Coordinate, NewRide, Ride, RideId, RidePatch, UnixTimeMs, UserId};

pub use self::memory::{MemoryRideStore, MemoryUserStore};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("ride not found: {0}")]
    NotFound(String),
    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::Unavailable(_) | StoreError::Rejected(_) => ErrorKind::SyncFailure,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::SubscriptionDropped(_) => ErrorKind::SubscriptionError,
        };
        AppError::new(kind, e.to_string())
    }
}

/// What a live ride-set query pushes to its subscriber. Every snapshot is
/// the full current result set, never a delta.
#[derive(Debug, Clone, PartialEq)]
pub enum RideSetEvent {
    Snapshot(Vec<Ride>),
    Error(StoreError),
}

pub type RideSetCallback = Arc<dyn Fn(RideSetEvent) + Send + Sync>;

#[async_trait::async_trait]
pub trait RideStore: Send + Sync {
    async fn create(&self, ride: NewRide) -> Result<Ride, StoreError>;
    /// Writes `patch` and returns the ride as the backend now holds it.
    async fn update(&self, id: &RideId, patch: &RidePatch) -> Result<Ride, StoreError>;
    async fn get_by_id(&self, id: &RideId) -> Result<Option<Ride>, StoreError>;
    /// Live query over `user`'s rides that are neither completed nor canceled.
    fn subscribe_active_by_user(&self, user: &UserId, callback: RideSetCallback) -> Subscription;
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    async fn update_last_known_location(
        &self,
        user: &UserId,
        coordinate: Coordinate,
        at: UnixTimeMs,
    ) -> Result<(), StoreError>;
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Cancels a live subscription when unsubscribed or dropped.
pub struct Subscription {
    cancel: Mutex<Option<CancelFn>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().ok().and_then(|mut c| c.take());
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.lock().map(|c| c.is_some()).unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
