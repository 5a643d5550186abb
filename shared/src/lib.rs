// lib.rs - Location tracking and ride lifecycle core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod address;
pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod observer;
pub mod permission;
pub mod ride;
pub mod sampler;
pub mod store;
pub mod tracking;

#[cfg(test)]
mod testing;

pub use crate::address::{AddressResolver, ResolveError, ResolvedAddress};
pub use crate::clock::{Clock, SharedClock, SystemClock};
pub use crate::config::{
    Accuracy, ConfigError, CoreConfig, SamplingProfile, SearchDeadlineConfig, SubscriptionConfig,
    TrackingConfig,
};
pub use crate::app::{CoreDeps, RideCore};
pub use crate::error::{AppError, AppResult, CallToAction, ErrorKind, ErrorSeverity, UserFacingError};
pub use crate::model::{
    CancelOrigin, CancelReason, Coordinate, Driver, DriverId, LocationSample, NewRide, Place, Ride,
    RideId, RidePatch, RideStatus, UnixTimeMs, UserId,
};
pub use crate::observer::{ActiveRideBridge, ActiveRideSetObserver, ObserverHandle};
pub use crate::permission::{
    OsGrant, OsPermission, PermissionError, PermissionGate, PermissionPlatform, PermissionState,
};
pub use crate::ride::{ActionOutcome, RideDeps, RideError, RideMachine, RideView, SearchPhase, Transition};
pub use crate::sampler::{LocationPlatform, LocationSampler, SampleStream, SamplerError, WatchId};
pub use crate::store::{
    MemoryRideStore, MemoryUserStore, RideSetCallback, RideSetEvent, RideStore, StoreError,
    Subscription, UserStore,
};
pub use crate::tracking::{
    decide, DisclosureState, TrackingController, TrackingDeps, TrackingHandle, TrackingMode,
    TrackingRequests, TrackingStatus,
};
