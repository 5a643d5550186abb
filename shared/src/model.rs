use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RideId);
typed_id!(UserId);
typed_id!(DriverId);

impl RideId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

// --- Coordinate: validated, NaN-safe ---

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = CoordinateError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.latitude, raw.longitude)
    }
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    #[must_use]
    pub const fn latitude(self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub const fn longitude(self) -> f64 {
        self.longitude
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        haversine_distance(self, other)
    }

    /// Grid cell key at `decimals` places, used to share resolved addresses
    /// between nearby samples.
    #[must_use]
    pub fn grid_key(self, decimals: u32) -> (i64, i64) {
        let scale = 10f64.powi(decimals as i32);
        (
            (self.latitude * scale).round() as i64,
            (self.longitude * scale).round() as i64,
        )
    }
}

impl TryFrom<(f64, f64)> for Coordinate {
    type Error = CoordinateError;

    fn try_from((lat, lon): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lat, lon)
    }
}

#[must_use]
pub fn haversine_distance(p1: Coordinate, p2: Coordinate) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.latitude - p2.latitude).abs() < EPSILON && (p1.longitude - p2.longitude).abs() < EPSILON
    {
        return 0.0;
    }

    let lat1_rad = p1.latitude.to_radians();
    let lat2_rad = p2.latitude.to_radians();
    let delta_lat = (p2.latitude - p1.latitude).to_radians();
    let delta_lon = (p2.longitude - p1.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// One position fix from the device. Ephemeral: produced, forwarded, dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub coordinate: Coordinate,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub captured_at: Option<UnixTimeMs>,
}

impl LocationSample {
    #[must_use]
    pub const fn at(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            heading: None,
            speed: None,
            accuracy: None,
            captured_at: None,
        }
    }
}

// --- Rides ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    #[default]
    Idle,
    DriverOnTheWay,
    ArrivedPickup,
    PickedUp,
    ArrivedDropoff,
    Completed,
    Canceled,
}

impl RideStatus {
    pub const ALL: [Self; 7] = [
        Self::Idle,
        Self::DriverOnTheWay,
        Self::ArrivedPickup,
        Self::PickedUp,
        Self::ArrivedDropoff,
        Self::Completed,
        Self::Canceled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DriverOnTheWay => "driver_on_the_way",
            Self::ArrivedPickup => "arrived_pickup",
            Self::PickedUp => "picked_up",
            Self::ArrivedDropoff => "arrived_dropoff",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }

    /// The single forward step out of this status, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::DriverOnTheWay),
            Self::DriverOnTheWay => Some(Self::ArrivedPickup),
            Self::ArrivedPickup => Some(Self::PickedUp),
            Self::PickedUp => Some(Self::ArrivedDropoff),
            Self::ArrivedDropoff => Some(Self::Completed),
            Self::Completed | Self::Canceled => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Canceled || self.next() == Some(to)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOrigin {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    User(String),
    Auto(String),
}

impl CancelReason {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::User(text) | Self::Auto(text) => text,
        }
    }

    #[must_use]
    pub const fn origin(&self) -> CancelOrigin {
        match self {
            Self::User(_) => CancelOrigin::User,
            Self::Auto(_) => CancelOrigin::System,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub coordinate: Coordinate,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    pub vehicle: Option<String>,
    pub last_known: Option<Coordinate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub rider_id: UserId,
    pub pickup: Place,
    pub dropoff: Place,
    pub status: RideStatus,
    pub created_at: UnixTimeMs,
    /// Set by the store on every write; orders snapshots of one ride.
    pub updated_at: UnixTimeMs,
    pub fare: Option<f64>,
    pub distance_m: Option<f64>,
    pub duration_s: Option<u64>,
    pub driver: Option<Driver>,
    pub waiting_start_at: Option<UnixTimeMs>,
    pub waiting_end_at: Option<UnixTimeMs>,
    pub completed_at: Option<UnixTimeMs>,
    pub canceled_at: Option<UnixTimeMs>,
    pub cancel_reason: Option<String>,
    pub canceled_by: Option<CancelOrigin>,
}

impl Ride {
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Applies the non-empty fields of `patch`.
    pub fn apply(&mut self, patch: &RidePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(driver) = &patch.driver {
            self.driver = Some(driver.clone());
        }
        if let Some(at) = patch.waiting_start_at {
            self.waiting_start_at = Some(at);
        }
        if let Some(at) = patch.waiting_end_at {
            self.waiting_end_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(fare) = patch.fare {
            self.fare = Some(fare);
        }
        if let Some(at) = patch.canceled_at {
            self.canceled_at = Some(at);
        }
        if let Some(reason) = &patch.cancel_reason {
            self.cancel_reason = Some(reason.clone());
        }
        if let Some(origin) = patch.canceled_by {
            self.canceled_by = Some(origin);
        }
    }
}

/// Client-side request to open a ride. The store assigns nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRide {
    pub rider_id: UserId,
    pub pickup: Place,
    pub dropoff: Place,
    pub fare: Option<f64>,
    pub distance_m: Option<f64>,
    pub duration_s: Option<u64>,
}

impl NewRide {
    #[must_use]
    pub fn into_ride(self, id: RideId, created_at: UnixTimeMs) -> Ride {
        Ride {
            id,
            rider_id: self.rider_id,
            pickup: self.pickup,
            dropoff: self.dropoff,
            status: RideStatus::Idle,
            created_at,
            updated_at: created_at,
            fare: self.fare,
            distance_m: self.distance_m,
            duration_s: self.duration_s,
            driver: None,
            waiting_start_at: None,
            waiting_end_at: None,
            completed_at: None,
            canceled_at: None,
            cancel_reason: None,
            canceled_by: None,
        }
    }
}

/// Partial update written to the ride store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RidePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RideStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<Driver>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_start_at: Option<UnixTimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_end_at: Option<UnixTimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<UnixTimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fare: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<UnixTimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_by: Option<CancelOrigin>,
}

impl RidePatch {
    #[must_use]
    pub fn status(status: RideStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}
