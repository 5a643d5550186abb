#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use ride_shared::{
    Accuracy, AddressResolver, Clock, Coordinate, CoreConfig, CoreDeps, LocationPlatform,
    LocationSample, MemoryRideStore, MemoryUserStore, NewRide, OsGrant, OsPermission,
    PermissionError, PermissionPlatform, Place, ResolveError, ResolvedAddress, RideCore,
    SamplerError, SamplingProfile, UnixTimeMs, UserId, WatchId,
};

/// Wall clock that follows the (possibly paused) runtime, plus time the
/// device spent suspended.
pub struct DeviceClock {
    wall_anchor: UnixTimeMs,
    mono_anchor: Instant,
    slept_ms: AtomicU64,
}

impl DeviceClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wall_anchor: UnixTimeMs::now(),
            mono_anchor: Instant::now(),
            slept_ms: AtomicU64::new(0),
        })
    }

    pub fn sleep_device(&self, asleep: Duration) {
        self.slept_ms
            .fetch_add(asleep.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for DeviceClock {
    fn now(&self) -> UnixTimeMs {
        let awake = self.mono_anchor.elapsed().as_millis() as u64;
        self.wall_anchor
            .add_millis(awake + self.slept_ms.load(Ordering::SeqCst))
    }
}

pub struct Os {
    permission: Mutex<OsPermission>,
    prompts: AtomicUsize,
    watches: Mutex<HashMap<u64, mpsc::UnboundedSender<LocationSample>>>,
    next_watch: AtomicUsize,
    background: Mutex<Option<SamplingProfile>>,
}

impl Os {
    pub fn new(grant: OsGrant, can_ask_again: bool) -> Arc<Self> {
        Arc::new(Self {
            permission: Mutex::new(OsPermission {
                grant,
                can_ask_again,
            }),
            prompts: AtomicUsize::new(0),
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicUsize::new(0),
            background: Mutex::new(None),
        })
    }

    pub fn set_permission(&self, grant: OsGrant, can_ask_again: bool) {
        *self.permission.lock().unwrap() = OsPermission {
            grant,
            can_ask_again,
        };
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn live_watches(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    pub fn background_profile(&self) -> Option<SamplingProfile> {
        self.background.lock().unwrap().clone()
    }

    pub fn move_to(&self, lat: f64, lon: f64) {
        let fix = LocationSample::at(Coordinate::new(lat, lon).unwrap());
        for sink in self.watches.lock().unwrap().values() {
            let _ = sink.send(fix);
        }
    }
}

#[async_trait::async_trait]
impl PermissionPlatform for Os {
    async fn status(&self) -> Result<OsPermission, PermissionError> {
        Ok(*self.permission.lock().unwrap())
    }

    async fn prompt(&self) -> Result<OsPermission, PermissionError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let mut permission = self.permission.lock().unwrap();
        permission.grant = OsGrant::Granted;
        Ok(*permission)
    }
}

#[async_trait::async_trait]
impl LocationPlatform for Os {
    async fn watch_position(
        &self,
        _profile: &SamplingProfile,
        sink: mpsc::UnboundedSender<LocationSample>,
    ) -> Result<WatchId, SamplerError> {
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst) as u64;
        self.watches.lock().unwrap().insert(id, sink);
        Ok(WatchId(id))
    }

    async fn clear_watch(&self, watch: WatchId) {
        self.watches.lock().unwrap().remove(&watch.0);
    }

    async fn has_started_background(&self, _task: &str) -> Result<bool, SamplerError> {
        Ok(self.background.lock().unwrap().is_some())
    }

    async fn start_background(
        &self,
        _task: &str,
        profile: &SamplingProfile,
    ) -> Result<(), SamplerError> {
        let mut background = self.background.lock().unwrap();
        assert!(background.is_none(), "background task registered twice");
        *background = Some(profile.clone());
        Ok(())
    }

    async fn stop_background(&self, _task: &str) -> Result<(), SamplerError> {
        *self.background.lock().unwrap() = None;
        Ok(())
    }

    async fn current_position(&self, _accuracy: Accuracy) -> Result<LocationSample, SamplerError> {
        Ok(LocationSample::at(Coordinate::new(6.45, 3.39).unwrap()))
    }
}

pub struct StreetResolver;

#[async_trait::async_trait]
impl AddressResolver for StreetResolver {
    async fn resolve(&self, coordinate: Coordinate) -> Result<ResolvedAddress, ResolveError> {
        Ok(ResolvedAddress {
            formatted: format!("{:.3} Marina Road, Lagos", coordinate.latitude()),
            short: "Marina Road".into(),
        })
    }
}

pub struct Harness {
    pub core: RideCore,
    pub os: Arc<Os>,
    pub rides: Arc<MemoryRideStore>,
    pub users: Arc<MemoryUserStore>,
    pub clock: Arc<DeviceClock>,
}

pub fn harness(grant: OsGrant, can_ask_again: bool) -> Harness {
    let clock = DeviceClock::new();
    let os = Os::new(grant, can_ask_again);
    let rides = Arc::new(MemoryRideStore::new(clock.clone()));
    let users = Arc::new(MemoryUserStore::new());
    let core = RideCore::start(
        CoreDeps {
            permissions: os.clone(),
            location: os.clone(),
            rides: rides.clone(),
            users: users.clone(),
            resolver: Arc::new(StreetResolver),
            clock: clock.clone(),
        },
        CoreConfig::default(),
    )
    .unwrap();
    Harness {
        core,
        os,
        rides,
        users,
        clock,
    }
}

pub fn rider() -> UserId {
    UserId::new("rider-42")
}

pub fn trip() -> NewRide {
    let place = |lat: f64, name: &str| Place {
        coordinate: Coordinate::new(lat, 3.39).unwrap(),
        address: Some(name.into()),
    };
    NewRide {
        rider_id: rider(),
        pickup: place(6.45, "Marina"),
        dropoff: place(6.60, "Ikeja"),
        fare: Some(4200.0),
        distance_m: Some(18_500.0),
        duration_s: Some(2_400),
    }
}

pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
