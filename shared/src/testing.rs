//! Fakes for the OS and backend collaborators used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::address::{AddressResolver, ResolveError, ResolvedAddress};
use crate::clock::Clock;
use crate::config::{Accuracy, SamplingProfile};
use crate::model::{Coordinate, LocationSample, RideId, UnixTimeMs};
use crate::permission::{OsGrant, OsPermission, PermissionError, PermissionPlatform};
use crate::sampler::{LocationPlatform, SamplerError, WatchId};
use crate::tracking::TrackingRequests;

pub fn sample(lat: f64, lon: f64) -> LocationSample {
    LocationSample::at(Coordinate::new(lat, lon).unwrap())
}

/// Wall clock driven by the runtime's clock, so paused-time tests move ride
/// timestamps. `sleep_device` moves wall time alone, the way a suspended
/// device sees it on wake-up.
pub struct RuntimeClock {
    wall_anchor: UnixTimeMs,
    mono_anchor: Instant,
    slept_ms: AtomicU64,
}

impl RuntimeClock {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            wall_anchor: UnixTimeMs(1_700_000_000_000),
            mono_anchor: Instant::now(),
            slept_ms: AtomicU64::new(0),
        })
    }

    pub fn sleep_device(&self, asleep: Duration) {
        self.slept_ms
            .fetch_add(asleep.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> UnixTimeMs {
        let awake = self.mono_anchor.elapsed().as_millis() as u64;
        self.wall_anchor
            .add_millis(awake + self.slept_ms.load(Ordering::SeqCst))
    }
}

pub struct FakePermissions {
    status: Mutex<OsPermission>,
    answer: Mutex<OsPermission>,
    fail_status: AtomicBool,
    prompts: AtomicUsize,
    held: watch::Sender<bool>,
}

impl FakePermissions {
    fn with(grant: OsGrant, can_ask_again: bool) -> Self {
        let os = OsPermission {
            grant,
            can_ask_again,
        };
        Self {
            status: Mutex::new(os),
            answer: Mutex::new(OsPermission {
                grant: OsGrant::Denied,
                can_ask_again: true,
            }),
            fail_status: AtomicBool::new(false),
            prompts: AtomicUsize::new(0),
            held: watch::channel(false).0,
        }
    }

    pub fn granted() -> Self {
        Self::with(OsGrant::Granted, true)
    }

    pub fn undetermined() -> Self {
        Self::with(OsGrant::Undetermined, true)
    }

    pub fn blocked() -> Self {
        Self::with(OsGrant::Denied, false)
    }

    pub fn retryable_denied() -> Self {
        Self::with(OsGrant::Denied, true)
    }

    pub fn set(&self, grant: OsGrant, can_ask_again: bool) {
        *self.status.lock().unwrap() = OsPermission {
            grant,
            can_ask_again,
        };
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn answer_prompt_with(&self, grant: OsGrant, can_ask_again: bool) {
        *self.answer.lock().unwrap() = OsPermission {
            grant,
            can_ask_again,
        };
    }

    /// Prompts stay open until `release_prompt`.
    pub fn hold_prompt(&self) {
        self.held.send_replace(true);
    }

    pub fn release_prompt(&self, grant: OsGrant) {
        self.answer_prompt_with(grant, true);
        self.held.send_replace(false);
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PermissionPlatform for FakePermissions {
    async fn status(&self) -> Result<OsPermission, PermissionError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(PermissionError::Platform("status unavailable".into()));
        }
        Ok(*self.status.lock().unwrap())
    }

    async fn prompt(&self) -> Result<OsPermission, PermissionError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        let answer = *self.answer.lock().unwrap();
        *self.status.lock().unwrap() = answer;
        Ok(answer)
    }
}

#[derive(Default)]
struct PlatformState {
    next_watch: u64,
    watches: HashMap<u64, mpsc::UnboundedSender<LocationSample>>,
    max_live_watches: usize,
    watch_calls: usize,
    background: bool,
    background_registrations: usize,
    max_concurrent_background: usize,
    current: Option<LocationSample>,
    hang_current: bool,
}

#[derive(Default)]
pub struct FakeLocationPlatform {
    state: Mutex<PlatformState>,
}

impl FakeLocationPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_watches(&self) -> usize {
        self.state.lock().unwrap().watches.len()
    }

    pub fn max_live_watches(&self) -> usize {
        self.state.lock().unwrap().max_live_watches
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().unwrap().watch_calls
    }

    /// Delivers `sample` to every open watch.
    pub fn emit(&self, sample: LocationSample) {
        for sink in self.state.lock().unwrap().watches.values() {
            let _ = sink.send(sample);
        }
    }

    pub fn background_registrations(&self) -> usize {
        self.state.lock().unwrap().background_registrations
    }

    pub fn background_running(&self) -> bool {
        self.state.lock().unwrap().background
    }

    pub fn max_concurrent_background(&self) -> usize {
        self.state.lock().unwrap().max_concurrent_background
    }

    /// Simulates a registration left over from a previous process.
    pub fn preregister_background(&self) {
        let mut state = self.state.lock().unwrap();
        state.background = true;
        state.max_concurrent_background = state.max_concurrent_background.max(1);
    }

    pub fn hang_current_position(&self, hang: bool) {
        self.state.lock().unwrap().hang_current = hang;
    }

    pub fn set_current_position(&self, sample: LocationSample) {
        self.state.lock().unwrap().current = Some(sample);
    }
}

#[async_trait::async_trait]
impl LocationPlatform for FakeLocationPlatform {
    async fn watch_position(
        &self,
        _profile: &SamplingProfile,
        sink: mpsc::UnboundedSender<LocationSample>,
    ) -> Result<WatchId, SamplerError> {
        let mut state = self.state.lock().unwrap();
        state.watch_calls += 1;
        let id = state.next_watch;
        state.next_watch += 1;
        state.watches.insert(id, sink);
        state.max_live_watches = state.max_live_watches.max(state.watches.len());
        Ok(WatchId(id))
    }

    async fn clear_watch(&self, watch: WatchId) {
        self.state.lock().unwrap().watches.remove(&watch.0);
    }

    async fn has_started_background(&self, _task: &str) -> Result<bool, SamplerError> {
        Ok(self.state.lock().unwrap().background)
    }

    async fn start_background(
        &self,
        _task: &str,
        _profile: &SamplingProfile,
    ) -> Result<(), SamplerError> {
        let mut state = self.state.lock().unwrap();
        let concurrent = usize::from(state.background) + 1;
        state.max_concurrent_background = state.max_concurrent_background.max(concurrent);
        state.background = true;
        state.background_registrations += 1;
        Ok(())
    }

    async fn stop_background(&self, _task: &str) -> Result<(), SamplerError> {
        self.state.lock().unwrap().background = false;
        Ok(())
    }

    async fn current_position(&self, _accuracy: Accuracy) -> Result<LocationSample, SamplerError> {
        let (hang, current) = {
            let state = self.state.lock().unwrap();
            (state.hang_current, state.current)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        current.ok_or_else(|| SamplerError::Platform("no fix available".into()))
    }
}

/// Resolves every coordinate to its rounded latitude.
pub struct FakeResolver {
    calls: AtomicUsize,
    resolved: Mutex<Vec<f64>>,
    held: watch::Sender<bool>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            resolved: Mutex::new(Vec::new()),
            held: watch::channel(false).0,
        }
    }

    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Latitudes of finished lookups, in completion order.
    pub fn resolved(&self) -> Vec<f64> {
        self.resolved.lock().unwrap().clone()
    }
}

impl Default for FakeResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AddressResolver for FakeResolver {
    async fn resolve(&self, coordinate: Coordinate) -> Result<ResolvedAddress, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        self.resolved.lock().unwrap().push(coordinate.latitude());
        Ok(ResolvedAddress {
            formatted: format!("{:.4}, {:.4}", coordinate.latitude(), coordinate.longitude()),
            short: format!("{:.2}", coordinate.latitude()),
        })
    }
}

#[derive(Default)]
pub struct RecordingTracking {
    calls: Mutex<Vec<(RideId, bool)>>,
    snapshots: Mutex<Vec<Vec<RideId>>>,
}

impl RecordingTracking {
    pub fn calls(&self) -> Vec<(RideId, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<bool> {
        self.calls.lock().unwrap().last().map(|(_, active)| *active)
    }

    pub fn snapshots(&self) -> Vec<Vec<RideId>> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl TrackingRequests for RecordingTracking {
    fn ride_status_changed(&self, ride: &RideId, active: bool) {
        self.calls.lock().unwrap().push((ride.clone(), active));
    }

    fn active_rides_changed(&self, rides: Vec<RideId>) {
        self.snapshots.lock().unwrap().push(rides);
    }
}
