//! Tracking mode controller.
//!
//! Every input (session changes, ride activity, samples, permission
//! answers, address lookups, sampler results) is a [`Command`] on one queue,
//! handled by a single loop that owns all controller state. The loop never
//! touches the OS sampler itself: it sends ordered [`SamplerOp`]s to a
//! worker task, which coalesces them so only the newest request is applied.
//! Results come back tagged with the generation that requested them, and
//! anything older than the current generation is dropped.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::address::{AddressCache, AddressDebouncer, AddressResolver, ResolveError, ResolveTicket, ResolvedAddress};
use crate::clock::SharedClock;
use crate::config::{ConfigError, SamplingProfile, TrackingConfig};
use crate::error::{AppError, AppResult, ErrorKind, UserFacingError};
use crate::model::{Coordinate, LocationSample, RideId, UnixTimeMs, UserId};
use crate::permission::PermissionState;
use crate::sampler::{LocationSampler, SampleStream, SamplerError};
use crate::store::UserStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    #[default]
    Offline,
    Passive,
    Ride,
    Invisible,
}

impl TrackingMode {
    #[must_use]
    pub const fn has_sampler(self) -> bool {
        matches!(self, Self::Passive | Self::Ride)
    }
}

/// Mode for a session/ride signal pair.
#[must_use]
pub const fn decide(has_session: bool, has_active_ride: bool) -> TrackingMode {
    match (has_session, has_active_ride) {
        (false, _) => TrackingMode::Offline,
        (true, true) => TrackingMode::Ride,
        (true, false) => TrackingMode::Passive,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureState {
    #[default]
    NotShown,
    /// The UI should present the background-location explanation.
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrackingStatus {
    pub mode: TrackingMode,
    pub sampler_running: bool,
    pub permission: PermissionState,
    pub missing_permission: bool,
    pub disclosure: DisclosureState,
    pub last_sample: Option<LocationSample>,
    pub address: Option<ResolvedAddress>,
    pub last_error: Option<UserFacingError>,
}

/// Ride-side view of the controller.
pub trait TrackingRequests: Send + Sync {
    /// Reports whether `ride` currently counts as active.
    fn ride_status_changed(&self, ride: &RideId, active: bool);
    /// Replaces the whole active set with a backend snapshot.
    fn active_rides_changed(&self, rides: Vec<RideId>);
}

pub struct TrackingDeps {
    pub sampler: Arc<LocationSampler>,
    pub users: Arc<dyn UserStore>,
    pub resolver: Arc<dyn AddressResolver>,
    pub clock: SharedClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SamplerOp {
    generation: u64,
    mode: TrackingMode,
}

#[derive(Debug)]
enum ApplyOutcome {
    Running,
    Stopped,
    Failed(SamplerError),
}

enum Command {
    Session(Option<UserId>),
    ActiveRides(Vec<RideId>),
    RideActivity { ride: RideId, active: bool },
    StartTracking(TrackingMode),
    StopTracking,
    PermissionChanged,
    TriggerDisclosure,
    DisclosureAnswered(bool),
    PermissionResolved(PermissionState),
    SamplerApplied { generation: u64, outcome: ApplyOutcome },
    Sample { generation: u64, sample: LocationSample },
    BackgroundSamples(Vec<LocationSample>),
    OneShot(Result<LocationSample, SamplerError>),
    AddressResolved {
        seq: u64,
        coordinate: Coordinate,
        result: Result<ResolvedAddress, ResolveError>,
    },
    Settle(oneshot::Sender<Option<TrackingStatus>>),
    Shutdown,
}

/// Cloneable front door to the controller loop.
#[derive(Clone)]
pub struct TrackingHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TrackingStatus>,
    sampler: Arc<LocationSampler>,
    one_shot_timeout: Duration,
}

impl TrackingHandle {
    fn send(&self, command: Command) -> AppResult<()> {
        self.commands.send(command).map_err(|_| {
            AppError::new(ErrorKind::InvalidState, "tracking controller is not running")
        })
    }

    pub fn set_session(&self, user: Option<UserId>) -> AppResult<()> {
        self.send(Command::Session(user))
    }

    /// Replaces the set of active rides with an authoritative snapshot.
    pub fn set_active_rides(&self, rides: Vec<RideId>) -> AppResult<()> {
        self.send(Command::ActiveRides(rides))
    }

    /// Pins `mode` until the next session or ride-activity change.
    pub fn start_tracking(&self, mode: TrackingMode) -> AppResult<()> {
        self.send(Command::StartTracking(mode))
    }

    pub fn stop_tracking(&self) -> AppResult<()> {
        self.send(Command::StopTracking)
    }

    /// Call when the app returns to the foreground or the OS reports a
    /// permission change.
    pub fn permission_changed(&self) -> AppResult<()> {
        self.send(Command::PermissionChanged)
    }

    /// User-initiated retry after a missing permission.
    pub fn trigger_permission_disclosure(&self) -> AppResult<()> {
        self.send(Command::TriggerDisclosure)
    }

    pub fn answer_disclosure(&self, accepted: bool) -> AppResult<()> {
        self.send(Command::DisclosureAnswered(accepted))
    }

    /// Entry point for the OS background task.
    pub fn deliver_background(&self, samples: Vec<LocationSample>) -> AppResult<()> {
        self.send(Command::BackgroundSamples(samples))
    }

    pub async fn request_current_location(&self) -> AppResult<LocationSample> {
        let result = self.sampler.get_current_position(self.one_shot_timeout).await;
        self.send(Command::OneShot(result.clone()))?;
        result.map_err(AppError::from)
    }

    pub fn status(&self) -> TrackingStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackingStatus> {
        self.status.clone()
    }

    /// Waits until no sampler change, permission request or address lookup
    /// is in flight, then returns the status.
    pub async fn settle(&self) -> AppResult<TrackingStatus> {
        loop {
            let (tx, rx) = oneshot::channel();
            self.send(Command::Settle(tx))?;
            match rx.await {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(_) => {
                    return Err(AppError::new(
                        ErrorKind::InvalidState,
                        "tracking controller stopped",
                    ))
                }
            }
        }
    }

    /// Stops sampling and ends the controller loop.
    pub fn shutdown(&self) -> AppResult<()> {
        self.send(Command::Shutdown)
    }
}

impl TrackingRequests for TrackingHandle {
    fn ride_status_changed(&self, ride: &RideId, active: bool) {
        if let Err(e) = self.send(Command::RideActivity {
            ride: ride.clone(),
            active,
        }) {
            warn!(error = %e, ride_id = %ride, "ride activity dropped");
        }
    }

    fn active_rides_changed(&self, rides: Vec<RideId>) {
        if let Err(e) = self.set_active_rides(rides) {
            warn!(error = %e, "active ride snapshot dropped");
        }
    }
}

type LocationUplink = Option<(UserId, Coordinate, UnixTimeMs)>;

pub struct TrackingController {
    sampler: Arc<LocationSampler>,
    resolver: Arc<dyn AddressResolver>,
    clock: SharedClock,
    commands: mpsc::UnboundedSender<Command>,
    ops: mpsc::UnboundedSender<SamplerOp>,
    status_tx: watch::Sender<TrackingStatus>,
    uplink: watch::Sender<LocationUplink>,

    user: Option<UserId>,
    active_rides: HashSet<RideId>,
    manual: Option<TrackingMode>,
    mode: TrackingMode,
    generation: u64,
    applying: bool,
    running: bool,
    permission_queries: usize,
    debouncer: AddressDebouncer,
    cache: AddressCache,
    status: TrackingStatus,
}

impl TrackingController {
    /// Starts the controller loop, its sampler worker and the location
    /// uplink on the current runtime.
    pub fn spawn(deps: TrackingDeps, config: TrackingConfig) -> Result<TrackingHandle, ConfigError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TrackingStatus::default());
        let (uplink_tx, uplink_rx) = watch::channel(None);

        tokio::spawn(run_sampler_worker(
            Arc::clone(&deps.sampler),
            config.clone(),
            ops_rx,
            commands_tx.clone(),
        ));
        tokio::spawn(run_location_uplink(Arc::clone(&deps.users), uplink_rx));

        let handle = TrackingHandle {
            commands: commands_tx.clone(),
            status: status_rx,
            sampler: Arc::clone(&deps.sampler),
            one_shot_timeout: config.current_position_timeout(),
        };

        let controller = Self {
            cache: AddressCache::new(config.address_cache_capacity, config.address_cache_precision),
            sampler: deps.sampler,
            resolver: deps.resolver,
            clock: deps.clock,
            commands: commands_tx,
            ops: ops_tx,
            status_tx,
            uplink: uplink_tx,
            user: None,
            active_rides: HashSet::new(),
            manual: None,
            mode: TrackingMode::Offline,
            generation: 0,
            applying: false,
            running: false,
            permission_queries: 0,
            debouncer: AddressDebouncer::new(),
            status: TrackingStatus::default(),
        };
        tokio::spawn(controller.run(commands_rx));

        Ok(handle)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("tracking controller started");
        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
            self.publish();
        }
        self.sampler.stop().await;
        info!("tracking controller stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Session(user) => {
                let changed = user != self.user;
                if changed {
                    info!(signed_in = user.is_some(), "session changed");
                    self.manual = None;
                    if user.is_none() {
                        self.status.disclosure = DisclosureState::NotShown;
                        self.sampler.allow_prompt(false);
                        self.active_rides.clear();
                    }
                }
                self.user = user;
                self.reconcile();
            }
            Command::ActiveRides(rides) => {
                let rides: HashSet<RideId> = rides.into_iter().collect();
                if rides != self.active_rides {
                    self.active_rides = rides;
                    self.manual = None;
                }
                self.reconcile();
            }
            Command::RideActivity { ride, active } => {
                let changed = if active {
                    self.active_rides.insert(ride)
                } else {
                    self.active_rides.remove(&ride)
                };
                if changed {
                    self.manual = None;
                }
                self.reconcile();
            }
            Command::StartTracking(mode) => {
                self.manual = Some(mode);
                self.reconcile();
            }
            Command::StopTracking => {
                self.manual = Some(TrackingMode::Invisible);
                self.reconcile();
            }
            Command::PermissionChanged => self.spawn_permission_check(),
            Command::TriggerDisclosure => self.on_trigger_disclosure(),
            Command::DisclosureAnswered(accepted) => self.on_disclosure_answer(accepted),
            Command::PermissionResolved(state) => self.on_permission_resolved(state),
            Command::SamplerApplied {
                generation,
                outcome,
            } => self.on_sampler_applied(generation, outcome),
            Command::Sample { generation, sample } => {
                if generation == self.generation && self.running {
                    self.on_sample(sample);
                } else {
                    debug!(generation, "dropping sample from superseded sampler");
                }
            }
            Command::BackgroundSamples(samples) => {
                if !self.running {
                    debug!("background samples while not tracking, ignored");
                } else if let Some(newest) = samples.into_iter().last() {
                    self.on_sample(newest);
                }
            }
            Command::OneShot(Ok(sample)) => {
                self.record_sample(sample);
                self.offer_address(sample.coordinate);
            }
            Command::OneShot(Err(e)) => self.on_sampler_error(e),
            Command::AddressResolved {
                seq,
                coordinate,
                result,
            } => self.on_address(seq, coordinate, result),
            Command::Settle(reply) => {
                let busy = self.applying
                    || self.permission_queries > 0
                    || self.debouncer.is_in_flight();
                let _ = reply.send((!busy).then(|| self.snapshot()));
            }
            Command::Shutdown => {}
        }
    }

    fn desired_mode(&self) -> TrackingMode {
        if self.user.is_none() {
            return TrackingMode::Offline;
        }
        self.manual
            .unwrap_or_else(|| decide(true, !self.active_rides.is_empty()))
    }

    /// Recomputes the mode from current state and asks the worker to apply
    /// it unless it already is (or is being) applied.
    fn reconcile(&mut self) {
        let desired = self.desired_mode();
        let settled = self.applying || self.running == desired.has_sampler();
        if desired == self.mode && settled {
            return;
        }

        if desired != self.mode {
            info!(from = ?self.mode, to = ?desired, "tracking mode change");
        } else {
            debug!(mode = ?desired, "retrying sampler start");
        }
        if desired != TrackingMode::Ride {
            self.debouncer.reset();
        }

        self.generation += 1;
        self.mode = desired;
        self.applying = true;
        self.running = false;
        let op = SamplerOp {
            generation: self.generation,
            mode: desired,
        };
        if self.ops.send(op).is_err() {
            warn!("sampler worker is gone");
            self.applying = false;
        }
    }

    fn on_sampler_applied(&mut self, generation: u64, outcome: ApplyOutcome) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "stale sampler result");
            return;
        }
        self.applying = false;
        self.status.permission = self.sampler.permissions().current();
        match outcome {
            ApplyOutcome::Running => {
                info!(mode = ?self.mode, "sampler running");
                self.running = true;
                self.status.missing_permission = false;
                self.status.last_error = None;
            }
            ApplyOutcome::Stopped => self.running = false,
            ApplyOutcome::Failed(e) => {
                self.running = false;
                self.on_sampler_error(e);
            }
        }
    }

    fn on_sampler_error(&mut self, error: SamplerError) {
        self.status.permission = self.sampler.permissions().current();
        match &error {
            SamplerError::PermissionDenied | SamplerError::PermissionBlocked => {
                warn!(error = %error, "location permission missing");
                self.status.missing_permission = true;
                if self.status.disclosure == DisclosureState::NotShown
                    && self.status.permission == PermissionState::Unknown
                {
                    self.status.disclosure = DisclosureState::Pending;
                }
            }
            SamplerError::Timeout { .. } | SamplerError::Platform(_) => {
                warn!(error = %error, "location sampler failed");
            }
        }
        self.status.last_error = Some(UserFacingError::from(AppError::from(error)));
    }

    fn on_trigger_disclosure(&mut self) {
        if self.sampler.permissions().current().is_blocked() {
            self.status.last_error = Some(UserFacingError::from(AppError::from(
                SamplerError::PermissionBlocked,
            )));
            return;
        }
        self.status.disclosure = DisclosureState::Pending;
    }

    fn on_disclosure_answer(&mut self, accepted: bool) {
        if !accepted {
            info!("background location disclosure declined");
            self.status.disclosure = DisclosureState::Declined;
            self.status.missing_permission = true;
            return;
        }
        info!("background location disclosure accepted");
        self.status.disclosure = DisclosureState::Accepted;
        self.sampler.allow_prompt(true);
        self.permission_queries += 1;
        let gate = Arc::clone(self.sampler.permissions());
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let state = gate.request().await;
            let _ = commands.send(Command::PermissionResolved(state));
        });
    }

    fn spawn_permission_check(&mut self) {
        self.permission_queries += 1;
        let gate = Arc::clone(self.sampler.permissions());
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let state = gate.check().await;
            let _ = commands.send(Command::PermissionResolved(state));
        });
    }

    fn on_permission_resolved(&mut self, state: PermissionState) {
        self.permission_queries = self.permission_queries.saturating_sub(1);
        self.status.permission = state;
        match state.denial() {
            None => {
                self.status.missing_permission = false;
                self.status.last_error = None;
            }
            Some(denial) => {
                self.status.missing_permission = true;
                self.status.last_error = Some(UserFacingError::from(AppError::from(
                    SamplerError::from(denial),
                )));
                if self.running {
                    // Reconcile issues a new generation, which tears the watch down.
                    warn!(state = ?state, "location permission lost while sampling");
                    self.running = false;
                }
            }
        }
        self.reconcile();
    }

    fn on_sample(&mut self, sample: LocationSample) {
        self.record_sample(sample);
        if self.mode == TrackingMode::Ride {
            self.offer_address(sample.coordinate);
        }
    }

    fn record_sample(&mut self, sample: LocationSample) {
        self.status.last_sample = Some(sample);
        if let Some(user) = &self.user {
            let at = sample.captured_at.unwrap_or_else(|| self.clock.now());
            self.uplink
                .send_replace(Some((user.clone(), sample.coordinate, at)));
        }
    }

    fn offer_address(&mut self, coordinate: Coordinate) {
        if let Some(hit) = self.cache.get(coordinate) {
            // Anything in flight is older than this sample.
            self.debouncer.reset();
            self.status.address = Some(hit);
            return;
        }
        if let Some(ticket) = self.debouncer.offer(coordinate) {
            self.spawn_resolve(ticket);
        }
    }

    fn on_address(
        &mut self,
        seq: u64,
        coordinate: Coordinate,
        result: Result<ResolvedAddress, ResolveError>,
    ) {
        let wanted = self.debouncer.finish(seq);
        match result {
            Ok(address) => {
                self.cache.put(coordinate, address.clone());
                if wanted {
                    self.status.address = Some(address);
                }
            }
            Err(e) => warn!(error = %e, "address lookup failed"),
        }

        while let Some(ticket) = self.debouncer.take_pending() {
            match self.cache.get(ticket.coordinate) {
                Some(hit) => {
                    self.debouncer.finish(ticket.seq);
                    self.status.address = Some(hit);
                }
                None => {
                    self.spawn_resolve(ticket);
                    break;
                }
            }
        }
    }

    fn spawn_resolve(&self, ticket: ResolveTicket) {
        let resolver = Arc::clone(&self.resolver);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(ticket.coordinate).await;
            let _ = commands.send(Command::AddressResolved {
                seq: ticket.seq,
                coordinate: ticket.coordinate,
                result,
            });
        });
    }

    fn snapshot(&self) -> TrackingStatus {
        TrackingStatus {
            mode: self.mode,
            sampler_running: self.running,
            ..self.status.clone()
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

enum PermissionGateResult {
    Superseded(Option<SamplerOp>),
    Checked(Result<(), SamplerError>),
}

/// Applies sampler ops strictly in order, skipping any op that a newer one
/// has already replaced.
#[instrument(skip_all)]
async fn run_sampler_worker(
    sampler: Arc<LocationSampler>,
    config: TrackingConfig,
    mut ops: mpsc::UnboundedReceiver<SamplerOp>,
    events: mpsc::UnboundedSender<Command>,
) {
    let mut forwarder: Option<JoinHandle<()>> = None;
    let mut queued: Option<SamplerOp> = None;

    loop {
        let mut op = match queued.take() {
            Some(op) => op,
            None => match ops.recv().await {
                Some(op) => op,
                None => break,
            },
        };
        while let Ok(newer) = ops.try_recv() {
            op = newer;
        }

        if let Some(task) = forwarder.take() {
            task.abort();
        }
        sampler.stop().await;

        let Some(profile) = config.profile_for(op.mode).cloned() else {
            let sent = events.send(Command::SamplerApplied {
                generation: op.generation,
                outcome: ApplyOutcome::Stopped,
            });
            if sent.is_err() {
                break;
            }
            continue;
        };

        // Waiting on the user is the only slow step; a newer op preempts it.
        let gate = tokio::select! {
            biased;
            newer = ops.recv() => PermissionGateResult::Superseded(newer),
            result = sampler.ensure_permission() => PermissionGateResult::Checked(result),
        };
        let outcome = match gate {
            PermissionGateResult::Superseded(Some(newer)) => {
                debug!(generation = op.generation, "sampler start preempted");
                queued = Some(newer);
                continue;
            }
            PermissionGateResult::Superseded(None) => break,
            PermissionGateResult::Checked(Err(e)) => Err(e),
            PermissionGateResult::Checked(Ok(())) => start_profile(&sampler, &profile).await,
        };

        match outcome {
            Ok(stream) => {
                let sent = events.send(Command::SamplerApplied {
                    generation: op.generation,
                    outcome: ApplyOutcome::Running,
                });
                if sent.is_err() {
                    break;
                }
                forwarder = Some(tokio::spawn(forward_samples(
                    stream,
                    op.generation,
                    events.clone(),
                )));
            }
            Err(e) => {
                let sent = events.send(Command::SamplerApplied {
                    generation: op.generation,
                    outcome: ApplyOutcome::Failed(e),
                });
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(task) = forwarder.take() {
        task.abort();
    }
}

async fn start_profile(
    sampler: &LocationSampler,
    profile: &SamplingProfile,
) -> Result<SampleStream, SamplerError> {
    let stream = sampler.start_foreground(profile).await?;
    if profile.background_enabled {
        if let Err(e) = sampler.start_background(profile).await {
            sampler.stop().await;
            return Err(e);
        }
    }
    Ok(stream)
}

async fn forward_samples(
    mut stream: SampleStream,
    generation: u64,
    events: mpsc::UnboundedSender<Command>,
) {
    while let Some(sample) = stream.recv().await {
        if events.send(Command::Sample { generation, sample }).is_err() {
            break;
        }
    }
}

/// Writes the newest known position to the user store. Positions that
/// arrive while a write is in flight collapse into the next write.
async fn run_location_uplink(
    users: Arc<dyn UserStore>,
    mut latest: watch::Receiver<LocationUplink>,
) {
    while latest.changed().await.is_ok() {
        let next = latest.borrow_and_update().clone();
        if let Some((user, coordinate, at)) = next {
            if let Err(e) = users.update_last_known_location(&user, coordinate, at).await {
                warn!(error = %e, user_id = %user, "last known location not saved");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::CallToAction;
    use crate::permission::{OsGrant, PermissionGate};
    use crate::store::MemoryUserStore;
    use crate::testing::{sample, FakeLocationPlatform, FakePermissions, FakeResolver};
    use proptest::prelude::*;

    struct Rig {
        handle: TrackingHandle,
        platform: Arc<FakeLocationPlatform>,
        permissions: Arc<FakePermissions>,
        users: Arc<MemoryUserStore>,
        resolver: Arc<FakeResolver>,
    }

    fn rig(permissions: FakePermissions) -> Rig {
        let platform = Arc::new(FakeLocationPlatform::new());
        let permissions = Arc::new(permissions);
        let users = Arc::new(MemoryUserStore::new());
        let resolver = Arc::new(FakeResolver::new());
        let gate = Arc::new(PermissionGate::new(permissions.clone()));
        let sampler = Arc::new(LocationSampler::new(platform.clone(), gate, "bg-task"));
        let handle = TrackingController::spawn(
            TrackingDeps {
                sampler,
                users: users.clone(),
                resolver: resolver.clone(),
                clock: SystemClock::shared(),
            },
            TrackingConfig::default(),
        )
        .unwrap();
        Rig {
            handle,
            platform,
            permissions,
            users,
            resolver,
        }
    }

    fn user() -> UserId {
        UserId::new("rider-1")
    }

    fn ride() -> RideId {
        RideId::new("ride-1")
    }

    #[test]
    fn test_decide_table() {
        assert_eq!(decide(false, false), TrackingMode::Offline);
        assert_eq!(decide(false, true), TrackingMode::Offline);
        assert_eq!(decide(true, true), TrackingMode::Ride);
        assert_eq!(decide(true, false), TrackingMode::Passive);
    }

    #[tokio::test]
    async fn test_session_starts_passive_sampling() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        let status = rig.handle.settle().await.unwrap();

        assert_eq!(status.mode, TrackingMode::Passive);
        assert!(status.sampler_running);
        assert_eq!(rig.platform.live_watches(), 1);
        assert!(!rig.platform.background_running());
    }

    #[tokio::test]
    async fn test_active_ride_switches_to_ride_mode_with_background() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        let status = rig.handle.settle().await.unwrap();

        assert_eq!(status.mode, TrackingMode::Ride);
        assert_eq!(rig.platform.live_watches(), 1);
        assert!(rig.platform.background_running());

        rig.handle.ride_status_changed(&ride(), false);
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.mode, TrackingMode::Passive);
        assert!(!rig.platform.background_running());
        assert_eq!(rig.platform.max_concurrent_background(), 1);
    }

    #[tokio::test]
    async fn test_repeated_identical_requests_do_not_restart_sampler() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        rig.handle.settle().await.unwrap();
        let watches = rig.platform.watch_calls();

        for _ in 0..5 {
            rig.handle.ride_status_changed(&ride(), true);
            rig.handle.set_session(Some(user())).unwrap();
        }
        rig.handle.settle().await.unwrap();

        assert_eq!(rig.platform.watch_calls(), watches);
        assert_eq!(rig.platform.background_registrations(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_goes_offline() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        rig.handle.settle().await.unwrap();

        rig.handle.set_session(None).unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.mode, TrackingMode::Offline);
        assert!(!status.sampler_running);
        assert_eq!(rig.platform.live_watches(), 0);
        assert!(!rig.platform.background_running());
    }

    #[tokio::test]
    async fn test_blocked_permission_keeps_sampler_off() {
        let rig = rig(FakePermissions::blocked());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        let status = rig.handle.settle().await.unwrap();

        assert_eq!(status.mode, TrackingMode::Ride);
        assert!(!status.sampler_running);
        assert!(status.missing_permission);
        assert_eq!(status.permission, PermissionState::DeniedBlocked);
        assert_eq!(
            status.last_error.map(|e| e.action),
            Some(CallToAction::OpenSettings)
        );
        assert_eq!(rig.platform.watch_calls(), 0);

        // Retry without visiting settings: still blocked, never prompts.
        rig.handle.trigger_permission_disclosure().unwrap();
        rig.handle.permission_changed().unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.permission, PermissionState::DeniedBlocked);
        assert_eq!(rig.permissions.prompt_count(), 0);
        assert_eq!(rig.platform.watch_calls(), 0);
    }

    #[tokio::test]
    async fn test_granted_in_settings_resumes_pending_mode() {
        let rig = rig(FakePermissions::blocked());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        rig.handle.settle().await.unwrap();

        rig.permissions.set(OsGrant::Granted, true);
        rig.handle.permission_changed().unwrap();
        let status = rig.handle.settle().await.unwrap();

        assert!(status.sampler_running);
        assert!(!status.missing_permission);
        assert!(rig.platform.background_running());
    }

    #[tokio::test]
    async fn test_revoked_permission_stops_sampler_and_asks_for_action() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        let status = rig.handle.settle().await.unwrap();
        assert!(status.sampler_running);
        assert!(rig.platform.background_running());

        rig.permissions.set(OsGrant::Denied, true);
        rig.handle.permission_changed().unwrap();
        let status = rig.handle.settle().await.unwrap();

        assert_eq!(status.mode, TrackingMode::Ride);
        assert_eq!(status.permission, PermissionState::DeniedRetryable);
        assert!(!status.sampler_running);
        assert!(status.missing_permission);
        assert_eq!(
            status.last_error.map(|e| e.action),
            Some(CallToAction::Retry)
        );
        assert_eq!(rig.platform.live_watches(), 0);
        assert!(!rig.platform.background_running());

        // Blocked in settings: the call to action changes, still no prompt.
        rig.permissions.set(OsGrant::Denied, false);
        rig.handle.permission_changed().unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(
            status.last_error.map(|e| e.action),
            Some(CallToAction::OpenSettings)
        );
        assert_eq!(rig.permissions.prompt_count(), 0);

        // Granted again: sampling resumes.
        rig.permissions.set(OsGrant::Granted, true);
        rig.handle.permission_changed().unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert!(status.sampler_running);
        assert!(!status.missing_permission);
        assert_eq!(rig.platform.live_watches(), 1);
        assert!(rig.platform.background_running());
    }

    #[tokio::test]
    async fn test_disclosure_precedes_first_prompt() {
        let rig = rig(FakePermissions::undetermined());
        rig.permissions.answer_prompt_with(OsGrant::Granted, true);
        rig.handle.set_session(Some(user())).unwrap();
        let status = rig.handle.settle().await.unwrap();

        assert_eq!(status.disclosure, DisclosureState::Pending);
        assert!(status.missing_permission);
        assert_eq!(rig.permissions.prompt_count(), 0);

        rig.handle.answer_disclosure(true).unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(rig.permissions.prompt_count(), 1);
        assert_eq!(status.disclosure, DisclosureState::Accepted);
        assert!(status.sampler_running);
        assert!(!status.missing_permission);
    }

    #[tokio::test]
    async fn test_declined_disclosure_never_prompts_automatically() {
        let rig = rig(FakePermissions::undetermined());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.settle().await.unwrap();

        rig.handle.answer_disclosure(false).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        rig.handle.permission_changed().unwrap();
        let status = rig.handle.settle().await.unwrap();

        assert_eq!(status.disclosure, DisclosureState::Declined);
        assert!(status.missing_permission);
        assert_eq!(rig.permissions.prompt_count(), 0);

        // Explicit retry shows the disclosure again.
        rig.handle.trigger_permission_disclosure().unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.disclosure, DisclosureState::Pending);
    }

    #[tokio::test]
    async fn test_passive_samples_update_location_without_address() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.settle().await.unwrap();

        rig.platform.emit(sample(6.45, 3.39));
        let mut updates = rig.handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            updates.wait_for(|s| s.last_sample.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert!(status.last_sample.is_some());
        assert!(status.address.is_none());
        assert_eq!(rig.resolver.calls(), 0);

        tokio::time::timeout(Duration::from_secs(1), async {
            while rig.users.write_count(&user()) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            rig.users.last_known(&user()).map(|c| c.latitude()),
            Some(6.45)
        );
    }

    #[tokio::test]
    async fn test_ride_samples_resolve_latest_address_only() {
        let rig = rig(FakePermissions::granted());
        rig.resolver.hold();
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        while !rig.handle.status().sampler_running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        rig.platform.emit(sample(6.40, 3.30));
        rig.platform.emit(sample(6.50, 3.30));
        rig.platform.emit(sample(6.60, 3.30));
        while rig.handle.status().last_sample.map(|s| s.coordinate.latitude()) != Some(6.60) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(rig.resolver.calls(), 1);

        rig.resolver.release();
        let status = rig.handle.settle().await.unwrap();

        assert_eq!(rig.resolver.resolved(), vec![6.40, 6.60]);
        assert_eq!(status.address.unwrap().short, "6.60");
    }

    #[tokio::test]
    async fn test_background_batch_uses_newest_sample() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.ride_status_changed(&ride(), true);
        rig.handle.settle().await.unwrap();

        rig.handle
            .deliver_background(vec![sample(1.0, 1.0), sample(2.0, 2.0)])
            .unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.last_sample.unwrap().coordinate.latitude(), 2.0);
    }

    #[tokio::test]
    async fn test_manual_invisible_until_ride_signal() {
        let rig = rig(FakePermissions::granted());
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.stop_tracking().unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.mode, TrackingMode::Invisible);
        assert_eq!(rig.platform.live_watches(), 0);

        rig.handle.ride_status_changed(&ride(), true);
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.mode, TrackingMode::Ride);

        // Same set again keeps the override.
        rig.handle.stop_tracking().unwrap();
        rig.handle.set_active_rides(vec![ride()]).unwrap();
        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.mode, TrackingMode::Invisible);
    }

    #[tokio::test]
    async fn test_stop_while_start_waits_on_prompt_converges_to_stopped() {
        let rig = rig(FakePermissions::undetermined());
        rig.permissions.hold_prompt();
        rig.handle.set_session(Some(user())).unwrap();
        rig.handle.answer_disclosure(true).unwrap();
        rig.handle.ride_status_changed(&ride(), true);

        // Let the start reach the pending prompt, then end the ride.
        tokio::time::sleep(Duration::from_millis(20)).await;
        rig.handle.ride_status_changed(&ride(), false);
        rig.handle.set_session(None).unwrap();
        rig.permissions.release_prompt(OsGrant::Granted);

        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.mode, TrackingMode::Offline);
        assert!(!status.sampler_running);
        assert_eq!(rig.platform.live_watches(), 0);
        assert!(!rig.platform.background_running());
    }

    #[tokio::test]
    async fn test_one_shot_failure_reports_missing_permission() {
        let rig = rig(FakePermissions::retryable_denied());
        let err = rig.handle.request_current_location().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let status = rig.handle.settle().await.unwrap();
        assert!(status.missing_permission);
        assert_eq!(status.last_error.map(|e| e.action), Some(CallToAction::Retry));
    }

    #[tokio::test]
    async fn test_one_shot_resolves_address() {
        let rig = rig(FakePermissions::granted());
        rig.platform.set_current_position(sample(6.5, 3.3));
        let fix = rig.handle.request_current_location().await.unwrap();
        assert_eq!(fix.coordinate.latitude(), 6.5);

        let status = rig.handle.settle().await.unwrap();
        assert_eq!(status.address.unwrap().short, "6.50");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn at_most_one_sampler_per_channel(
            trace in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..24)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let rig = rig(FakePermissions::granted());
                for (has_session, has_ride) in &trace {
                    let session = has_session.then(user);
                    rig.handle.set_session(session).unwrap();
                    rig.handle.ride_status_changed(&ride(), *has_ride);
                    tokio::task::yield_now().await;
                }
                let status = rig.handle.settle().await.unwrap();

                let (has_session, has_ride) = *trace.last().unwrap();
                prop_assert_eq!(status.mode, decide(has_session, has_session && has_ride));
                prop_assert!(rig.platform.max_live_watches() <= 1);
                prop_assert!(rig.platform.max_concurrent_background() <= 1);
                prop_assert_eq!(rig.platform.live_watches(), usize::from(status.mode.has_sampler()));
                prop_assert_eq!(rig.platform.background_running(), status.mode == TrackingMode::Ride);
                Ok(())
            })?;
        }

        #[test]
        fn decide_is_total(has_session in any::<bool>(), has_ride in any::<bool>()) {
            let mode = decide(has_session, has_ride);
            if !has_session {
                prop_assert_eq!(mode, TrackingMode::Offline);
            } else if has_ride {
                prop_assert_eq!(mode, TrackingMode::Ride);
            } else {
                prop_assert_eq!(mode, TrackingMode::Passive);
            }
        }
    }
}
