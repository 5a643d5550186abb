//! Ride lifecycle state machine.
//!
//! One [`RideMachine`] per ride. All writes go through the machine's lock,
//! which is held across the backend round trip, so at most one transition
//! is ever in flight for a ride. While the ride is `idle` a timer task walks
//! the search phases and auto-cancels the ride at the configured deadline.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::SharedClock;
use crate::config::SearchDeadlineConfig;
use crate::error::{AppError, ErrorKind, UserFacingError};
use crate::model::{CancelReason, NewRide, Ride, RideId, RidePatch, RideStatus, UnixTimeMs};
use crate::store::{RideStore, StoreError};
use crate::tracking::TrackingRequests;

/// Delay before a failed auto-cancel write is attempted again.
const AUTO_CANCEL_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RideError {
    #[error("illegal ride transition {from} -> {to}")]
    IllegalTransition { from: RideStatus, to: RideStatus },
    #[error("ride sync failed: {0}")]
    Sync(#[from] StoreError),
    #[error("ride {0} not found")]
    NotFound(RideId),
}

impl From<RideError> for AppError {
    fn from(e: RideError) -> Self {
        match e {
            RideError::IllegalTransition { from, to } => {
                AppError::new(ErrorKind::IllegalTransition, format!("{from} -> {to}"))
                    .with_context("from", from.as_str())
                    .with_context("to", to.as_str())
            }
            RideError::Sync(store) => AppError::from(store),
            RideError::NotFound(id) => {
                AppError::new(ErrorKind::NotFound, "ride not found").with_context("ride_id", id.0)
            }
        }
    }
}

/// Where a searching ride is on its escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPhase {
    SearchingNearby,
    ExpandingRadius,
    AwaitingAvailability,
    ProlongedWait,
}

impl SearchPhase {
    #[must_use]
    pub fn for_elapsed(elapsed: Duration, config: &SearchDeadlineConfig) -> Self {
        let secs = elapsed.as_secs();
        if secs >= config.prolonged_after_secs {
            Self::ProlongedWait
        } else if secs >= config.awaiting_after_secs {
            Self::AwaitingAvailability
        } else if secs >= config.expanding_after_secs {
            Self::ExpandingRadius
        } else {
            Self::SearchingNearby
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SearchingNearby => "searching nearby",
            Self::ExpandingRadius => "expanding search radius",
            Self::AwaitingAvailability => "awaiting availability",
            Self::ProlongedWait => "prolonged wait",
        }
    }
}

/// A status change with the data it records.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Confirm,
    ArrivedPickup,
    PickedUp,
    ArrivedDropoff,
    Complete { fare: Option<f64> },
    Cancel(CancelReason),
}

impl Transition {
    #[must_use]
    pub const fn target(&self) -> RideStatus {
        match self {
            Self::Confirm => RideStatus::DriverOnTheWay,
            Self::ArrivedPickup => RideStatus::ArrivedPickup,
            Self::PickedUp => RideStatus::PickedUp,
            Self::ArrivedDropoff => RideStatus::ArrivedDropoff,
            Self::Complete { .. } => RideStatus::Completed,
            Self::Cancel(_) => RideStatus::Canceled,
        }
    }

    fn into_patch(self, now: UnixTimeMs) -> RidePatch {
        let mut patch = RidePatch::status(self.target());
        match self {
            Self::Confirm | Self::ArrivedDropoff => {}
            Self::ArrivedPickup => patch.waiting_start_at = Some(now),
            Self::PickedUp => patch.waiting_end_at = Some(now),
            Self::Complete { fare } => {
                patch.completed_at = Some(now);
                patch.fare = fare;
            }
            Self::Cancel(reason) => {
                patch.canceled_at = Some(now);
                patch.canceled_by = Some(reason.origin());
                patch.cancel_reason = Some(reason.text().to_string());
            }
        }
        patch
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideView {
    pub ride: Ride,
    /// Present only while the ride is `idle`.
    pub search_phase: Option<SearchPhase>,
    /// A local transition is waiting on the backend.
    pub syncing: bool,
}

/// Result of a UI action, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub status: RideStatus,
    pub error: Option<UserFacingError>,
}

impl ActionOutcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct RideDeps {
    pub store: Arc<dyn RideStore>,
    pub tracking: Arc<dyn TrackingRequests>,
    pub clock: SharedClock,
    pub search: SearchDeadlineConfig,
}

struct RideState {
    ride: Ride,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    auto_cancel_fired: bool,
}

struct Inner {
    id: RideId,
    deps: RideDeps,
    state: Mutex<RideState>,
    view: watch::Sender<RideView>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

#[derive(Clone)]
pub struct RideMachine {
    inner: Arc<Inner>,
}

impl RideMachine {
    /// Creates the ride in the store and starts its search timer.
    #[instrument(skip(deps, new_ride), fields(rider_id = %new_ride.rider_id))]
    pub async fn create(deps: RideDeps, new_ride: NewRide) -> Result<Self, RideError> {
        let ride = deps.store.create(new_ride).await.map_err(|e| {
            error!(error = %e, "ride creation failed");
            RideError::from(e)
        })?;
        info!(ride_id = %ride.id, "ride created");
        Ok(Self::attach(deps, ride).await)
    }

    /// Takes over a ride that already exists in the store. An idle ride
    /// past its deadline is auto-canceled right away.
    pub async fn attach(deps: RideDeps, ride: Ride) -> Self {
        let view = RideView {
            ride: ride.clone(),
            search_phase: None,
            syncing: false,
        };
        let inner = Arc::new(Inner {
            id: ride.id.clone(),
            deps,
            state: Mutex::new(RideState {
                ride,
                timer: None,
                timer_generation: 0,
                auto_cancel_fired: false,
            }),
            view: watch::channel(view).0,
        });

        {
            let mut state = inner.state.lock().await;
            if state.ride.status == RideStatus::Idle {
                inner.arm_timer(&mut state);
            }
            inner
                .deps
                .tracking
                .ride_status_changed(&inner.id, state.ride.is_active());
            inner.publish(&state, false);
        }
        Self { inner }
    }

    pub fn id(&self) -> &RideId {
        &self.inner.id
    }

    pub fn status(&self) -> RideStatus {
        self.inner.view.borrow().ride.status
    }

    pub fn view(&self) -> RideView {
        self.inner.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RideView> {
        self.inner.view.subscribe()
    }

    /// Applies `transition` and waits for the backend to confirm it.
    #[instrument(skip(self), fields(ride_id = %self.inner.id))]
    pub async fn transition(&self, transition: Transition) -> Result<Ride, RideError> {
        let mut state = self.inner.state.lock().await;
        self.inner.apply_locked(&mut state, transition).await
    }

    pub async fn confirm(&self) -> ActionOutcome {
        self.act(Transition::Confirm).await
    }

    pub async fn arrived_pickup(&self) -> ActionOutcome {
        self.act(Transition::ArrivedPickup).await
    }

    pub async fn picked_up(&self) -> ActionOutcome {
        self.act(Transition::PickedUp).await
    }

    pub async fn arrived_dropoff(&self) -> ActionOutcome {
        self.act(Transition::ArrivedDropoff).await
    }

    pub async fn complete(&self, fare: Option<f64>) -> ActionOutcome {
        self.act(Transition::Complete { fare }).await
    }

    pub async fn cancel(&self, reason: impl Into<String>) -> ActionOutcome {
        self.act(Transition::Cancel(CancelReason::User(reason.into())))
            .await
    }

    async fn act(&self, transition: Transition) -> ActionOutcome {
        match self.transition(transition).await {
            Ok(ride) => ActionOutcome {
                status: ride.status,
                error: None,
            },
            Err(e) => ActionOutcome {
                status: self.status(),
                error: Some(UserFacingError::from(AppError::from(e))),
            },
        }
    }

    /// Adopts a ride pushed by the backend. Snapshots that would move the
    /// ride backwards or out of a terminal status are stale and ignored.
    #[instrument(skip(self, ride), fields(ride_id = %self.inner.id, remote = %ride.status))]
    pub async fn apply_remote(&self, ride: Ride) {
        if ride.id != self.inner.id {
            warn!(other = %ride.id, "remote update for a different ride ignored");
            return;
        }
        let mut state = self.inner.state.lock().await;
        if ride.updated_at < state.ride.updated_at {
            debug!(
                remote_at = ride.updated_at.as_millis(),
                local_at = state.ride.updated_at.as_millis(),
                "older snapshot ignored"
            );
            return;
        }
        let local = state.ride.status;
        let remote = ride.status;

        if remote != local {
            if !moves_forward(local, remote) {
                warn!(%local, "stale remote status ignored");
                return;
            }
            if !local.can_transition_to(remote) {
                debug!(%local, "remote status skipped intermediate states");
            }
            info!(%local, "remote status accepted");
        }
        state.ride = ride;
        self.inner.after_status_change(&mut state, local);
        self.inner.publish(&state, false);
    }

    /// Runs the search timer's next step now instead of at its scheduled
    /// wake-up. Call after the device resumes: runtime timers do not advance
    /// while it sleeps, wall-clock time does.
    pub async fn recheck_deadline(&self) {
        let mut state = self.inner.state.lock().await;
        if state.ride.status == RideStatus::Idle {
            debug!(ride_id = %self.inner.id, "rechecking search deadline");
            self.inner.arm_timer(&mut state);
        }
    }

    /// Re-reads the ride from the store and applies it as a remote update.
    pub async fn refresh(&self) -> Result<RideStatus, RideError> {
        let ride = self
            .inner
            .deps
            .store
            .get_by_id(&self.inner.id)
            .await?
            .ok_or_else(|| RideError::NotFound(self.inner.id.clone()))?;
        self.apply_remote(ride).await;
        Ok(self.status())
    }
}

/// Whether `remote` lies ahead of `local` on the lifecycle.
fn moves_forward(local: RideStatus, remote: RideStatus) -> bool {
    if local.is_terminal() {
        return false;
    }
    if remote.is_terminal() {
        return true;
    }
    let rank = |s: RideStatus| RideStatus::ALL.iter().position(|x| *x == s);
    rank(remote) > rank(local)
}

impl Inner {
    async fn apply_locked(
        &self,
        state: &mut RideState,
        transition: Transition,
    ) -> Result<Ride, RideError> {
        let from = state.ride.status;
        let to = transition.target();
        if !from.can_transition_to(to) {
            error!(ride_id = %self.id, %from, %to, "illegal ride transition requested");
            return Err(RideError::IllegalTransition { from, to });
        }

        let patch = transition.into_patch(self.deps.clock.now());
        let previous = state.ride.clone();
        state.ride.apply(&patch);
        self.publish(state, true);

        match self.deps.store.update(&self.id, &patch).await {
            Ok(confirmed) => state.ride = confirmed,
            Err(e) => {
                error!(ride_id = %self.id, %from, %to, error = %e, "ride write failed, rolled back");
                state.ride = previous;
                self.publish(state, false);
                return Err(RideError::Sync(e));
            }
        }

        info!(ride_id = %self.id, %from, to = %state.ride.status, "ride transition confirmed");
        self.after_status_change(state, from);
        self.publish(state, false);
        Ok(state.ride.clone())
    }

    fn after_status_change(&self, state: &mut RideState, previous: RideStatus) {
        let status = state.ride.status;
        if status == previous {
            return;
        }
        if status != RideStatus::Idle {
            self.disarm_timer(state);
        }
        self.deps
            .tracking
            .ride_status_changed(&self.id, state.ride.is_active());
    }

    fn arm_timer(self: &Arc<Self>, state: &mut RideState) {
        self.disarm_timer(state);
        let generation = state.timer_generation;
        let machine = Arc::downgrade(self);
        state.timer = Some(tokio::spawn(run_search_timer(machine, generation)));
        debug!(ride_id = %self.id, "search timer armed");
    }

    fn disarm_timer(&self, state: &mut RideState) {
        state.timer_generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
            debug!(ride_id = %self.id, "search timer disarmed");
        }
    }

    fn elapsed(&self, state: &RideState) -> Duration {
        Duration::from_millis(self.deps.clock.now().elapsed_since(state.ride.created_at))
    }

    /// One timer step. Returns how long to sleep before the next step, or
    /// `None` once the timer has nothing left to do.
    async fn search_tick(&self, generation: u64) -> Option<Duration> {
        let mut state = self.state.lock().await;
        if state.timer_generation != generation || state.ride.status != RideStatus::Idle {
            return None;
        }

        let elapsed = self.elapsed(&state);
        self.publish(&state, false);

        let search = &self.deps.search;
        if elapsed < search.auto_cancel_after() {
            return [
                search.expanding_after_secs,
                search.awaiting_after_secs,
                search.prolonged_after_secs,
                search.auto_cancel_after_secs,
            ]
            .into_iter()
            .map(Duration::from_secs)
            .find(|threshold| *threshold > elapsed)
            .map(|threshold| threshold - elapsed);
        }

        if state.auto_cancel_fired {
            return None;
        }
        state.auto_cancel_fired = true;
        // This task finishes the job itself; detach it so the cancel does
        // not abort it mid-write.
        drop(state.timer.take());

        info!(ride_id = %self.id, elapsed_s = elapsed.as_secs(), "auto-canceling ride after prolonged search");
        let reason = CancelReason::Auto(search.auto_cancel_reason.clone());
        match self.apply_locked(&mut state, Transition::Cancel(reason)).await {
            Ok(_) => None,
            Err(e) => {
                warn!(ride_id = %self.id, error = %e, "auto-cancel failed, will retry");
                state.auto_cancel_fired = false;
                Some(AUTO_CANCEL_RETRY)
            }
        }
    }

    fn publish(&self, state: &RideState, syncing: bool) {
        let search_phase = (state.ride.status == RideStatus::Idle)
            .then(|| SearchPhase::for_elapsed(self.elapsed(state), &self.deps.search));
        self.view.send_replace(RideView {
            ride: state.ride.clone(),
            search_phase,
            syncing,
        });
    }
}

async fn run_search_timer(machine: Weak<Inner>, generation: u64) {
    loop {
        let Some(inner) = machine.upgrade() else {
            return;
        };
        let next = inner.search_tick(generation).await;
        drop(inner);
        match next {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return,
        }
    }
}
