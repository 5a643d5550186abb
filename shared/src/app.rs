//! Wiring for the shell: builds the controller, observer and ride machines
//! from one set of platform collaborators.

use std::sync::{Arc, Mutex};
use tracing::{info, instrument};

use crate::address::AddressResolver;
use crate::clock::SharedClock;
use crate::config::CoreConfig;
use crate::error::{AppError, AppResult, ErrorKind};
use crate::model::{NewRide, RideId, UserId};
use crate::observer::{ActiveRideBridge, ActiveRideSetObserver, ObserverHandle};
use crate::permission::{PermissionGate, PermissionPlatform};
use crate::ride::{RideDeps, RideMachine};
use crate::sampler::{LocationPlatform, LocationSampler};
use crate::store::{RideStore, UserStore};
use crate::tracking::{TrackingController, TrackingDeps, TrackingHandle};

pub struct CoreDeps {
    pub permissions: Arc<dyn PermissionPlatform>,
    pub location: Arc<dyn LocationPlatform>,
    pub rides: Arc<dyn RideStore>,
    pub users: Arc<dyn UserStore>,
    pub resolver: Arc<dyn AddressResolver>,
    pub clock: SharedClock,
}

struct Session {
    user: UserId,
    _observer: ObserverHandle,
}

pub struct RideCore {
    config: CoreConfig,
    tracking: TrackingHandle,
    rides: Arc<dyn RideStore>,
    clock: SharedClock,
    observer: ActiveRideSetObserver,
    bridge: ActiveRideBridge,
    session: Mutex<Option<Session>>,
}

impl RideCore {
    /// Validates `config` and starts the tracking controller. Must run
    /// inside a tokio runtime.
    pub fn start(deps: CoreDeps, config: CoreConfig) -> AppResult<Self> {
        config.validate()?;

        let gate = Arc::new(PermissionGate::new(deps.permissions));
        let sampler = Arc::new(LocationSampler::new(
            deps.location,
            gate,
            config.tracking.background_task.clone(),
        ));
        let tracking = TrackingController::spawn(
            TrackingDeps {
                sampler,
                users: deps.users,
                resolver: deps.resolver,
                clock: Arc::clone(&deps.clock),
            },
            config.tracking.clone(),
        )?;

        info!(task = %config.tracking.background_task, "ride core started");
        Ok(Self {
            observer: ActiveRideSetObserver::new(
                Arc::clone(&deps.rides),
                config.subscription.clone(),
            ),
            bridge: ActiveRideBridge::new(Arc::new(tracking.clone())),
            config,
            tracking,
            rides: deps.rides,
            clock: deps.clock,
            session: Mutex::new(None),
        })
    }

    pub fn tracking(&self) -> &TrackingHandle {
        &self.tracking
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Starts a session: tracking leaves OFFLINE and the user's active
    /// rides are observed. Replaces any previous session.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn sign_in(&self, user: UserId) -> AppResult<()> {
        let mut session = self.lock_session()?;
        if session.as_ref().is_some_and(|s| s.user == user) {
            return Ok(());
        }
        *session = None;
        self.tracking.set_session(Some(user.clone()))?;
        let observer = self.bridge.start(&self.observer, user.clone());
        *session = Some(Session {
            user,
            _observer: observer,
        });
        Ok(())
    }

    pub fn sign_out(&self) -> AppResult<()> {
        let mut session = self.lock_session()?;
        if let Some(ended) = session.take() {
            info!(user_id = %ended.user, "session ended");
        }
        self.tracking.set_session(None)
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.session
            .lock()
            .ok()?
            .as_ref()
            .map(|s| s.user.clone())
    }

    /// Opens a ride in `idle` and starts its search timer.
    pub async fn request_ride(&self, ride: NewRide) -> AppResult<RideMachine> {
        let machine = RideMachine::create(self.ride_deps(), ride).await?;
        self.bridge.register(machine.clone());
        Ok(machine)
    }

    /// Picks up a ride created by an earlier process.
    pub async fn resume_ride(&self, id: &RideId) -> AppResult<RideMachine> {
        if let Some(machine) = self.bridge.machine(id) {
            return Ok(machine);
        }
        let ride = self
            .rides
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::new(ErrorKind::NotFound, "ride not found"))?;
        let machine = RideMachine::attach(self.ride_deps(), ride).await;
        self.bridge.register(machine.clone());
        Ok(machine)
    }

    pub fn ride(&self, id: &RideId) -> Option<RideMachine> {
        self.bridge.machine(id)
    }

    /// Call when the app returns to the foreground. Re-reads the location
    /// permission and catches up on search deadlines that passed while the
    /// device was asleep.
    #[instrument(skip(self))]
    pub async fn app_resumed(&self) -> AppResult<()> {
        self.tracking.permission_changed()?;
        for machine in self.bridge.machines() {
            machine.recheck_deadline().await;
        }
        Ok(())
    }

    pub fn shutdown(&self) -> AppResult<()> {
        if let Ok(mut session) = self.session.lock() {
            session.take();
        }
        self.tracking.shutdown()
    }

    fn ride_deps(&self) -> RideDeps {
        RideDeps {
            store: Arc::clone(&self.rides),
            tracking: Arc::new(self.tracking.clone()),
            clock: Arc::clone(&self.clock),
            search: self.config.search.clone(),
        }
    }

    fn lock_session(&self) -> AppResult<std::sync::MutexGuard<'_, Option<Session>>> {
        self.session
            .lock()
            .map_err(|_| AppError::new(ErrorKind::Internal, "session lock poisoned"))
    }
}
