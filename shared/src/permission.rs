use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    Unknown,
    Checking,
    Granted,
    DeniedRetryable,
    DeniedBlocked,
}

impl PermissionState {
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    #[must_use]
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::DeniedBlocked)
    }

    /// The error a caller reports when this state keeps a sampler from starting.
    #[must_use]
    pub const fn denial(self) -> Option<PermissionError> {
        match self {
            Self::Granted => None,
            Self::DeniedBlocked => Some(PermissionError::Blocked),
            Self::Unknown | Self::Checking | Self::DeniedRetryable => Some(PermissionError::Denied),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("location permission denied")]
    Denied,
    #[error("location permission blocked; enable it in system settings")]
    Blocked,
    #[error("permission platform error: {0}")]
    Platform(String),
}

impl From<PermissionError> for AppError {
    fn from(e: PermissionError) -> Self {
        let kind = match &e {
            PermissionError::Denied | PermissionError::Platform(_) => ErrorKind::PermissionDenied,
            PermissionError::Blocked => ErrorKind::PermissionBlocked,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsGrant {
    Granted,
    Denied,
    Undetermined,
}

/// Raw answer from the OS permission API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsPermission {
    pub grant: OsGrant,
    pub can_ask_again: bool,
}

impl OsPermission {
    #[must_use]
    pub const fn to_state(self) -> PermissionState {
        match (self.grant, self.can_ask_again) {
            (OsGrant::Granted, _) => PermissionState::Granted,
            (OsGrant::Undetermined, _) => PermissionState::Unknown,
            (OsGrant::Denied, true) => PermissionState::DeniedRetryable,
            (OsGrant::Denied, false) => PermissionState::DeniedBlocked,
        }
    }
}

/// OS location-permission API, implemented by the platform shell.
#[async_trait::async_trait]
pub trait PermissionPlatform: Send + Sync {
    /// Reads the current grant without prompting.
    async fn status(&self) -> Result<OsPermission, PermissionError>;
    /// Shows the system prompt and waits for the user's answer.
    async fn prompt(&self) -> Result<OsPermission, PermissionError>;
}

pub struct PermissionGate {
    platform: Arc<dyn PermissionPlatform>,
    state: Mutex<PermissionState>,
    request_lock: tokio::sync::Mutex<()>,
}

impl PermissionGate {
    pub fn new(platform: Arc<dyn PermissionPlatform>) -> Self {
        Self {
            platform,
            state: Mutex::new(PermissionState::Unknown),
            request_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Last state observed by `check` or `request`.
    pub fn current(&self) -> PermissionState {
        self.state.lock().map(|s| *s).unwrap_or(PermissionState::Unknown)
    }

    fn set(&self, next: PermissionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                debug!(from = ?*state, to = ?next, "permission state changed");
            }
            *state = next;
        }
    }

    /// Non-prompting read of the OS grant. Platform failures count as a
    /// retryable denial.
    #[instrument(skip(self))]
    pub async fn check(&self) -> PermissionState {
        self.set(PermissionState::Checking);
        let next = match self.platform.status().await {
            Ok(os) => os.to_state(),
            Err(e) => {
                warn!(error = %e, "permission check failed, assuming denied");
                PermissionState::DeniedRetryable
            }
        };
        self.set(next);
        next
    }

    /// Prompts the user unless the permission is already granted or
    /// permanently denied. A blocked permission never prompts: the caller
    /// must send the user to system settings instead.
    #[instrument(skip(self))]
    pub async fn request(&self) -> PermissionState {
        let _guard = self.request_lock.lock().await;

        let prior = self.current();
        let fresh = self.check().await;
        if fresh.is_granted() {
            return fresh;
        }
        if fresh.is_blocked() || prior.is_blocked() {
            info!("location permission blocked, not prompting");
            self.set(PermissionState::DeniedBlocked);
            return PermissionState::DeniedBlocked;
        }

        let next = match self.platform.prompt().await {
            Ok(os) => os.to_state(),
            Err(e) => {
                warn!(error = %e, "permission prompt failed");
                PermissionState::DeniedRetryable
            }
        };
        info!(state = ?next, "location permission prompt answered");
        self.set(next);
        next
    }

    /// Succeeds only when the permission is granted. With `allow_prompt`,
    /// a never-asked permission is requested first.
    pub async fn ensure_granted(&self, allow_prompt: bool) -> Result<(), PermissionError> {
        let mut state = self.check().await;
        if allow_prompt && state == PermissionState::Unknown {
            state = self.request().await;
        }
        match state.denial() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
