use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    PermissionBlocked,
    SamplerTimeout,
    IllegalTransition,
    SyncFailure,
    SubscriptionError,
    Location,
    AddressLookup,
    NotFound,
    Validation,
    InvalidState,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::PermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::PermissionBlocked => "LOCATION_PERMISSION_BLOCKED",
            Self::SamplerTimeout => "LOCATION_TIMEOUT",
            Self::IllegalTransition => "ILLEGAL_TRANSITION",
            Self::SyncFailure => "SYNC_FAILURE",
            Self::SubscriptionError => "SUBSCRIPTION_ERROR",
            Self::Location => "LOCATION_ERROR",
            Self::AddressLookup => "ADDRESS_LOOKUP_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Validation => "VALIDATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::PermissionDenied
            | Self::SamplerTimeout
            | Self::SyncFailure
            | Self::SubscriptionError
            | Self::Location
            | Self::AddressLookup => ErrorSeverity::Transient,

            Self::PermissionBlocked | Self::NotFound | Self::Validation => {
                ErrorSeverity::Permanent
            }

            Self::IllegalTransition | Self::InvalidState | Self::Internal => ErrorSeverity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::SamplerTimeout
                | Self::SyncFailure
                | Self::SubscriptionError
                | Self::Location
                | Self::AddressLookup
        )
    }

    /// What the UI should offer next to the message.
    #[must_use]
    pub const fn call_to_action(self) -> CallToAction {
        match self {
            Self::PermissionBlocked => CallToAction::OpenSettings,
            _ if self.is_retryable() => CallToAction::Retry,
            _ => CallToAction::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallToAction {
    Retry,
    OpenSettings,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::PermissionDenied => {
                "Location access is needed to track your ride. Tap retry to allow it.".into()
            }
            ErrorKind::PermissionBlocked => {
                "Location access is turned off. Please enable it in Settings.".into()
            }
            ErrorKind::SamplerTimeout => {
                "We couldn't get your location in time. Please try again.".into()
            }
            ErrorKind::Location => {
                "Unable to determine your location. Please check your GPS settings.".into()
            }
            ErrorKind::AddressLookup => "Address unavailable right now.".into(),
            ErrorKind::SyncFailure => {
                "We couldn't reach the server. Your ride was not updated, please try again.".into()
            }
            ErrorKind::SubscriptionError => "Reconnecting to live updates...".into(),
            ErrorKind::NotFound => "The ride could not be found.".into(),
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::IllegalTransition | ErrorKind::InvalidState => {
                "This action is not available for the ride right now.".into()
            }
            ErrorKind::Internal => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

/// Error as shown to the rider or driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
    pub action: CallToAction,
}

impl From<&AppError> for UserFacingError {
    fn from(error: &AppError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.user_facing_message(),
            action: error.kind.call_to_action(),
        }
    }
}

impl From<AppError> for UserFacingError {
    fn from(error: AppError) -> Self {
        Self::from(&error)
    }
}
