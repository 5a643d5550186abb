use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::{AppError, ErrorKind};
use crate::tracking::TrackingMode;

pub const DEFAULT_BACKGROUND_TASK: &str = "background-location-task";
pub const PROLONGED_WAIT_REASON: &str = "prolonged wait";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    Lowest,
    Low,
    Balanced,
    High,
    Highest,
    BestForNavigation,
}

/// How the OS sampler is asked to deliver fixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingProfile {
    pub accuracy: Accuracy,
    pub min_interval_ms: u64,
    pub min_distance_m: f64,
    pub background_enabled: bool,
    /// Text of the persistent OS indicator while sampling in the background.
    pub indicator_title: String,
    pub indicator_body: String,
}

impl SamplingProfile {
    #[must_use]
    pub fn passive() -> Self {
        Self {
            accuracy: Accuracy::Balanced,
            min_interval_ms: 30_000,
            min_distance_m: 50.0,
            background_enabled: false,
            indicator_title: "Location active".into(),
            indicator_body: "Your location is shared while you are online.".into(),
        }
    }

    #[must_use]
    pub fn ride() -> Self {
        Self {
            accuracy: Accuracy::High,
            min_interval_ms: 5_000,
            min_distance_m: 10.0,
            background_enabled: true,
            indicator_title: "Ride in progress".into(),
            indicator_body: "Your location is shared with your trip partner.".into(),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.min_interval_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{name}.min_interval_ms must be > 0"
            )));
        }
        if !self.min_distance_m.is_finite() || self.min_distance_m < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "{name}.min_distance_m must be a non-negative number"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub passive: SamplingProfile,
    pub ride: SamplingProfile,
    pub current_position_timeout_ms: u64,
    pub background_task: String,
    pub address_cache_capacity: usize,
    /// Decimal places used to bucket coordinates for the address cache.
    pub address_cache_precision: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            passive: SamplingProfile::passive(),
            ride: SamplingProfile::ride(),
            current_position_timeout_ms: 10_000,
            background_task: DEFAULT_BACKGROUND_TASK.into(),
            address_cache_capacity: 64,
            address_cache_precision: 4,
        }
    }
}

impl TrackingConfig {
    /// Sampling profile for `mode`; `None` for modes that run no sampler.
    #[must_use]
    pub fn profile_for(&self, mode: TrackingMode) -> Option<&SamplingProfile> {
        match mode {
            TrackingMode::Passive => Some(&self.passive),
            TrackingMode::Ride => Some(&self.ride),
            TrackingMode::Offline | TrackingMode::Invisible => None,
        }
    }

    #[must_use]
    pub const fn current_position_timeout(&self) -> Duration {
        Duration::from_millis(self.current_position_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.passive.validate("passive")?;
        self.ride.validate("ride")?;
        if self.current_position_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "current_position_timeout_ms must be > 0".into(),
            ));
        }
        if self.background_task.trim().is_empty() {
            return Err(ConfigError::Invalid("background_task cannot be empty".into()));
        }
        if self.address_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "address_cache_capacity must be > 0".into(),
            ));
        }
        if self.address_cache_precision > 7 {
            return Err(ConfigError::Invalid(
                "address_cache_precision must be <= 7".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDeadlineConfig {
    pub expanding_after_secs: u64,
    pub awaiting_after_secs: u64,
    pub prolonged_after_secs: u64,
    pub auto_cancel_after_secs: u64,
    pub auto_cancel_reason: String,
}

impl Default for SearchDeadlineConfig {
    fn default() -> Self {
        Self {
            expanding_after_secs: 90,
            awaiting_after_secs: 150,
            prolonged_after_secs: 240,
            auto_cancel_after_secs: 360,
            auto_cancel_reason: PROLONGED_WAIT_REASON.into(),
        }
    }
}

impl SearchDeadlineConfig {
    #[must_use]
    pub const fn auto_cancel_after(&self) -> Duration {
        Duration::from_secs(self.auto_cancel_after_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.expanding_after_secs < self.awaiting_after_secs
            && self.awaiting_after_secs < self.prolonged_after_secs)
        {
            return Err(ConfigError::Invalid(
                "search thresholds must be strictly increasing".into(),
            ));
        }
        if self.auto_cancel_after_secs < self.prolonged_after_secs {
            return Err(ConfigError::Invalid(
                "auto_cancel_after_secs must not precede prolonged_after_secs".into(),
            ));
        }
        if self.auto_cancel_reason.trim().is_empty() {
            return Err(ConfigError::Invalid("auto_cancel_reason cannot be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            jitter_max_ms: 1_000,
        }
    }
}

impl SubscriptionConfig {
    /// Exponential backoff before the `attempt`-th resubscribe, without jitter.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponential = self
            .base_retry_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        exponential.min(self.max_retry_delay_ms)
    }

    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_max_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_max_ms)
        };
        Duration::from_millis(self.backoff_ms(attempt).saturating_add(jitter))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_retry_delay_ms == 0 {
            return Err(ConfigError::Invalid("base_retry_delay_ms must be > 0".into()));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ConfigError::Invalid(
                "max_retry_delay_ms must be >= base_retry_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub search: SearchDeadlineConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
}

impl CoreConfig {
    /// Parses a JSON document handed over by the shell; missing sections
    /// fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracking.validate()?;
        self.search.validate()?;
        self.subscription.validate()
    }
}
