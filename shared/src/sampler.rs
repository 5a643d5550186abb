use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::{Accuracy, SamplingProfile};
use crate::error::{AppError, ErrorKind};
use crate::model::{Coordinate, LocationSample};
use crate::permission::{PermissionError, PermissionGate};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SamplerError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location permission blocked")]
    PermissionBlocked,
    #[error("position query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("location platform error: {0}")]
    Platform(String),
}

impl From<PermissionError> for SamplerError {
    fn from(e: PermissionError) -> Self {
        match e {
            PermissionError::Blocked => Self::PermissionBlocked,
            PermissionError::Denied | PermissionError::Platform(_) => Self::PermissionDenied,
        }
    }
}

impl From<SamplerError> for AppError {
    fn from(e: SamplerError) -> Self {
        let kind = match &e {
            SamplerError::PermissionDenied => ErrorKind::PermissionDenied,
            SamplerError::PermissionBlocked => ErrorKind::PermissionBlocked,
            SamplerError::Timeout { .. } => ErrorKind::SamplerTimeout,
            SamplerError::Platform(_) => ErrorKind::Location,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchId(pub u64);

/// OS location API, implemented by the platform shell.
#[async_trait::async_trait]
pub trait LocationPlatform: Send + Sync {
    /// Opens a continuous foreground watch delivering fixes into `sink`.
    async fn watch_position(
        &self,
        profile: &SamplingProfile,
        sink: mpsc::UnboundedSender<LocationSample>,
    ) -> Result<WatchId, SamplerError>;
    async fn clear_watch(&self, watch: WatchId);
    /// Whether the named background task is currently registered with the OS.
    async fn has_started_background(&self, task: &str) -> Result<bool, SamplerError>;
    /// Registers the named background task. Not safe to call twice.
    async fn start_background(&self, task: &str, profile: &SamplingProfile)
        -> Result<(), SamplerError>;
    async fn stop_background(&self, task: &str) -> Result<(), SamplerError>;
    async fn current_position(&self, accuracy: Accuracy) -> Result<LocationSample, SamplerError>;
}

/// Fixes from one foreground watch. Ends when the watch is closed by the
/// sampler, whether by `stop` or by a newer `start_foreground`.
pub struct SampleStream {
    rx: mpsc::UnboundedReceiver<LocationSample>,
    closed: oneshot::Receiver<()>,
    min_distance_m: f64,
    last: Option<Coordinate>,
    done: bool,
}

impl SampleStream {
    pub async fn recv(&mut self) -> Option<LocationSample> {
        loop {
            if self.done {
                return None;
            }
            let next = tokio::select! {
                biased;
                _ = &mut self.closed => None,
                sample = self.rx.recv() => sample,
            };
            let Some(sample) = next else {
                self.done = true;
                return None;
            };
            // Some platforms ignore the distance filter.
            if let Some(last) = self.last {
                if last.distance_to(sample.coordinate) < self.min_distance_m {
                    continue;
                }
            }
            self.last = Some(sample.coordinate);
            return Some(sample);
        }
    }
}

struct ForegroundWatch {
    id: WatchId,
    _close: oneshot::Sender<()>,
}

#[derive(Default)]
struct Channels {
    foreground: Option<ForegroundWatch>,
    background: Option<SamplingProfile>,
}

/// Sole owner of the OS sampling primitives: at most one foreground watch
/// and at most one background registration exist at any time.
pub struct LocationSampler {
    platform: Arc<dyn LocationPlatform>,
    permissions: Arc<PermissionGate>,
    background_task: String,
    prompt_allowed: AtomicBool,
    channels: Mutex<Channels>,
}

impl LocationSampler {
    pub fn new(
        platform: Arc<dyn LocationPlatform>,
        permissions: Arc<PermissionGate>,
        background_task: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            permissions,
            background_task: background_task.into(),
            prompt_allowed: AtomicBool::new(false),
            channels: Mutex::new(Channels::default()),
        }
    }

    pub fn permissions(&self) -> &Arc<PermissionGate> {
        &self.permissions
    }

    /// Lets sampler calls prompt for a never-asked permission. Off until the
    /// user has accepted the background-location disclosure.
    pub fn allow_prompt(&self, allowed: bool) {
        self.prompt_allowed.store(allowed, Ordering::SeqCst);
    }

    pub async fn ensure_permission(&self) -> Result<(), SamplerError> {
        let allow_prompt = self.prompt_allowed.load(Ordering::SeqCst);
        self.permissions
            .ensure_granted(allow_prompt)
            .await
            .map_err(SamplerError::from)
    }

    #[instrument(skip(self, profile), fields(interval_ms = profile.min_interval_ms))]
    pub async fn start_foreground(
        &self,
        profile: &SamplingProfile,
    ) -> Result<SampleStream, SamplerError> {
        let mut channels = self.channels.lock().await;

        if let Some(previous) = channels.foreground.take() {
            debug!(watch = previous.id.0, "closing previous foreground watch");
            self.platform.clear_watch(previous.id).await;
        }

        self.ensure_permission().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let id = self.platform.watch_position(profile, tx).await?;
        channels.foreground = Some(ForegroundWatch {
            id,
            _close: close_tx,
        });
        info!(watch = id.0, "foreground watch started");

        Ok(SampleStream {
            rx,
            closed: close_rx,
            min_distance_m: profile.min_distance_m,
            last: None,
            done: false,
        })
    }

    #[instrument(skip(self, profile), fields(task = %self.background_task))]
    pub async fn start_background(&self, profile: &SamplingProfile) -> Result<(), SamplerError> {
        let mut channels = self.channels.lock().await;

        if channels.background.as_ref() == Some(profile) {
            debug!("background sampling already registered with this profile");
            return Ok(());
        }

        self.ensure_permission().await?;

        let running = self
            .platform
            .has_started_background(&self.background_task)
            .await?;
        if running {
            if channels.background.is_none() {
                // Registration survived a process restart; adopt it.
                info!("adopting existing background registration");
                channels.background = Some(profile.clone());
                return Ok(());
            }
            self.platform.stop_background(&self.background_task).await?;
            channels.background = None;
        }

        self.platform
            .start_background(&self.background_task, profile)
            .await?;
        channels.background = Some(profile.clone());
        info!("background sampling registered");
        Ok(())
    }

    /// Releases both channels. Safe to call when nothing is running.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut channels = self.channels.lock().await;

        if let Some(watch) = channels.foreground.take() {
            self.platform.clear_watch(watch.id).await;
            info!(watch = watch.id.0, "foreground watch stopped");
        }

        let had_background = channels.background.take().is_some();
        let registered = match self
            .platform
            .has_started_background(&self.background_task)
            .await
        {
            Ok(registered) => registered,
            Err(e) => {
                warn!(error = %e, "background status query failed");
                had_background
            }
        };
        if registered {
            match self.platform.stop_background(&self.background_task).await {
                Ok(()) => info!("background sampling stopped"),
                Err(e) => warn!(error = %e, "failed to stop background sampling"),
            }
        }
    }

    /// One-shot position query raced against `timeout`. Needs no active watch.
    #[instrument(skip(self))]
    pub async fn get_current_position(
        &self,
        timeout: Duration,
    ) -> Result<LocationSample, SamplerError> {
        self.ensure_permission().await?;

        match tokio::time::timeout(timeout, self.platform.current_position(Accuracy::High)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "position query timed out");
                Err(SamplerError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn foreground_active(&self) -> bool {
        self.channels.lock().await.foreground.is_some()
    }

    pub async fn background_active(&self) -> bool {
        self.channels.lock().await.background.is_some()
    }
}
