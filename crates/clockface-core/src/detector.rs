//! Face detector capability and the frame source it consumes.
//!
//! The detector itself is an external backend; the engine only needs one
//! operation from it. [`ModelService`] owns the backend once it has loaded
//! and hands out exclusive leases to sessions.

use crate::types::Detection;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detector is already in use by another session")]
    Busy,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera stream unavailable: {0}")]
    Unavailable(String),
}

/// Substitutable face detection backend.
///
/// Returns at most one detection per frame. `None` is normal: no face, poor
/// lighting or motion blur all produce it, so callers keep polling.
pub trait FaceDetector: Send {
    type Frame;

    fn detect(&mut self, frame: &Self::Frame) -> Option<Detection>;
}

/// Camera stream polled once per scheduled tick.
pub trait FrameSource: Send {
    type Frame: Send;

    /// `Ok(None)` when no new frame is ready yet. Errors are fatal for the session.
    fn grab(&mut self) -> Result<Option<Self::Frame>, StreamError>;
}

/// Lifecycle of the detector backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
}

/// Initialize-once holder for the detector backend.
pub struct ModelService<D> {
    state: watch::Sender<ModelState>,
    slot: Arc<Mutex<Option<D>>>,
}

/// Exclusive access to a loaded detector for the length of one session.
pub struct DetectorLease<D> {
    guard: OwnedMutexGuard<Option<D>>,
}

impl<D> DetectorLease<D> {
    pub fn get(&mut self) -> Option<&mut D> {
        self.guard.as_mut()
    }
}

impl<D: Send + 'static> Default for ModelService<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Send + 'static> ModelService<D> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ModelState::Uninitialized);
        Self {
            state,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Wrap a detector that is already loaded.
    pub fn ready_with(detector: D) -> Self {
        let (state, _) = watch::channel(ModelState::Ready);
        Self {
            state,
            slot: Arc::new(Mutex::new(Some(detector))),
        }
    }

    pub fn state(&self) -> ModelState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    /// Load the backend on a blocking thread.
    ///
    /// Only the first caller runs `load`; concurrent callers wait for its
    /// outcome. A failed service may be initialized again.
    pub async fn initialize<F>(&self, load: F) -> Result<(), DetectorError>
    where
        F: FnOnce() -> Result<D, DetectorError> + Send + 'static,
    {
        let claimed = self.state.send_if_modified(|state| match state {
            ModelState::Uninitialized | ModelState::Failed(_) => {
                *state = ModelState::Loading;
                true
            }
            _ => false,
        });
        if !claimed {
            return self.ready().await;
        }

        tracing::info!("loading face detector");
        let outcome = tokio::task::spawn_blocking(load)
            .await
            .unwrap_or_else(|e| Err(DetectorError::Unavailable(format!("loader panicked: {e}"))));

        match outcome {
            Ok(detector) => {
                *self.slot.lock().await = Some(detector);
                self.state.send_replace(ModelState::Ready);
                tracing::info!("face detector ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "face detector failed to load");
                self.state.send_replace(ModelState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait out an in-flight load. Fails at once if nothing was ever loaded.
    pub async fn ready(&self) -> Result<(), DetectorError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s != ModelState::Loading)
            .await
            .map_err(|_| DetectorError::Unavailable("model service dropped".into()))?
            .clone();
        match state {
            ModelState::Ready => Ok(()),
            ModelState::Failed(reason) => Err(DetectorError::Unavailable(reason)),
            ModelState::Uninitialized | ModelState::Loading => Err(DetectorError::Unavailable(
                "detector was never initialized".into(),
            )),
        }
    }

    /// Take the detector for one session. Fails fast if it is not ready or
    /// another session holds it.
    pub fn acquire(&self) -> Result<DetectorLease<D>, DetectorError> {
        match self.state() {
            ModelState::Ready => {}
            ModelState::Failed(reason) => return Err(DetectorError::Unavailable(reason)),
            other => {
                return Err(DetectorError::Unavailable(format!("detector is {other:?}")));
            }
        }
        let guard = self
            .slot
            .clone()
            .try_lock_owned()
            .map_err(|_| DetectorError::Busy)?;
        Ok(DetectorLease { guard })
    }
}
