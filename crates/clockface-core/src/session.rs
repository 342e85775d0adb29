//! Frame scheduling for enrollment and verification sessions.
//!
//! A session is a synchronous state machine fed one frame at a time. [`drive`]
//! owns the timing: it ticks at a fixed cadence, grabs a frame, runs the
//! detector and feeds the result in, until the session stops accepting
//! frames or the stop signal fires.

use crate::detector::{FaceDetector, FrameSource, StreamError};
use crate::types::Detection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} while {state}")]
pub struct InvalidTransition {
    pub action: &'static str,
    pub state: String,
}

/// A state machine that consumes detector output frame by frame.
pub trait FrameSession {
    type Event: Send;

    /// Start the session if it has not started yet.
    fn begin(&mut self, now: Instant) -> Vec<Self::Event>;

    /// Feed the detector result for one frame.
    fn on_frame(&mut self, detection: Option<Detection>, now: Instant) -> Vec<Self::Event>;

    /// A tick passed with no frame available. Only deadlines advance.
    fn on_idle(&mut self, now: Instant) -> Vec<Self::Event>;

    /// Stop immediately. Emits nothing once the session is terminal.
    fn cancel(&mut self) -> Vec<Self::Event>;

    /// Whether the session still wants frames.
    fn is_active(&self) -> bool;
}

/// Owner side of a cooperative cancellation token.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Session side of a cooperative cancellation token.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        stop_pair().1
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop has been requested.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            // Handle dropped without stopping: nobody can stop us any more.
            std::future::pending::<()>().await;
        }
    }
}

pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

/// Run `session` until it settles, is stopped, or the stream fails.
///
/// Events are forwarded as they happen; a dropped receiver is ignored. On a
/// stream error the session is cancelled silently and the error returned.
pub async fn drive<S, F, D>(
    session: &mut S,
    source: &mut F,
    detector: &mut D,
    frame_interval: Duration,
    events: &mpsc::UnboundedSender<S::Event>,
    stop: &mut StopSignal,
) -> Result<(), StreamError>
where
    S: FrameSession,
    F: FrameSource,
    D: FaceDetector<Frame = F::Frame>,
{
    let emit = |batch: Vec<S::Event>| {
        for event in batch {
            let _ = events.send(event);
        }
    };

    if stop.is_stopped() {
        emit(session.cancel());
        return Ok(());
    }

    emit(session.begin(Instant::now()));

    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while session.is_active() {
        tokio::select! {
            biased;
            _ = stop.stopped() => {
                tracing::debug!("session stopped by caller");
                emit(session.cancel());
                break;
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        match source.grab() {
            Ok(Some(frame)) => {
                let detection = detector.detect(&frame);
                emit(session.on_frame(detection, now));
            }
            Ok(None) => emit(session.on_idle(now)),
            Err(e) => {
                tracing::warn!(error = %e, "frame source failed; aborting session");
                let _ = session.cancel();
                return Err(e);
            }
        }
    }

    Ok(())
}
