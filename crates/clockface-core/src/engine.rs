use crate::config::EngineConfig;
use crate::detector::{DetectorError, DetectorLease, FaceDetector, FrameSource, ModelService, StreamError};
use crate::enrollment::{EnrollmentController, EnrollmentEvent, EnrollmentState};
use crate::repository::{RepositoryError, TemplateRepository, ThresholdSource};
use crate::session::{self, InvalidTransition, StopSignal};
use crate::template::TemplateError;
use crate::verification::{VerificationController, VerificationEvent, Verdict};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("camera error: {0}")]
    Stream(#[from] StreamError),
    #[error("camera stream is in use by another session")]
    StreamBusy,
    #[error("employee {0} has no enrolled face template")]
    NotEnrolled(String),
    #[error("stored template for {employee} is unreadable, re-enrollment required: {source}")]
    MalformedTemplate {
        employee: String,
        source: TemplateError,
    },
    #[error("template store error: {0}")]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
}

/// Runs enrollment and verification sessions against one camera stream.
///
/// The stream and the detector are exclusive: a second session started while
/// one is running fails with [`EngineError::StreamBusy`] or
/// [`DetectorError::Busy`] instead of sharing frames.
pub struct Engine<D, S> {
    config: EngineConfig,
    models: Arc<ModelService<D>>,
    source: Mutex<S>,
    repository: Arc<dyn TemplateRepository>,
    thresholds: Arc<dyn ThresholdSource>,
}

impl<D, S> Engine<D, S>
where
    D: FaceDetector + 'static,
    S: FrameSource<Frame = D::Frame>,
{
    pub fn new(
        config: EngineConfig,
        models: Arc<ModelService<D>>,
        source: S,
        repository: Arc<dyn TemplateRepository>,
        thresholds: Arc<dyn ThresholdSource>,
    ) -> Self {
        Self {
            config,
            models,
            source: Mutex::new(source),
            repository,
            thresholds,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelService<D> {
        &self.models
    }

    /// Create a fresh enrollment session using the configured step plan.
    pub fn begin_enrollment(&self, employee_id: &str) -> EnrollmentController {
        EnrollmentController::new(
            employee_id,
            self.config.training_plan(),
            self.config.enrollment,
            self.repository.clone(),
        )
    }

    /// Drive an enrollment session until it completes, fails a step, or is
    /// stopped. After a step failure the caller may `retry_step` and call
    /// this again with the same controller.
    pub async fn run_enrollment(
        &self,
        controller: &mut EnrollmentController,
        events: &mpsc::UnboundedSender<EnrollmentEvent>,
        stop: &mut StopSignal,
    ) -> Result<EnrollmentState, EngineError> {
        if controller.state().is_terminal() {
            return Err(InvalidTransition {
                action: "run enrollment",
                state: format!("{:?}", controller.state()),
            }
            .into());
        }

        let Some((mut source, mut lease)) = self.claim(stop).await? else {
            for event in controller.cancel() {
                let _ = events.send(event);
            }
            return Ok(controller.state());
        };
        let detector = lease
            .get()
            .ok_or_else(|| DetectorError::Unavailable("detector slot empty".into()))?;

        tracing::debug!(
            session = %controller.session_id(),
            employee = controller.employee_id(),
            state = ?controller.state(),
            "running enrollment session"
        );
        session::drive(
            controller,
            &mut *source,
            detector,
            self.config.frame_interval(),
            events,
            stop,
        )
        .await?;

        Ok(controller.state())
    }

    /// Verify an employee against their stored template.
    ///
    /// Returns `None` if the session was stopped before a verdict.
    pub async fn verify(
        &self,
        employee_id: &str,
        events: &mpsc::UnboundedSender<VerificationEvent>,
        stop: &mut StopSignal,
    ) -> Result<Option<Verdict>, EngineError> {
        let threshold = self.thresholds.threshold();
        let stored = self
            .repository
            .get_template(employee_id)?
            .ok_or_else(|| EngineError::NotEnrolled(employee_id.to_string()))?;

        let mut controller = VerificationController::new(
            employee_id,
            &stored,
            threshold,
            &self.config.verification,
            self.config.calibration.clone(),
        )
        .map_err(|source| EngineError::MalformedTemplate {
            employee: employee_id.to_string(),
            source,
        })?;

        let Some((mut source, mut lease)) = self.claim(stop).await? else {
            for event in controller.cancel() {
                let _ = events.send(event);
            }
            return Ok(None);
        };
        let detector = lease
            .get()
            .ok_or_else(|| DetectorError::Unavailable("detector slot empty".into()))?;

        session::drive(
            &mut controller,
            &mut *source,
            detector,
            self.config.frame_interval(),
            events,
            stop,
        )
        .await?;

        Ok(controller.verdict())
    }

    /// Wait for the detector, then take exclusive hold of it and the stream.
    /// `None` if stop was requested first.
    async fn claim(
        &self,
        stop: &mut StopSignal,
    ) -> Result<Option<(MutexGuard<'_, S>, DetectorLease<D>)>, EngineError> {
        tokio::select! {
            biased;
            _ = stop.stopped() => {
                tracing::debug!("session stopped while waiting for the detector");
                return Ok(None);
            }
            ready = self.models.ready() => ready?,
        }
        let lease = self.models.acquire()?;
        let source = self.source.try_lock().map_err(|_| EngineError::StreamBusy)?;
        Ok(Some((source, lease)))
    }
}
