//! Multi-pose enrollment.
//!
//! Each training step runs one stability accumulation over detector quality.
//! Once every step has a descriptor, the descriptors are averaged into one
//! template and handed to the template repository.

use crate::accumulator::{Settlement, StabilityAccumulator, StabilityParams, Tick};
use crate::repository::TemplateRepository;
use crate::session::{FrameSession, InvalidTransition};
use crate::template;
use crate::types::{Descriptor, Detection, StoredTemplate, TrainingStep};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Idle,
    StepActive(usize),
    /// The step timed out below the fallback floor. Only this step can be retried.
    StepFailed(usize),
    Finalizing,
    Done,
    /// Finalization could not produce or persist the template.
    Failed,
    Cancelled,
}

impl EnrollmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentEvent {
    StepStarted {
        step: usize,
        instruction: String,
    },
    Progress {
        step: usize,
        quality: Option<f32>,
        stable_frames: u32,
    },
    StepCompleted {
        step: usize,
        score: f32,
        /// Completed on timeout from the best frame rather than a stable run.
        fallback: bool,
    },
    StepFailed {
        step: usize,
        message: String,
    },
    Completed(StoredTemplate),
    Failed {
        message: String,
    },
    Cancelled,
}

/// Drives one enrollment session for one employee.
pub struct EnrollmentController {
    session_id: Uuid,
    employee_id: String,
    steps: Vec<TrainingStep>,
    descriptors: Vec<Option<Descriptor>>,
    accumulator: StabilityAccumulator<Descriptor>,
    repository: Arc<dyn TemplateRepository>,
    state: EnrollmentState,
}

impl EnrollmentController {
    pub fn new(
        employee_id: impl Into<String>,
        steps: Vec<TrainingStep>,
        params: StabilityParams,
        repository: Arc<dyn TemplateRepository>,
    ) -> Self {
        let descriptors = vec![None; steps.len()];
        Self {
            session_id: Uuid::new_v4(),
            employee_id: employee_id.into(),
            steps,
            descriptors,
            accumulator: StabilityAccumulator::new(params),
            repository,
            state: EnrollmentState::Idle,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn employee_id(&self) -> &str {
        &self.employee_id
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    pub fn steps(&self) -> &[TrainingStep] {
        &self.steps
    }

    pub fn start(&mut self, now: Instant) -> Result<Vec<EnrollmentEvent>, InvalidTransition> {
        if self.state != EnrollmentState::Idle {
            return Err(self.invalid("start"));
        }
        if self.steps.is_empty() {
            return Ok(self.finalize());
        }
        tracing::info!(
            session = %self.session_id,
            employee = %self.employee_id,
            steps = self.steps.len(),
            "enrollment started"
        );
        Ok(vec![self.enter_step(0, now)])
    }

    /// Restart the step that failed. Collected steps are kept.
    pub fn retry_step(&mut self, now: Instant) -> Result<Vec<EnrollmentEvent>, InvalidTransition> {
        let EnrollmentState::StepFailed(step) = self.state else {
            return Err(self.invalid("retry step"));
        };
        tracing::info!(session = %self.session_id, step, "retrying enrollment step");
        Ok(vec![self.enter_step(step, now)])
    }

    pub fn cancel(&mut self) -> Vec<EnrollmentEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.accumulator.cancel();
        self.state = EnrollmentState::Cancelled;
        tracing::info!(session = %self.session_id, "enrollment cancelled");
        vec![EnrollmentEvent::Cancelled]
    }

    pub fn on_frame(&mut self, detection: Option<Detection>, now: Instant) -> Vec<EnrollmentEvent> {
        let EnrollmentState::StepActive(step) = self.state else {
            return Vec::new();
        };
        let sample = detection.map(|d| (d.descriptor, d.quality));
        let tick = self.accumulator.observe(sample, now);
        self.handle_tick(step, tick, now)
    }

    pub fn on_idle(&mut self, now: Instant) -> Vec<EnrollmentEvent> {
        let EnrollmentState::StepActive(step) = self.state else {
            return Vec::new();
        };
        match self.accumulator.expire(now) {
            Tick::Pending { .. } => Vec::new(),
            tick => self.handle_tick(step, tick, now),
        }
    }

    fn handle_tick(
        &mut self,
        step: usize,
        tick: Tick<Descriptor>,
        now: Instant,
    ) -> Vec<EnrollmentEvent> {
        match tick {
            Tick::Pending {
                score,
                stable_frames,
            } => vec![EnrollmentEvent::Progress {
                step,
                quality: score,
                stable_frames,
            }],
            Tick::Settled(Settlement::Stable { best, score }) => {
                self.complete_step(step, best, score, false, now)
            }
            Tick::Settled(Settlement::Fallback { best, score }) => {
                tracing::warn!(
                    session = %self.session_id,
                    step,
                    score,
                    "step timed out; using best frame"
                );
                self.complete_step(step, best, score, true, now)
            }
            Tick::Settled(Settlement::Failed { best }) => {
                let params = self.accumulator.params();
                let message = match best {
                    Some((_, score)) => format!(
                        "step {} timed out after {}s: best quality {score:.0}, need at least {:.0}",
                        step + 1,
                        params.timeout.as_secs(),
                        params.fallback_floor
                    ),
                    None => format!(
                        "step {} timed out after {}s: no face detected",
                        step + 1,
                        params.timeout.as_secs()
                    ),
                };
                tracing::warn!(session = %self.session_id, step, %message, "enrollment step failed");
                self.state = EnrollmentState::StepFailed(step);
                vec![EnrollmentEvent::StepFailed { step, message }]
            }
            Tick::Inactive => Vec::new(),
        }
    }

    fn enter_step(&mut self, step: usize, now: Instant) -> EnrollmentEvent {
        self.state = EnrollmentState::StepActive(step);
        self.accumulator.start(now);
        EnrollmentEvent::StepStarted {
            step,
            instruction: self.steps[step].instruction.clone(),
        }
    }

    fn complete_step(
        &mut self,
        step: usize,
        descriptor: Descriptor,
        score: f32,
        fallback: bool,
        now: Instant,
    ) -> Vec<EnrollmentEvent> {
        self.descriptors[step] = Some(descriptor);
        let entry = &mut self.steps[step];
        entry.completed = true;
        entry.score = Some(score);

        tracing::info!(session = %self.session_id, step, score, fallback, "enrollment step completed");

        let mut events = vec![EnrollmentEvent::StepCompleted {
            step,
            score,
            fallback,
        }];
        if step + 1 < self.steps.len() {
            events.push(self.enter_step(step + 1, now));
        } else {
            events.extend(self.finalize());
        }
        events
    }

    fn finalize(&mut self) -> Vec<EnrollmentEvent> {
        self.state = EnrollmentState::Finalizing;

        match self.build_template() {
            Ok(stored) => {
                tracing::info!(
                    session = %self.session_id,
                    employee = %self.employee_id,
                    training_score = stored.training_score,
                    "enrollment complete"
                );
                self.state = EnrollmentState::Done;
                vec![EnrollmentEvent::Completed(stored)]
            }
            Err(message) => {
                tracing::warn!(session = %self.session_id, %message, "enrollment finalization failed");
                self.state = EnrollmentState::Failed;
                vec![EnrollmentEvent::Failed { message }]
            }
        }
    }

    fn build_template(&self) -> Result<StoredTemplate, String> {
        let descriptors: Vec<Descriptor> = self.descriptors.iter().flatten().cloned().collect();
        let averaged = template::average(&descriptors).map_err(|e| e.to_string())?;

        let scores: Vec<f64> = self
            .steps
            .iter()
            .filter_map(|s| s.score.map(f64::from))
            .collect();
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;

        let stored = StoredTemplate {
            serialized: template::serialize(&averaged),
            training_score: (mean * 100.0).round() / 100.0,
        };

        self.repository
            .put_template(&self.employee_id, &stored)
            .map_err(|e| e.to_string())?;
        Ok(stored)
    }

    fn invalid(&self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            action,
            state: format!("{:?}", self.state),
        }
    }
}

impl FrameSession for EnrollmentController {
    type Event = EnrollmentEvent;

    fn begin(&mut self, now: Instant) -> Vec<EnrollmentEvent> {
        // Resuming after retry_step is already active; only Idle needs starting.
        self.start(now).unwrap_or_default()
    }

    fn on_frame(&mut self, detection: Option<Detection>, now: Instant) -> Vec<EnrollmentEvent> {
        EnrollmentController::on_frame(self, detection, now)
    }

    fn on_idle(&mut self, now: Instant) -> Vec<EnrollmentEvent> {
        EnrollmentController::on_idle(self, now)
    }

    fn cancel(&mut self) -> Vec<EnrollmentEvent> {
        EnrollmentController::cancel(self)
    }

    fn is_active(&self) -> bool {
        matches!(self.state, EnrollmentState::StepActive(_))
    }
}
