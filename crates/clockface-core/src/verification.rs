//! Live verification against one stored template.

use crate::accumulator::{Settlement, StabilityAccumulator, StabilityParams, Tick};
use crate::scorer::Calibration;
use crate::session::{FrameSession, InvalidTransition};
use crate::template::{self, TemplateError};
use crate::types::{Descriptor, Detection};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Verification tuning. The threshold itself comes from the threshold source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub stable_frames: u32,
    #[serde(rename = "timeout_ms", with = "crate::accumulator::duration_ms")]
    pub timeout: Duration,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            stable_frames: 10,
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Idle,
    Verifying,
    Accepted,
    Rejected,
    Cancelled,
}

/// Final decision for one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub accepted: bool,
    /// Highest similarity seen during the attempt, 0–100.
    pub best_similarity: u8,
    /// Detector quality on the frame that produced `best_similarity`.
    pub best_confidence: f32,
    /// True when decided by a full stable run rather than the timeout.
    pub sustained: bool,
    pub threshold: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEvent {
    /// Emitted for every frame. Both values are `None` when no face was found.
    Progress {
        confidence: Option<f32>,
        similarity: Option<u8>,
        stable_frames: u32,
    },
    Finished(Verdict),
    Cancelled,
}

pub struct VerificationController {
    session_id: Uuid,
    employee_id: String,
    template: Descriptor,
    threshold: u8,
    calibration: Calibration,
    accumulator: StabilityAccumulator<f32>,
    state: VerificationState,
    verdict: Option<Verdict>,
}

impl VerificationController {
    /// Build a controller for a stored template. Fails if the template cannot
    /// be decoded; the employee has to re-enroll in that case.
    pub fn new(
        employee_id: impl Into<String>,
        stored: &str,
        threshold: u8,
        settings: &VerificationSettings,
        calibration: Calibration,
    ) -> Result<Self, TemplateError> {
        let template = template::deserialize(stored)?;
        Ok(Self::with_template(
            employee_id,
            template,
            threshold,
            settings,
            calibration,
        ))
    }

    pub fn with_template(
        employee_id: impl Into<String>,
        template: Descriptor,
        threshold: u8,
        settings: &VerificationSettings,
        calibration: Calibration,
    ) -> Self {
        let params =
            StabilityParams::verification(settings.stable_frames, threshold, settings.timeout);
        Self {
            session_id: Uuid::new_v4(),
            employee_id: employee_id.into(),
            template,
            threshold,
            calibration,
            accumulator: StabilityAccumulator::new(params),
            state: VerificationState::Idle,
            verdict: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub fn start(&mut self, now: Instant) -> Result<(), InvalidTransition> {
        if self.state != VerificationState::Idle {
            return Err(InvalidTransition {
                action: "start verification",
                state: format!("{:?}", self.state),
            });
        }
        tracing::info!(
            session = %self.session_id,
            employee = %self.employee_id,
            threshold = self.threshold,
            "verification started"
        );
        self.state = VerificationState::Verifying;
        self.accumulator.start(now);
        Ok(())
    }

    pub fn on_frame(&mut self, detection: Option<Detection>, now: Instant) -> Vec<VerificationEvent> {
        if self.state != VerificationState::Verifying {
            return Vec::new();
        }

        let scored = detection.map(|d| {
            let distance = d.descriptor.euclidean_distance(&self.template);
            (d.quality, self.calibration.similarity(distance))
        });
        let sample = scored.map(|(confidence, similarity)| (confidence, f32::from(similarity)));
        let tick = self.accumulator.observe(sample, now);

        let mut events = vec![VerificationEvent::Progress {
            confidence: scored.map(|(c, _)| c),
            similarity: scored.map(|(_, s)| s),
            stable_frames: self.accumulator.stable_frames(),
        }];
        events.extend(self.handle_tick(tick));
        events
    }

    pub fn on_idle(&mut self, now: Instant) -> Vec<VerificationEvent> {
        if self.state != VerificationState::Verifying {
            return Vec::new();
        }
        let tick = self.accumulator.expire(now);
        self.handle_tick(tick)
    }

    pub fn cancel(&mut self) -> Vec<VerificationEvent> {
        match self.state {
            VerificationState::Idle | VerificationState::Verifying => {
                self.accumulator.cancel();
                self.state = VerificationState::Cancelled;
                tracing::info!(session = %self.session_id, "verification cancelled");
                vec![VerificationEvent::Cancelled]
            }
            _ => Vec::new(),
        }
    }

    fn handle_tick(&mut self, tick: Tick<f32>) -> Vec<VerificationEvent> {
        let verdict = match tick {
            Tick::Settled(Settlement::Stable { best, score }) => {
                self.make_verdict(true, true, Some((best, score)))
            }
            Tick::Settled(Settlement::Fallback { best, score }) => {
                self.make_verdict(true, false, Some((best, score)))
            }
            Tick::Settled(Settlement::Failed { best }) => self.make_verdict(false, false, best),
            Tick::Pending { .. } | Tick::Inactive => return Vec::new(),
        };

        self.state = if verdict.accepted {
            VerificationState::Accepted
        } else {
            VerificationState::Rejected
        };
        self.verdict = Some(verdict);

        tracing::info!(
            session = %self.session_id,
            employee = %self.employee_id,
            accepted = verdict.accepted,
            sustained = verdict.sustained,
            best_similarity = verdict.best_similarity,
            best_confidence = verdict.best_confidence,
            "verification finished"
        );
        vec![VerificationEvent::Finished(verdict)]
    }

    fn make_verdict(&self, accepted: bool, sustained: bool, best: Option<(f32, f32)>) -> Verdict {
        let (best_confidence, best_similarity) = best.unwrap_or((0.0, 0.0));
        Verdict {
            accepted,
            best_similarity: best_similarity.round() as u8,
            best_confidence,
            sustained,
            threshold: self.threshold,
        }
    }
}

impl FrameSession for VerificationController {
    type Event = VerificationEvent;

    fn begin(&mut self, now: Instant) -> Vec<VerificationEvent> {
        let _ = self.start(now);
        Vec::new()
    }

    fn on_frame(&mut self, detection: Option<Detection>, now: Instant) -> Vec<VerificationEvent> {
        VerificationController::on_frame(self, detection, now)
    }

    fn on_idle(&mut self, now: Instant) -> Vec<VerificationEvent> {
        VerificationController::on_idle(self, now)
    }

    fn cancel(&mut self) -> Vec<VerificationEvent> {
        VerificationController::cancel(self)
    }

    fn is_active(&self) -> bool {
        self.state == VerificationState::Verifying
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(50);

    /// A descriptor at exactly `distance` from `base` (shift on one axis).
    fn at_distance(base: &Descriptor, distance: f32) -> Descriptor {
        let mut values = base.values().to_vec();
        values[0] += distance;
        Descriptor::new(values).unwrap()
    }

    fn controller(template: Descriptor, threshold: u8) -> (VerificationController, Instant) {
        let mut c = VerificationController::with_template(
            "emp-3",
            template,
            threshold,
            &VerificationSettings::default(),
            Calibration::default(),
        );
        let t0 = Instant::now();
        c.start(t0).unwrap();
        (c, t0)
    }

    fn finished(events: &[VerificationEvent]) -> Option<Verdict> {
        events.iter().find_map(|e| match e {
            VerificationEvent::Finished(v) => Some(*v),
            _ => None,
        })
    }

    #[test]
    fn test_identical_descriptor_accepts_after_ten_frames() {
        let six = vec![Descriptor::splat(0.3).unwrap(); 6];
        let stored = template::serialize(&template::average(&six).unwrap());
        let mut c = VerificationController::new(
            "emp-3",
            &stored,
            80,
            &VerificationSettings::default(),
            Calibration::default(),
        )
        .unwrap();
        let t0 = Instant::now();
        c.start(t0).unwrap();

        for i in 1..10u32 {
            let events = c.on_frame(Some(Detection::new(Descriptor::splat(0.3).unwrap(), 95.0)), t0 + FRAME * i);
            assert_eq!(
                events,
                vec![VerificationEvent::Progress {
                    confidence: Some(95.0),
                    similarity: Some(100),
                    stable_frames: i,
                }]
            );
        }
        let events = c.on_frame(Some(Detection::new(Descriptor::splat(0.3).unwrap(), 95.0)), t0 + FRAME * 10);
        let verdict = finished(&events).expect("verdict on tenth frame");
        assert!(verdict.accepted && verdict.sustained);
        assert_eq!(verdict.best_similarity, 100);
        assert_eq!(verdict.best_confidence, 95.0);
        assert_eq!(c.state(), VerificationState::Accepted);
        assert!(c.on_frame(None, t0 + FRAME * 11).is_empty());
    }

    #[test]
    fn test_reports_best_not_triggering_frame() {
        let base = Descriptor::splat(0.0).unwrap();
        let (mut c, t0) = controller(base.clone(), 80);
        // One perfect frame at low confidence, then nine frames at 90%.
        c.on_frame(Some(Detection::new(base.clone(), 60.0)), t0 + FRAME);
        let mut last = Vec::new();
        for i in 2..=10u32 {
            last = c.on_frame(Some(Detection::new(at_distance(&base, 0.3), 99.0)), t0 + FRAME * i);
        }
        let verdict = finished(&last).unwrap();
        assert!(verdict.accepted);
        assert_eq!(verdict.best_similarity, 100);
        assert_eq!(verdict.best_confidence, 60.0);
    }

    #[test]
    fn test_sustained_sixty_percent_rejects() {
        let base = Descriptor::splat(0.0).unwrap();
        let (mut c, t0) = controller(base.clone(), 80);
        // 0.6 < d ≤ 0.8: 40 + (0.8 - d) / 0.2 * 30 = 60 → d ≈ 0.6667
        let probe = at_distance(&base, 0.6667);
        let mut verdict = None;
        for i in 1..=1000u32 {
            let events = c.on_frame(Some(Detection::new(probe.clone(), 90.0)), t0 + FRAME * i);
            assert!(matches!(
                events.first(),
                Some(VerificationEvent::Progress { similarity: Some(60), .. })
            ));
            if let Some(v) = finished(&events) {
                verdict = Some((v, FRAME * i));
                break;
            }
        }
        let (verdict, elapsed) = verdict.expect("timeout verdict");
        assert_eq!(elapsed, Duration::from_secs(20));
        assert!(!verdict.accepted);
        assert!(!verdict.sustained);
        assert_eq!(verdict.best_similarity, 60);
        assert_eq!(c.state(), VerificationState::Rejected);
    }

    #[test]
    fn test_interrupted_passes_accept_on_timeout() {
        let base = Descriptor::splat(0.0).unwrap();
        let (mut c, t0) = controller(base.clone(), 80);
        let mut verdict = None;
        for i in 1..=1000u32 {
            // Nine passing frames, then a miss, repeated.
            let detection = (i % 10 != 0).then(|| Detection::new(base.clone(), 88.0));
            if let Some(v) = finished(&c.on_frame(detection, t0 + FRAME * i)) {
                verdict = Some(v);
                break;
            }
        }
        let verdict = verdict.unwrap();
        assert!(verdict.accepted);
        assert!(!verdict.sustained);
        assert_eq!(verdict.best_similarity, 100);
        assert_eq!(verdict.best_confidence, 88.0);
    }

    #[test]
    fn test_no_face_progress_and_rejection() {
        let (mut c, t0) = controller(Descriptor::splat(0.0).unwrap(), 80);
        let events = c.on_frame(None, t0 + FRAME);
        assert_eq!(
            events,
            vec![VerificationEvent::Progress {
                confidence: None,
                similarity: None,
                stable_frames: 0,
            }]
        );
        let events = c.on_idle(t0 + Duration::from_secs(20));
        let verdict = finished(&events).unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.best_similarity, 0);
    }

    #[test]
    fn test_malformed_template_is_rejected_up_front() {
        let result = VerificationController::new(
            "emp-3",
            "[1,2,3]",
            80,
            &VerificationSettings::default(),
            Calibration::default(),
        );
        assert!(matches!(result, Err(TemplateError::Descriptor(_))));
    }

    #[test]
    fn test_cancel_suppresses_verdict() {
        let base = Descriptor::splat(0.0).unwrap();
        let (mut c, t0) = controller(base.clone(), 80);
        c.on_frame(Some(Detection::new(base.clone(), 90.0)), t0 + FRAME);
        assert_eq!(c.cancel(), vec![VerificationEvent::Cancelled]);
        assert!(c.on_frame(Some(Detection::new(base, 90.0)), t0 + FRAME * 2).is_empty());
        assert!(c.on_idle(t0 + Duration::from_secs(30)).is_empty());
        assert!(c.cancel().is_empty());
        assert_eq!(c.verdict(), None);
    }
}
