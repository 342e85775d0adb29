//! Stability accumulator: waits for N consecutive frames meeting a score bar.
//!
//! The accumulator is driven one frame at a time by its owner and never
//! blocks. It settles exactly once: on a stable run, on timeout (with a
//! best-effort fallback), or silently on cancellation.

use crate::types::clamp_score;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Tuning for one accumulator run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityParams {
    pub required_stable_frames: u32,
    /// Score a frame must reach to count towards the stable run.
    pub quality_target: f32,
    /// Minimum best-so-far score accepted when the run times out.
    pub fallback_floor: f32,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl StabilityParams {
    /// Enrollment defaults: 15 frames at quality 85, fallback 70, 45 s.
    pub const fn enrollment() -> Self {
        Self {
            required_stable_frames: 15,
            quality_target: 85.0,
            fallback_floor: 70.0,
            timeout: Duration::from_secs(45),
        }
    }

    /// Verification run against a similarity threshold; no softer fallback.
    pub fn verification(stable_frames: u32, threshold: u8, timeout: Duration) -> Self {
        Self {
            required_stable_frames: stable_frames,
            quality_target: f32::from(threshold),
            fallback_floor: f32::from(threshold),
            timeout,
        }
    }
}

impl Default for StabilityParams {
    fn default() -> Self {
        Self::enrollment()
    }
}

/// How an accumulator run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement<T> {
    /// The required number of consecutive frames met the target.
    Stable { best: T, score: f32 },
    /// Timed out, but the best frame reached the fallback floor.
    Fallback { best: T, score: f32 },
    /// Timed out with nothing good enough. Carries the best frame seen, if any.
    Failed { best: Option<(T, f32)> },
}

/// Result of feeding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick<T> {
    /// Still collecting. `score` is this frame's score, if a face was seen.
    Pending { score: Option<f32>, stable_frames: u32 },
    Settled(Settlement<T>),
    /// Not started, already settled, or cancelled.
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running { started: Instant },
    Done,
}

/// Accumulates per-frame samples of type `T` scored 0–100.
#[derive(Debug)]
pub struct StabilityAccumulator<T> {
    params: StabilityParams,
    phase: Phase,
    consecutive: u32,
    best: Option<(T, f32)>,
}

impl<T: Clone> StabilityAccumulator<T> {
    pub fn new(params: StabilityParams) -> Self {
        Self {
            params,
            phase: Phase::Idle,
            consecutive: 0,
            best: None,
        }
    }

    pub fn params(&self) -> &StabilityParams {
        &self.params
    }

    /// Start (or restart) the run, clearing all collected state.
    pub fn start(&mut self, now: Instant) {
        self.phase = Phase::Running { started: now };
        self.consecutive = 0;
        self.best = None;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    pub fn stable_frames(&self) -> u32 {
        self.consecutive
    }

    pub fn best_score(&self) -> Option<f32> {
        self.best.as_ref().map(|(_, s)| *s)
    }

    /// Feed one frame. `sample` is `None` when no face was detected.
    pub fn observe(&mut self, sample: Option<(T, f32)>, now: Instant) -> Tick<T> {
        let Phase::Running { started } = self.phase else {
            return Tick::Inactive;
        };

        let score = match sample {
            Some((value, raw)) => {
                let score = clamp_score(raw);
                let improves = self.best.as_ref().map_or(true, |(_, best)| score > *best);
                if improves {
                    self.best = Some((value, score));
                }
                Some(score)
            }
            None => None,
        };

        match score {
            Some(s) if s >= self.params.quality_target => self.consecutive += 1,
            _ => self.consecutive = 0,
        }

        if self.consecutive >= self.params.required_stable_frames {
            if let Some((best, score)) = self.best.take() {
                self.phase = Phase::Done;
                return Tick::Settled(Settlement::Stable { best, score });
            }
        }

        if now.saturating_duration_since(started) >= self.params.timeout {
            return Tick::Settled(self.settle_timeout());
        }

        Tick::Pending {
            score,
            stable_frames: self.consecutive,
        }
    }

    /// Resolve a run whose deadline passed without a frame arriving.
    pub fn expire(&mut self, now: Instant) -> Tick<T> {
        match self.phase {
            Phase::Running { started }
                if now.saturating_duration_since(started) >= self.params.timeout =>
            {
                Tick::Settled(self.settle_timeout())
            }
            Phase::Running { .. } => Tick::Pending {
                score: None,
                stable_frames: self.consecutive,
            },
            _ => Tick::Inactive,
        }
    }

    /// Stop without settling. Further frames are ignored.
    pub fn cancel(&mut self) {
        self.phase = Phase::Done;
        self.best = None;
    }

    fn settle_timeout(&mut self) -> Settlement<T> {
        self.phase = Phase::Done;
        match self.best.take() {
            Some((best, score)) if score >= self.params.fallback_floor => {
                Settlement::Fallback { best, score }
            }
            best => Settlement::Failed { best },
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
