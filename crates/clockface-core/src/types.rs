use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of components in every face descriptor.
pub const DESCRIPTOR_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("expected {DESCRIPTOR_LEN}-dim descriptor, got {0}")]
    WrongLength(usize),
    #[error("descriptor component {index} is not finite")]
    NonFinite { index: usize },
}

/// Face descriptor produced by the detector for a single frame.
///
/// Always exactly [`DESCRIPTOR_LEN`] finite values. There is no way to mutate
/// a descriptor after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_LEN {
            return Err(DescriptorError::WrongLength(values.len()));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    /// Descriptor with every component set to `value`.
    pub fn splat(value: f32) -> Result<Self, DescriptorError> {
        Self::new(vec![value; DESCRIPTOR_LEN])
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Compute Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.values
    }
}

/// One face found by the detector in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub descriptor: Descriptor,
    /// Detector-reported quality, 0–100.
    pub quality: f32,
}

impl Detection {
    pub fn new(descriptor: Descriptor, quality: f32) -> Self {
        Self {
            descriptor,
            quality: clamp_score(quality),
        }
    }
}

/// One pose in the enrollment plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStep {
    pub index: usize,
    pub instruction: String,
    pub completed: bool,
    pub score: Option<f32>,
}

impl TrainingStep {
    pub fn new(index: usize, instruction: impl Into<String>) -> Self {
        Self {
            index,
            instruction: instruction.into(),
            completed: false,
            score: None,
        }
    }
}

/// Default pose instructions, in capture order.
pub const DEFAULT_INSTRUCTIONS: [&str; 6] = [
    "Look straight at the camera",
    "Turn your head slightly to the left",
    "Turn your head slightly to the right",
    "Tilt your head slightly up",
    "Tilt your head slightly down",
    "Relax your face and look straight again",
];

/// Build a fresh step plan from a list of instructions.
pub fn training_plan<S: AsRef<str>>(instructions: &[S]) -> Vec<TrainingStep> {
    instructions
        .iter()
        .enumerate()
        .map(|(i, text)| TrainingStep::new(i, text.as_ref()))
        .collect()
}

/// A persisted enrollment result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTemplate {
    /// Output of [`crate::template::serialize`].
    pub serialized: String,
    /// Mean per-step quality, 0–100, two decimals.
    pub training_score: f64,
}

/// Clamp a score into [0, 100]. NaN becomes 0.
pub fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}
