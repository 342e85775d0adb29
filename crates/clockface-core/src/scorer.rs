//! Descriptor distance and the distance → similarity calibration curve.

use crate::types::Descriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration needs at least two knots")]
    TooFewKnots,
    #[error("first calibration knot must sit at distance 0")]
    MissingOrigin,
    #[error("knot {0}: distances must be strictly increasing")]
    DistanceNotIncreasing(usize),
    #[error("knot {0}: similarity must not increase with distance")]
    SimilarityIncreasing(usize),
    #[error("knot {0}: similarity outside 0–100")]
    SimilarityOutOfRange(usize),
}

/// One point on the calibration curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Knot {
    pub distance: f32,
    pub similarity: f32,
}

const fn knot(distance: f32, similarity: f32) -> Knot {
    Knot {
        distance,
        similarity,
    }
}

/// Piecewise-linear mapping from euclidean distance to a similarity percentage.
///
/// Between knots the similarity is linearly interpolated. Past the last knot
/// the curve stays at that knot's similarity (0 by default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Knot>", into = "Vec<Knot>")]
pub struct Calibration {
    knots: Vec<Knot>,
}

/// Empirically tuned default: 0.4 → 90%, 0.6 → 70%, 0.8 → 40%, 1.2 → 0%.
pub const DEFAULT_KNOTS: [Knot; 5] = [
    knot(0.0, 100.0),
    knot(0.4, 90.0),
    knot(0.6, 70.0),
    knot(0.8, 40.0),
    knot(1.2, 0.0),
];

impl Default for Calibration {
    fn default() -> Self {
        Self {
            knots: DEFAULT_KNOTS.to_vec(),
        }
    }
}

impl Calibration {
    pub fn new(knots: Vec<Knot>) -> Result<Self, CalibrationError> {
        if knots.len() < 2 {
            return Err(CalibrationError::TooFewKnots);
        }
        if knots[0].distance != 0.0 {
            return Err(CalibrationError::MissingOrigin);
        }
        for (i, k) in knots.iter().enumerate() {
            if !(0.0..=100.0).contains(&k.similarity) {
                return Err(CalibrationError::SimilarityOutOfRange(i));
            }
        }
        for (i, pair) in knots.windows(2).enumerate() {
            if !(pair[1].distance > pair[0].distance) {
                return Err(CalibrationError::DistanceNotIncreasing(i + 1));
            }
            if pair[1].similarity > pair[0].similarity {
                return Err(CalibrationError::SimilarityIncreasing(i + 1));
            }
        }
        Ok(Self { knots })
    }

    pub fn knots(&self) -> &[Knot] {
        &self.knots
    }

    /// Map a distance to an integer similarity percentage.
    pub fn similarity(&self, distance: f32) -> u8 {
        if distance.is_nan() {
            return 0;
        }
        let d = distance.max(0.0);

        let raw = match self.knots.windows(2).find(|pair| d <= pair[1].distance) {
            Some(pair) => {
                let (lo, hi) = (pair[0], pair[1]);
                let t = (hi.distance - d) / (hi.distance - lo.distance);
                hi.similarity + t * (lo.similarity - hi.similarity)
            }
            None => self.knots[self.knots.len() - 1].similarity,
        };

        raw.round().clamp(0.0, 100.0) as u8
    }
}

impl TryFrom<Vec<Knot>> for Calibration {
    type Error = CalibrationError;

    fn try_from(knots: Vec<Knot>) -> Result<Self, Self::Error> {
        Self::new(knots)
    }
}

impl From<Calibration> for Vec<Knot> {
    fn from(calibration: Calibration) -> Self {
        calibration.knots
    }
}

/// Euclidean distance between two descriptors.
pub fn distance(a: &Descriptor, b: &Descriptor) -> f32 {
    a.euclidean_distance(b)
}

/// Similarity percentage under the default calibration.
pub fn similarity(distance: f32) -> u8 {
    Calibration::default().similarity(distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DESCRIPTOR_LEN;

    fn ramp(offset: f32) -> Descriptor {
        Descriptor::new((0..DESCRIPTOR_LEN).map(|i| i as f32 * 0.01 + offset).collect()).unwrap()
    }

    #[test]
    fn test_distance_properties() {
        let a = ramp(0.0);
        let b = ramp(0.03);
        assert_eq!(distance(&a, &a), 0.0);
        assert!(distance(&a, &b) > 0.0);
        assert_eq!(distance(&a, &b), distance(&b, &a));
    }

    #[test]
    fn test_similarity_zero_distance_is_100() {
        assert_eq!(similarity(0.0), 100);
    }

    #[test]
    fn test_similarity_breakpoints() {
        assert_eq!(similarity(0.4), 90);
        assert_eq!(similarity(0.6), 70);
        assert_eq!(similarity(0.8), 40);
        assert_eq!(similarity(1.2), 0);
        assert_eq!(similarity(5.0), 0);
    }

    #[test]
    fn test_similarity_matches_segment_formulas() {
        // 90 + (0.4 - 0.2) / 0.4 * 10 = 95
        assert_eq!(similarity(0.2), 95);
        // 70 + (0.6 - 0.5) / 0.2 * 20 = 80
        assert_eq!(similarity(0.5), 80);
        // 40 + (0.8 - 0.7) / 0.2 * 30 = 55
        assert_eq!(similarity(0.7), 55);
        // 40 - (1.0 - 0.8) / 0.4 * 40 = 20
        assert_eq!(similarity(1.0), 20);
    }

    #[test]
    fn test_similarity_non_increasing() {
        let mut prev = similarity(0.0);
        for step in 1..=300 {
            let s = similarity(step as f32 * 0.005);
            assert!(s <= prev, "similarity rose at distance {}", step as f32 * 0.005);
            prev = s;
        }
    }

    #[test]
    fn test_similarity_nan_is_zero() {
        assert_eq!(similarity(f32::NAN), 0);
    }

    #[test]
    fn test_calibration_rejects_bad_knots() {
        assert_eq!(
            Calibration::new(vec![knot(0.0, 100.0)]).unwrap_err(),
            CalibrationError::TooFewKnots
        );
        assert_eq!(
            Calibration::new(vec![knot(0.1, 100.0), knot(1.0, 0.0)]).unwrap_err(),
            CalibrationError::MissingOrigin
        );
        assert_eq!(
            Calibration::new(vec![knot(0.0, 100.0), knot(0.5, 50.0), knot(0.5, 10.0)]).unwrap_err(),
            CalibrationError::DistanceNotIncreasing(2)
        );
        assert_eq!(
            Calibration::new(vec![knot(0.0, 80.0), knot(0.5, 90.0)]).unwrap_err(),
            CalibrationError::SimilarityIncreasing(1)
        );
    }

    #[test]
    fn test_custom_calibration() {
        let cal = Calibration::new(vec![knot(0.0, 100.0), knot(1.0, 0.0)]).unwrap();
        assert_eq!(cal.similarity(0.25), 75);
        assert_eq!(cal.similarity(2.0), 0);
    }

    #[test]
    fn test_calibration_toml_roundtrip_validates() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            calibration: Calibration,
        }
        let bad = "calibration = [{ distance = 0.5, similarity = 100.0 }, { distance = 1.0, similarity = 0.0 }]";
        assert!(toml::from_str::<Wrapper>(bad).is_err());
    }
}
