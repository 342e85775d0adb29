use crate::accumulator::StabilityParams;
use crate::repository::{clamp_threshold, DEFAULT_THRESHOLD, MAX_THRESHOLD, MIN_THRESHOLD};
use crate::scorer::Calibration;
use crate::types::{training_plan, TrainingStep, DEFAULT_INSTRUCTIONS};
use crate::verification::VerificationSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration: calibration and stability defaults, all tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between scheduled frames.
    pub frame_interval_ms: u64,
    /// Threshold used when the caller has no threshold source of its own.
    pub default_threshold: u8,
    /// Pose instructions for the enrollment steps, in order.
    pub steps: Vec<String>,
    pub enrollment: StabilityParams,
    pub verification: VerificationSettings,
    pub calibration: Calibration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 33,
            default_threshold: DEFAULT_THRESHOLD,
            steps: DEFAULT_INSTRUCTIONS.iter().map(|s| s.to_string()).collect(),
            enrollment: StabilityParams::enrollment(),
            verification: VerificationSettings::default(),
            calibration: Calibration::default(),
        }
    }
}

impl EngineConfig {
    /// Parse TOML. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file (absent file → defaults), then apply `CLOCKFACE_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.display().to_string(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            Some(p) => {
                tracing::debug!(path = %p.display(), "config file not found; using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let parse_u32 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u32>().ok());
        let parse_f32 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f32>().ok());

        if let Some(v) = parse("CLOCKFACE_FRAME_INTERVAL_MS") {
            self.frame_interval_ms = v;
        }
        if let Some(v) = parse("CLOCKFACE_THRESHOLD") {
            self.default_threshold = clamp_threshold(v.min(u64::from(u8::MAX)) as u8);
        }
        if let Some(v) = parse_u32("CLOCKFACE_ENROLL_STABLE_FRAMES") {
            self.enrollment.required_stable_frames = v;
        }
        if let Some(v) = parse_f32("CLOCKFACE_ENROLL_QUALITY_TARGET") {
            self.enrollment.quality_target = v;
        }
        if let Some(v) = parse_f32("CLOCKFACE_ENROLL_FALLBACK_FLOOR") {
            self.enrollment.fallback_floor = v;
        }
        if let Some(v) = parse("CLOCKFACE_ENROLL_TIMEOUT_MS") {
            self.enrollment.timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_u32("CLOCKFACE_VERIFY_STABLE_FRAMES") {
            self.verification.stable_frames = v;
        }
        if let Some(v) = parse("CLOCKFACE_VERIFY_TIMEOUT_MS") {
            self.verification.timeout = Duration::from_millis(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.frame_interval_ms == 0 {
            return invalid("frame_interval_ms must be positive".into());
        }
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&self.default_threshold) {
            return invalid(format!(
                "default_threshold {} outside {MIN_THRESHOLD}..={MAX_THRESHOLD}",
                self.default_threshold
            ));
        }
        let e = &self.enrollment;
        if e.required_stable_frames == 0 {
            return invalid("enrollment.required_stable_frames must be positive".into());
        }
        if !(0.0..=100.0).contains(&e.quality_target) || !(0.0..=100.0).contains(&e.fallback_floor) {
            return invalid("enrollment scores must lie within 0–100".into());
        }
        if e.fallback_floor > e.quality_target {
            return invalid(format!(
                "enrollment.fallback_floor {} above quality_target {}",
                e.fallback_floor, e.quality_target
            ));
        }
        if e.timeout.is_zero() || self.verification.timeout.is_zero() {
            return invalid("timeouts must be positive".into());
        }
        if self.verification.stable_frames == 0 {
            return invalid("verification.stable_frames must be positive".into());
        }
        if self.steps.is_empty() {
            return invalid("at least one enrollment step is required".into());
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn training_plan(&self) -> Vec<TrainingStep> {
        training_plan(&self.steps)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.training_plan().len(), 6);
        assert_eq!(config.enrollment.required_stable_frames, 15);
        assert_eq!(config.verification.stable_frames, 10);
        assert_eq!(config.verification.timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            default_threshold = 85

            [verification]
            stable_frames = 12
            timeout_ms = 15000
            "#,
        )
        .unwrap();
        assert_eq!(config.default_threshold, 85);
        assert_eq!(config.verification.stable_frames, 12);
        assert_eq!(config.verification.timeout, Duration::from_millis(15000));
        assert_eq!(config.enrollment, StabilityParams::enrollment());
        assert_eq!(config.calibration, Calibration::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_floor_above_target() {
        let err = EngineConfig::from_toml(
            r#"
            [enrollment]
            required_stable_frames = 15
            quality_target = 60.0
            fallback_floor = 70.0
            timeout_ms = 45000
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fallback_floor"), "{err}");
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        assert!(EngineConfig::from_toml("default_threshold = 30").is_err());
    }

    #[test]
    fn test_rejects_empty_steps() {
        assert!(EngineConfig::from_toml("steps = []").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CLOCKFACE_THRESHOLD", "95"),
            ("CLOCKFACE_ENROLL_TIMEOUT_MS", "30000"),
            ("CLOCKFACE_VERIFY_STABLE_FRAMES", "5"),
            ("CLOCKFACE_FRAME_INTERVAL_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.default_threshold, 95);
        assert_eq!(config.enrollment.timeout, Duration::from_secs(30));
        assert_eq!(config.verification.stable_frames, 5);
        assert_eq!(config.frame_interval_ms, 33);
    }

    #[test]
    fn test_env_out_of_range_frame_counts_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("CLOCKFACE_ENROLL_STABLE_FRAMES", "4294967297"),
            ("CLOCKFACE_VERIFY_STABLE_FRAMES", "-3"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.enrollment.required_stable_frames, 15);
        assert_eq!(config.verification.stable_frames, 10);
    }

    #[test]
    fn test_env_threshold_is_clamped() {
        let mut config = EngineConfig::default();
        config.apply_env(|k| (k == "CLOCKFACE_THRESHOLD").then(|| "20".to_string()));
        assert_eq!(config.default_threshold, 50);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = EngineConfig::load(Some(Path::new("/nonexistent/clockface.toml"))).unwrap();
        assert_eq!(config.steps.len(), 6);
    }
}
