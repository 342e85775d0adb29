//! Collaborators the engine consumes: template persistence and the
//! verification threshold setting.

use crate::types::StoredTemplate;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Lowest threshold the engine will honor.
pub const MIN_THRESHOLD: u8 = 50;
/// Highest threshold the engine will honor.
pub const MAX_THRESHOLD: u8 = 100;
/// Threshold used when nothing is configured.
pub const DEFAULT_THRESHOLD: u8 = 80;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("template store unavailable: {0}")]
    Unavailable(String),
    #[error("template store rejected write: {0}")]
    WriteRejected(String),
}

/// Persistence for enrolled templates, keyed by employee id.
pub trait TemplateRepository: Send + Sync {
    /// Store a template, replacing any previous enrollment wholesale.
    fn put_template(&self, employee_id: &str, template: &StoredTemplate)
        -> Result<(), RepositoryError>;

    /// Serialized descriptor for an employee, if enrolled.
    fn get_template(&self, employee_id: &str) -> Result<Option<String>, RepositoryError>;
}

/// Source of the verification threshold, read once per session.
pub trait ThresholdSource: Send + Sync {
    fn threshold(&self) -> u8;
}

/// Clamp a configured threshold into the supported range.
pub fn clamp_threshold(raw: u8) -> u8 {
    raw.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

/// Fixed threshold, clamped into 50–100.
#[derive(Debug, Clone, Copy)]
pub struct StaticThreshold(pub u8);

impl Default for StaticThreshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

impl ThresholdSource for StaticThreshold {
    fn threshold(&self) -> u8 {
        clamp_threshold(self.0)
    }
}

/// In-process template store.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    templates: Mutex<HashMap<String, StoredTemplate>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full record for an employee, including the training score.
    pub fn record(&self, employee_id: &str) -> Option<StoredTemplate> {
        self.templates
            .lock()
            .ok()
            .and_then(|map| map.get(employee_id).cloned())
    }

    pub fn insert_raw(&self, employee_id: &str, serialized: impl Into<String>) {
        if let Ok(mut map) = self.templates.lock() {
            map.insert(
                employee_id.to_string(),
                StoredTemplate {
                    serialized: serialized.into(),
                    training_score: 0.0,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.templates.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TemplateRepository for MemoryRepository {
    fn put_template(
        &self,
        employee_id: &str,
        template: &StoredTemplate,
    ) -> Result<(), RepositoryError> {
        let mut map = self
            .templates
            .lock()
            .map_err(|_| RepositoryError::Unavailable("lock poisoned".into()))?;
        map.insert(employee_id.to_string(), template.clone());
        Ok(())
    }

    fn get_template(&self, employee_id: &str) -> Result<Option<String>, RepositoryError> {
        let map = self
            .templates
            .lock()
            .map_err(|_| RepositoryError::Unavailable("lock poisoned".into()))?;
        Ok(map.get(employee_id).map(|t| t.serialized.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_clamped() {
        assert_eq!(StaticThreshold(20).threshold(), 50);
        assert_eq!(StaticThreshold(180).threshold(), 100);
        assert_eq!(StaticThreshold::default().threshold(), 80);
    }

    #[test]
    fn test_put_overwrites_wholesale() {
        let repo = MemoryRepository::new();
        let first = StoredTemplate {
            serialized: "a".into(),
            training_score: 88.5,
        };
        let second = StoredTemplate {
            serialized: "b".into(),
            training_score: 91.0,
        };
        repo.put_template("emp-1", &first).unwrap();
        repo.put_template("emp-1", &second).unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get_template("emp-1").unwrap().as_deref(), Some("b"));
        assert_eq!(repo.record("emp-1").unwrap().training_score, 91.0);
        assert_eq!(repo.get_template("emp-2").unwrap(), None);
    }
}
