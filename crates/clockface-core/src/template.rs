//! Template serialization.
//!
//! Canonical templates are versioned JSON objects:
//! `{"version":1,"descriptor":[...]}`. Anything else is handed to
//! [`legacy`], which understands the formats written before versioning.

pub mod legacy;

use crate::types::{Descriptor, DescriptorError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version written by [`serialize`].
pub const TEMPLATE_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("malformed template: {0}")]
    Malformed(String),
    #[error("unsupported template version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("cannot average an empty descriptor list")]
    Empty,
}

#[derive(Serialize, Deserialize)]
struct CanonicalTemplate {
    version: u32,
    descriptor: Descriptor,
}

/// Encode a descriptor in the canonical format.
pub fn serialize(descriptor: &Descriptor) -> String {
    let record = CanonicalTemplate {
        version: TEMPLATE_VERSION,
        descriptor: descriptor.clone(),
    };
    // A struct of a u32 and finite floats cannot fail to encode.
    serde_json::to_string(&record).unwrap_or_default()
}

/// Decode a stored template, upgrading legacy encodings transparently.
pub fn deserialize(raw: &str) -> Result<Descriptor, TemplateError> {
    if raw.contains(legacy::SEGMENT_DELIMITER) {
        return legacy::decode(raw);
    }
    match decode_canonical(raw) {
        Some(result) => result,
        None => legacy::decode(raw),
    }
}

/// True if `raw` is already in the current canonical format.
pub fn is_canonical(raw: &str) -> bool {
    matches!(decode_canonical(raw), Some(Ok(_)))
}

/// Re-encode any readable template in the canonical format.
pub fn migrate(raw: &str) -> Result<String, TemplateError> {
    deserialize(raw).map(|d| serialize(&d))
}

/// `None` when `raw` is not a canonical object at all, so the caller can try
/// the legacy decoder. A canonical object with bad content is an error.
pub(crate) fn decode_canonical(raw: &str) -> Option<Result<Descriptor, TemplateError>> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return Some(Err(TemplateError::Malformed(e.to_string()))),
    };

    Some(match serde_json::from_value::<CanonicalTemplate>(value) {
        Ok(t) if t.version == TEMPLATE_VERSION => Ok(t.descriptor),
        Ok(t) => Err(TemplateError::UnsupportedVersion(t.version)),
        Err(e) => Err(TemplateError::Malformed(e.to_string())),
    })
}

/// Elementwise mean of same-length descriptors.
///
/// Sums in f64 so the result does not depend on input order.
pub fn average(descriptors: &[Descriptor]) -> Result<Descriptor, TemplateError> {
    let first = descriptors.first().ok_or(TemplateError::Empty)?;
    if descriptors.len() == 1 {
        return Ok(first.clone());
    }

    let mut sums = vec![0.0f64; first.values().len()];
    for d in descriptors {
        for (sum, v) in sums.iter_mut().zip(d.values()) {
            *sum += f64::from(*v);
        }
    }

    let n = descriptors.len() as f64;
    let values = sums.into_iter().map(|s| (s / n) as f32).collect();
    Ok(Descriptor::new(values)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DESCRIPTOR_LEN;

    fn sample(seed: f32) -> Descriptor {
        Descriptor::new(
            (0..DESCRIPTOR_LEN)
                .map(|i| ((i as f32 * 0.37 + seed).sin() * 0.2))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_roundtrip_exact() {
        let d = sample(1.3);
        let encoded = serialize(&d);
        assert!(encoded.starts_with("{\"version\":1,"));
        assert_eq!(deserialize(&encoded).unwrap(), d);
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let d = sample(0.7);
        assert_eq!(serialize(&d), serialize(&d.clone()));
    }

    #[test]
    fn test_average_single_is_identity() {
        let d = sample(2.0);
        assert_eq!(average(std::slice::from_ref(&d)).unwrap(), d);
    }

    #[test]
    fn test_average_order_independent() {
        let a = Descriptor::splat(0.25).unwrap();
        let b = Descriptor::splat(-0.5).unwrap();
        let c = Descriptor::splat(1.75).unwrap();
        let forward = average(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let shuffled = average(&[c.clone(), a.clone(), b.clone()]).unwrap();
        let reversed = average(&[c, b, a]).unwrap();
        assert_eq!(forward, shuffled);
        assert_eq!(forward, reversed);
        assert_eq!(forward.values()[0], 0.5);
    }

    #[test]
    fn test_average_of_identical_is_exact() {
        let d = sample(0.1);
        let six = vec![d.clone(); 6];
        assert_eq!(average(&six).unwrap(), d);
    }

    #[test]
    fn test_average_empty_is_error() {
        assert_eq!(average(&[]).unwrap_err(), TemplateError::Empty);
    }

    #[test]
    fn test_canonical_with_bad_version() {
        let raw = format!(
            "{{\"version\":7,\"descriptor\":{}}}",
            serde_json::to_string(&vec![0.0f32; DESCRIPTOR_LEN]).unwrap()
        );
        assert_eq!(deserialize(&raw).unwrap_err(), TemplateError::UnsupportedVersion(7));
        assert!(!is_canonical(&raw));
    }

    #[test]
    fn test_canonical_with_short_descriptor_is_malformed() {
        let raw = "{\"version\":1,\"descriptor\":[0.1,0.2]}";
        assert!(matches!(deserialize(raw), Err(TemplateError::Malformed(_))));
    }

    #[test]
    fn test_migrate_upgrades_legacy() {
        let d = sample(3.0);
        let legacy = serde_json::to_string(d.values()).unwrap();
        assert!(!is_canonical(&legacy));
        let migrated = migrate(&legacy).unwrap();
        assert!(is_canonical(&migrated));
        assert_eq!(deserialize(&migrated).unwrap(), d);
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(deserialize("not a template"), Err(TemplateError::Malformed(_))));
        assert!(matches!(deserialize(""), Err(TemplateError::Malformed(_))));
    }
}
