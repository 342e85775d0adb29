//! Decoder for templates stored before the versioned format existed.
//!
//! Two shapes are accepted:
//! - a bare JSON array of descriptor components;
//! - several descriptors joined with `|`, which decode to their average.
//!
//! Segments of a joined template may themselves be canonical objects.

use super::{average, decode_canonical, TemplateError};
use crate::types::Descriptor;

/// Separator used by the multi-descriptor format.
pub const SEGMENT_DELIMITER: char = '|';

pub fn decode(raw: &str) -> Result<Descriptor, TemplateError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TemplateError::Malformed("empty template".into()));
    }

    if !raw.contains(SEGMENT_DELIMITER) {
        return decode_segment(raw);
    }

    let descriptors = raw
        .split(SEGMENT_DELIMITER)
        .enumerate()
        .map(|(i, segment)| {
            decode_segment(segment).map_err(|e| match e {
                TemplateError::Malformed(msg) => {
                    TemplateError::Malformed(format!("segment {i}: {msg}"))
                }
                other => other,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    tracing::warn!(
        segments = descriptors.len(),
        "decoded legacy multi-descriptor template; re-enroll or migrate to the versioned format"
    );

    average(&descriptors)
}

fn decode_segment(segment: &str) -> Result<Descriptor, TemplateError> {
    if let Some(result) = decode_canonical(segment) {
        return result;
    }
    let values: Vec<f32> = serde_json::from_str(segment.trim())
        .map_err(|e| TemplateError::Malformed(e.to_string()))?;
    Ok(Descriptor::new(values)?)
}
