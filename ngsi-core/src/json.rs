//! JSON helpers

use crate::error::{NgsiError, NgsiResult};

/// `true` if the first byte after leading blanks opens an object or array
pub fn is_json(data: &[u8]) -> bool {
    matches!(
        data.iter().find(|b| !matches!(b, b' ' | b'\t')),
        Some(b'{' | b'[')
    )
}

/// Re-indent a JSON document with two spaces, keeping key order and number text
pub fn indent(data: &[u8]) -> NgsiResult<String> {
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| NgsiError::with_source("jsonIndent", 1, e))?;
    serde_json::to_string_pretty(&value).map_err(|e| NgsiError::with_source("jsonIndent", 2, e))
}
