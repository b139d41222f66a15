//! Structured-output decoding at the provider boundary.
//!
//! Completions requested with a [`ResponseSchema`](super::ResponseSchema) are
//! decoded into typed structs here. Anything that does not deserialize is a
//! [`ProviderError::Malformed`], never a loosely-typed value handed downstream.

use serde::de::DeserializeOwned;

use super::error::ProviderError;

/// Decode the first JSON object in `raw` into `T`.
pub fn decode<T: DeserializeOwned>(schema: &str, raw: &str) -> Result<T, ProviderError> {
    let json_str = extract_json(raw);
    if json_str.is_empty() {
        return Err(ProviderError::malformed(schema, "empty completion"));
    }
    serde_json::from_str(json_str).map_err(|e| ProviderError::malformed(schema, e.to_string()))
}

/// Extract JSON object from response (handles models that add surrounding text
/// or wrap the object in a code fence).
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    let remainder = &trimmed[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }

    trimmed
}
