//! Embedding (de)serialization at the storage boundary.
//!
//! The stored form is a BLOB of little-endian `f32`s. Rows imported from
//! vector-typed columns may instead hold TEXT such as `"[0.1,0.2,0.3]"`;
//! [`embedding_from_sql`] accepts both and is the only decode step.
//! Every parser returns `None` on bad input instead of failing the caller.

use rusqlite::types::ValueRef;

const F32_BYTES: usize = std::mem::size_of::<f32>();

pub fn encode_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_blob(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % F32_BYTES != 0 {
        return None;
    }
    let values: Vec<f32> = bytes
        .chunks_exact(F32_BYTES)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    values.iter().all(|v| v.is_finite()).then_some(values)
}

/// Bracketed form, `"[0.1,0.2,0.3]"`.
pub fn format_text(values: &[f32]) -> String {
    let body: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", body.join(","))
}

/// Parse a bracketed or bare comma-separated vector.
pub fn parse_text(raw: &str) -> Option<Vec<f32>> {
    let trimmed = raw.trim();
    let body = match (trimmed.strip_prefix('['), trimmed.strip_suffix(']')) {
        (Some(_), Some(_)) => &trimmed[1..trimmed.len() - 1],
        (None, None) => trimmed,
        _ => return None,
    };
    if body.trim().is_empty() {
        return None;
    }
    body.split(',')
        .map(|part| part.trim().parse::<f32>().ok().filter(|v| v.is_finite()))
        .collect()
}

/// Decode whatever the embedding column holds.
pub fn embedding_from_sql(value: ValueRef<'_>) -> Option<Vec<f32>> {
    match value {
        ValueRef::Blob(bytes) => decode_blob(bytes),
        ValueRef::Text(text) => std::str::from_utf8(text).ok().and_then(parse_text),
        _ => None,
    }
}
