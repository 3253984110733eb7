//! Hashing System - SHA-256 Fingerprints
//!
//! Content hashes let callers check that identical inputs produced an
//! identical document, and give audit logs a stable request identity.

use sha2::{Sha256, Digest};
use serde::Serialize;
use serde_json::{Value, to_string};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => {
            Value::Array(arr.iter().map(sort_value).collect())
        }
        _ => v.clone()
    }
}

/// Hash of pixel content plus geometry, independent of how the image was encoded.
pub fn image_fingerprint(width: u32, height: u32, color: &str, pixels: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{width}x{height}:{color}:").as_bytes());
    hasher.update(pixels);
    hex::encode(hasher.finalize())
}

/// Request fingerprint for audit logging
/// fingerprint = sha256(canonical_payload + ":" + table_version + ":" + engine_version)
pub fn compute_request_fingerprint(
    payload: &impl Serialize,
    table_version: &str,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_payload = canonical_json(payload)?;
    let combined = format!("{}:{}:{}", canonical_payload, table_version, engine_version);
    Ok(sha256_hex(combined.as_bytes()))
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
