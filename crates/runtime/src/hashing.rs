//! Deterministic hashing: request fingerprints, actor references, and
//! stable tie-breaks.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical JSON: object keys sorted, compact separators, no trailing
/// whitespace. Two semantically equal payloads always produce the same text.
pub fn canonical_json(value: &Value) -> String {
    fn write_value(out: &mut String, value: &Value) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write_value(out, &map[*key]);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(out, item);
                }
                out.push(']');
            }
            other => {
                out.push_str(&serde_json::to_string(other).unwrap_or_default());
            }
        }
    }

    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Fingerprint of a request payload for idempotency comparison.
pub fn request_hash(payload: &Value) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

/// Deterministic actor reference derived from an access token. The raw token
/// never reaches storage.
pub fn token_actor_ref(role: &str, token: &str) -> String {
    let digest = sha256_hex(token.as_bytes());
    format!("{}:{}", role, &digest[..16])
}

/// Stable index pick for tie-breaking: first four digest bytes interpreted
/// big-endian, modulo `len`.
pub fn stable_index(seed: &str, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix as usize) % len
}
