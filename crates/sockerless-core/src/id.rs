//! Identifier and name helpers.

use rand::Rng;

/// Length of a full object id in hex characters.
pub const ID_LEN: usize = 64;

/// Minimum prefix length accepted for short-id resolution.
pub const MIN_PREFIX_LEN: usize = 12;

/// Generates a 64-character lowercase hex id from 32 random bytes.
#[must_use]
pub fn generate_id() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Generates a container name (`/` plus 12 hex characters).
#[must_use]
pub fn generate_name() -> String {
    let bytes: [u8; 6] = rand::thread_rng().gen();
    format!("/{}", hex::encode(bytes))
}

/// Returns the 12-character display form of an id.
#[must_use]
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    &id[..id.len().min(MIN_PREFIX_LEN)]
}

/// Whether `s` is non-empty lowercase hex.
#[must_use]
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Normalizes a container name to its canonical `/name` form.
#[must_use]
pub fn canonical_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// Checks a user-supplied container name (without the leading slash).
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let name = name.strip_prefix('/').unwrap_or(name);
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
