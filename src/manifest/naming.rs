//! # Naming
//!
//! Generated object names have the form `<base>-<scope-hash>-<counter>`:
//!
//! - `base` comes from `metadata.name`, `metadata.generateName` or `kfx-<kind>`
//! - `scope-hash` is the first 8 hex characters of SHA-256 over the scope id
//! - `counter` is a per-scope monotonic counter
//!
//! The result is always a valid DNS-1123 label so the API server accepts it.

use crate::constants::MAX_NAME_LEN;
use sha2::{Digest, Sha256};

/// Number of hex characters of the scope digest kept in names and labels
const SCOPE_HASH_LEN: usize = 8;

/// Short, label-safe digest of a scope id
#[must_use]
pub fn scope_hash(scope_id: &str) -> String {
    let digest = Sha256::digest(scope_id.as_bytes());
    let mut hex = String::with_capacity(SCOPE_HASH_LEN);
    for byte in digest.iter().take(SCOPE_HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Build `<base>-<scope_hash>-<counter>`, truncating the base to fit 63 characters
#[must_use]
pub fn generate_name(base: &str, scope_hash: &str, counter: u64) -> String {
    let suffix = format!("-{scope_hash}-{counter}");
    let mut base = sanitize(base);
    if base.is_empty() {
        base = crate::constants::GENERATED_NAME_PREFIX.to_string();
    }

    let budget = MAX_NAME_LEN.saturating_sub(suffix.len());
    if base.len() > budget {
        base.truncate(budget);
        while base.ends_with('-') {
            base.pop();
        }
    }
    format!("{base}{suffix}")
}

/// Lowercase and replace anything outside `[a-z0-9-]`, trimming leading and trailing dashes
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

/// RFC 1123 label: 1-63 chars of `[a-z0-9-]`, alphanumeric at both ends
#[must_use]
pub fn is_dns1123_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
