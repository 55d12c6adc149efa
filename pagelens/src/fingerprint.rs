//! Content fingerprinting for de-duplication.
//!
//! The fingerprint is derived from normalized title + content, so
//! whitespace and casing differences do not produce distinct
//! fingerprints. sha-256 truncated to 64 bits gives a stable,
//! well-distributed identifier across process restarts.

use sha2::{Digest, Sha256};

/// Compute a 16-hex-char fingerprint over normalized title + content.
///
/// Equal normalized input always yields an equal fingerprint; any
/// single-character change in either field yields a different one.
pub fn fingerprint(title: &str, content: &str) -> String {
    let normalized = format!("{}\n{}", normalize(title), normalize(content));
    let digest = Sha256::digest(normalized.as_bytes());
    let word = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    format!("{word:016x}")
}

/// Lowercase and collapse all whitespace runs to single spaces.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
