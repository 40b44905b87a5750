//! Failure fingerprints.
//!
//! Two failures share a fingerprint when their error text is the same after
//! volatile parts (numbers, hex ids, uuids, spacing, case) are stripped, so
//! "timeout after 3012ms on job 7f3a..." and "Timeout after 2990ms on job
//! 19bc..." collapse to one identifier.

use sha2::{Digest, Sha256};

/// Normalise an error message for fingerprinting.
pub fn normalize(error: &str) -> String {
    let lower = error.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    for word in lower.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&normalize_word(word));
    }
    out
}

fn normalize_word(word: &str) -> String {
    let stripped = word.trim_matches(|c: char| !c.is_alphanumeric());
    let hexish = stripped.len() >= 8
        && stripped.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
        && stripped.chars().any(|c| c.is_ascii_digit());
    if hexish {
        return word.replace(stripped, "<id>");
    }
    let mut out = String::with_capacity(word.len());
    let mut in_digits = false;
    for c in word.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
        } else {
            in_digits = false;
            out.push(c);
        }
    }
    out
}

/// Stable hex fingerprint of an error message.
pub fn fingerprint(error: &str) -> String {
    let digest = Sha256::digest(normalize(error).as_bytes());
    hex::encode(&digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_parts_collapse() {
        let a = fingerprint("Timeout after 3012ms on job 7f3a9c0e1b");
        let b = fingerprint("timeout  after 2990ms on job 19bc44d2aa");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_errors_differ() {
        assert_ne!(fingerprint("connection refused"), fingerprint("permission denied"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Rate   limited: 429 "), "rate limited: #");
        assert_eq!(
            normalize("task 550e8400-e29b-41d4-a716-446655440000 failed"),
            "task <id> failed"
        );
    }

    #[test]
    fn test_fingerprint_is_hex() {
        let fp = fingerprint("boom");
        assert_eq!(fp.len(), 24);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
