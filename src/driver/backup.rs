//! Backup code generation and matching.
//!
//! Codes are drawn from digits plus uppercase letters with `I` and `O`
//! removed, so a code read over the phone or from a printout cannot be
//! mistyped as `1` or `0`. Display form groups the characters with a hyphen
//! every four. Matching normalizes first (hyphens stripped, uppercased) and
//! compares in constant time.

use rand::rngs::OsRng;
use rand::Rng;
use subtle::ConstantTimeEq;

/// No `I`, no `O`.
const CHARSET: &[u8] = b"0123456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Characters per hyphen-separated group in display form.
const GROUP: usize = 4;

/// Generate one backup code of `length` characters in display form.
#[must_use]
pub fn generate_code(length: usize) -> String {
    let mut rng = OsRng;
    let mut out = String::with_capacity(length + length / GROUP);
    for i in 0..length {
        if i > 0 && i % GROUP == 0 {
            out.push('-');
        }
        let idx = rng.gen_range(0..CHARSET.len());
        out.push(CHARSET[idx] as char);
    }
    out
}

/// Generate a batch of backup codes.
#[must_use]
pub fn generate_codes(count: usize, length: usize) -> Vec<String> {
    (0..count).map(|_| generate_code(length)).collect()
}

/// Strip separators and uppercase, so user input in any form compares
/// against the stored display form.
#[must_use]
pub fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Constant-time equality of two codes after normalization.
#[must_use]
pub fn codes_match(stored: &str, candidate: &str) -> bool {
    let stored = normalize(stored);
    let candidate = normalize(candidate);
    if stored.len() != candidate.len() {
        return false;
    }
    stored.as_bytes().ct_eq(candidate.as_bytes()).into()
}
