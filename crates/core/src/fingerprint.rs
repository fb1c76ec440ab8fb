//! Non-sensitive derivations of a raw API key.

const SEPARATOR: char = '-';
const FINGERPRINT_LEN: usize = 6;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Short display fragment: the last six non-separator characters of `secret`,
/// or all of them when fewer remain.
pub fn fingerprint(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().filter(|ch| *ch != SEPARATOR).collect();
    let start = chars.len().saturating_sub(FINGERPRINT_LEN);
    chars[start..].iter().collect()
}

/// FNV-1a over the UTF-16 code units of `secret`, rendered as 8 hex digits.
///
/// Only used to correlate log lines with a key. Not a security mechanism.
pub fn auth_hash(secret: &str) -> String {
    let hash = secret.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    });
    format!("{hash:08x}")
}
