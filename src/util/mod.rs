//! Utility module
//!
//! Small helpers shared across the crate.

/// Percent-encodes `raw` so it can be embedded in a task or log name.
///
/// ASCII letters, digits and `-_.~` pass through unchanged.
pub fn encode_name(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
